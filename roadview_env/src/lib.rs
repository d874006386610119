//! RoadView Environment Abstraction Layer
//!
//! Everything the tracking and supervision engines learn about the outside
//! world goes through this crate:
//! - Time (`Clock::now()`), so Kalman `dt` and OCR throttling can be driven
//!   by a virtual clock in tests
//! - Host load (`AdmissionProbe::system_load()`), consulted before a new
//!   feed worker is admitted
//!
//! # Example
//!
//! ```ignore
//! use roadview_env::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::shared();
//! clock.advance(Duration::from_millis(33));
//! assert_eq!(clock.now(), Duration::from_millis(33));
//! ```

mod clock;
mod error;
mod manual_clock;
mod probe;
mod types;

pub use clock::{Clock, SystemClock};
pub use error::EnvError;
pub use manual_clock::ManualClock;
pub use probe::{AdmissionProbe, StaticProbe, SysinfoProbe};
pub use types::SystemLoad;
