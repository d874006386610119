//! RoadView Feed Supervisor
//!
//! Runs one isolated worker per video feed and keeps an operator-facing
//! registry of them:
//! - **Lifecycle**: `Stopped -> Starting -> Running -> Stopped`, with `Error`
//!   reachable from `Starting`/`Running` and cleared back to `Stopped`
//! - **Admission**: new feeds are refused while host memory is over the limit
//! - **Sample feed**: a built-in scene runs whenever no user feed is active
//! - **Reader**: drains every feed's result queue, keeping only the newest
//!   frame, and publishes status changes and KPIs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FeedSupervisor                         │
//! │   registry ─ ops lock ─ sample policy ─ reader task         │
//! └───────┬──────────────────────────────┬──────────────────────┘
//!         │ WorkerLauncher               │ BroadcastSink
//!   ┌─────▼──────────┐            ┌──────▼──────────────┐
//!   │ ThreadLauncher │            │ TracingSink         │
//!   │ ProcessLauncher│            │ ChannelSink         │
//!   └─────┬──────────┘            └─────────────────────┘
//!         ▼
//!   roadview_core::WorkerLoop (one per feed)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use roadview_supervisor::{FeedSupervisor, SupervisorConfig, ProcessLauncher, TracingSink};
//! use roadview_env::SysinfoProbe;
//! use std::sync::Arc;
//!
//! let supervisor = FeedSupervisor::new(
//!     SupervisorConfig::default(),
//!     Arc::new(ProcessLauncher::current_exe()?),
//!     Arc::new(SysinfoProbe::new()),
//!     Arc::new(TracingSink),
//! );
//! let reader = supervisor.spawn_reader();
//! supervisor.apply_sample_policy().await;
//! let id = supervisor.add_and_start("/data/clip".parse()?, "north gate").await?;
//! ```

pub mod broadcast;
pub mod error;
pub mod launcher;
pub mod process;
pub mod state;
pub mod supervisor;

pub use broadcast::{
    AlertLevel, BroadcastSink, ChannelSink, FeedKpi, KpiSnapshot, SupervisorEvent, TracingSink,
};
pub use error::SupervisorError;
pub use launcher::{PartsFactory, ThreadLauncher, WorkerHandle, WorkerLauncher, WorkerProcess};
pub use process::{worker_main, ControlCommand, ProcessLauncher};
pub use state::FeedStatus;
pub use supervisor::{FeedInfo, FeedKind, FeedSupervisor, SupervisorConfig, SAMPLE_FEED_ID};
