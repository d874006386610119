//! Constant-velocity Kalman filter for image-plane vehicle tracking.
//!
//! State `x = [px, py, vx, vy]` in pixels and pixels/second, measurement
//! `z = [px, py]`. Process noise follows the discrete white-noise
//! acceleration model, so uncertainty grows with `dt` between frames.

use crate::tracking::TrackingError;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};
use serde::{Deserialize, Serialize};

/// Noise parameters for the filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Acceleration noise variance (px/s²)²
    pub accel_variance: f64,

    /// Measurement noise variance (px²)
    pub measurement_variance: f64,

    /// Initial position variance (px²)
    pub initial_position_variance: f64,

    /// Initial velocity variance (px/s)²; large because a fresh track has no motion history
    pub initial_velocity_variance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            accel_variance: 400.0,
            measurement_variance: 4.0,
            initial_position_variance: 10.0,
            initial_velocity_variance: 1000.0,
        }
    }
}

/// Kalman state for one track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanState {
    pub state: Vector4<f64>,
    pub covariance: Matrix4<f64>,
    config: KalmanConfig,
}

impl KalmanState {
    /// Initializes a filter at the measured position with zero velocity.
    pub fn new(position: [f64; 2], config: KalmanConfig) -> Self {
        let covariance = Matrix4::from_diagonal(&Vector4::new(
            config.initial_position_variance,
            config.initial_position_variance,
            config.initial_velocity_variance,
            config.initial_velocity_variance,
        ));

        Self {
            state: Vector4::new(position[0], position[1], 0.0, 0.0),
            covariance,
            config,
        }
    }

    /// Prediction step: advance the state by `dt` seconds.
    ///
    /// x' = F x
    /// P' = F P Fᵀ + Q
    pub fn predict(&mut self, dt: f64) {
        let f = Self::motion_model(dt);
        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + self.process_noise(dt);
    }

    /// Update step with a position measurement.
    ///
    /// Fails without touching the state if the innovation covariance cannot
    /// be factored or the result would not be finite.
    pub fn update(&mut self, measurement: [f64; 2]) -> Result<(), TrackingError> {
        let h = Self::measurement_matrix();
        let r = Matrix2::identity() * self.config.measurement_variance;

        // y = z - H x
        let z = Vector2::new(measurement[0], measurement[1]);
        let innovation = z - h * self.state;

        // S = H P Hᵀ + R
        let s = h * self.covariance * h.transpose() + r;
        let s_inv = s
            .cholesky()
            .ok_or(TrackingError::SingularCovariance)?
            .inverse();

        // K = P Hᵀ S⁻¹
        let k = self.covariance * h.transpose() * s_inv;

        let new_state = self.state + k * innovation;

        // Joseph form: P = (I - K H) P (I - K H)ᵀ + K R Kᵀ
        let i_kh = Matrix4::identity() - k * h;
        let new_cov = i_kh * self.covariance * i_kh.transpose() + k * r * k.transpose();

        if !new_state.iter().all(|v| v.is_finite()) || !new_cov.iter().all(|v| v.is_finite()) {
            return Err(TrackingError::NonFiniteState);
        }

        self.state = new_state;
        self.covariance = new_cov;
        Ok(())
    }

    #[inline]
    pub fn position(&self) -> [f64; 2] {
        [self.state[0], self.state[1]]
    }

    #[inline]
    pub fn velocity(&self) -> [f64; 2] {
        [self.state[2], self.state[3]]
    }

    /// Speed magnitude in px/s.
    #[inline]
    pub fn speed_px(&self) -> f64 {
        self.state[2].hypot(self.state[3])
    }

    fn motion_model(dt: f64) -> Matrix4<f64> {
        Matrix4::new(
            1.0, 0.0, dt, 0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    fn measurement_matrix() -> Matrix2x4<f64> {
        Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        )
    }

    fn process_noise(&self, dt: f64) -> Matrix4<f64> {
        let q = self.config.accel_variance;
        let dt2 = dt * dt;
        let dt3 = dt2 * dt / 2.0;
        let dt4 = dt2 * dt2 / 4.0;
        Matrix4::new(
            dt4, 0.0, dt3, 0.0,
            0.0, dt4, 0.0, dt3,
            dt3, 0.0, dt2, 0.0,
            0.0, dt3, 0.0, dt2,
        ) * q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_predict_moves_by_velocity() {
        let mut kf = KalmanState::new([0.0, 0.0], KalmanConfig::default());
        kf.state[2] = 10.0;
        kf.state[3] = -5.0;

        kf.predict(0.5);

        assert_relative_eq!(kf.position()[0], 5.0, epsilon = 1e-9);
        assert_relative_eq!(kf.position()[1], -2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_grows_uncertainty() {
        let mut kf = KalmanState::new([0.0, 0.0], KalmanConfig::default());
        let before = kf.covariance.trace();
        kf.predict(0.1);
        assert!(kf.covariance.trace() > before);
    }

    #[test]
    fn test_update_shrinks_uncertainty() {
        let mut kf = KalmanState::new([0.0, 0.0], KalmanConfig::default());
        kf.predict(0.1);
        let before = kf.covariance[(0, 0)];
        kf.update([0.5, 0.5]).unwrap();
        assert!(kf.covariance[(0, 0)] < before);
    }

    #[test]
    fn test_constant_motion_velocity_estimate() {
        let mut kf = KalmanState::new([100.0, 50.0], KalmanConfig::default());
        let dt = 0.1;
        for k in 1..=40 {
            kf.predict(dt);
            kf.update([100.0 + 10.0 * k as f64, 50.0]).unwrap();
        }
        // 10 px per 0.1 s = 100 px/s
        let v = kf.velocity();
        assert!(v[0] > 80.0 && v[0] < 120.0, "vx = {}", v[0]);
        assert!(v[1].abs() < 5.0, "vy = {}", v[1]);
    }

    #[test]
    fn test_stationary_measurements_keep_velocity_near_zero() {
        let mut kf = KalmanState::new([320.0, 200.0], KalmanConfig::default());
        for _ in 0..100 {
            kf.predict(0.1);
            kf.update([320.0, 200.0]).unwrap();
        }
        assert!(kf.speed_px() < 1e-6);
    }

    #[test]
    fn test_update_rejects_non_finite() {
        let mut kf = KalmanState::new([0.0, 0.0], KalmanConfig::default());
        let result = kf.update([f64::NAN, 0.0]);
        assert!(result.is_err());
        // State is untouched
        assert_eq!(kf.position(), [0.0, 0.0]);
    }
}
