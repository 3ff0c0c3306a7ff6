use std::time::Duration;

use crate::error::EngineError;

pub const DEFAULT_WINDOWS: usize = 5;
pub const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(3);
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_PASSING_THRESHOLD: usize = 3;
pub const DEFAULT_TOLERANCE: f64 = 0.6;
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

/// Tuning for one attendance session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Number of sampling windows (W).
    pub windows: usize,
    /// Length of each window (D).
    pub window_duration: Duration,
    /// Pause between frame acquisitions inside a window.
    pub frame_interval: Duration,
    /// Minimum number of windows a subject must be seen in to count as present.
    pub passing_threshold: usize,
    /// Maximum descriptor distance accepted as a match. Smaller is stricter.
    pub tolerance: f64,
    pub max_write_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            windows: DEFAULT_WINDOWS,
            window_duration: DEFAULT_WINDOW_DURATION,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            passing_threshold: DEFAULT_PASSING_THRESHOLD,
            tolerance: DEFAULT_TOLERANCE,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.windows == 0 {
            return Err(EngineError::Configuration(
                "window count must be positive".to_string(),
            ));
        }
        if self.window_duration.is_zero() {
            return Err(EngineError::Configuration(
                "window duration must be positive".to_string(),
            ));
        }
        if self.frame_interval.is_zero() {
            return Err(EngineError::Configuration(
                "frame interval must be positive".to_string(),
            ));
        }
        if self.passing_threshold > self.windows {
            return Err(EngineError::Configuration(format!(
                "passing threshold {} exceeds window count {}",
                self.passing_threshold, self.windows
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(EngineError::Configuration(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }
        if self.max_write_attempts == 0 {
            return Err(EngineError::Configuration(
                "at least one write attempt is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_windows() {
        let config = SessionConfig {
            windows: 0,
            passing_threshold: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn rejects_zero_duration() {
        let config = SessionConfig {
            window_duration: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn rejects_threshold_above_window_count() {
        let config = SessionConfig {
            windows: 2,
            passing_threshold: 3,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn threshold_equal_to_window_count_is_allowed() {
        let config = SessionConfig {
            windows: 3,
            passing_threshold: 3,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_nan_tolerance() {
        let config = SessionConfig {
            tolerance: f64::NAN,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
