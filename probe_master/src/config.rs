use probe_data::catalog::{SET_PROBE_FLAGS, UNSET_PROBE_FLAGS};
use probe_data::output::{OutputLayout, DEFAULT_CAPTURE_GROUPS};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoSeeds(&'static str),
    TooManyCaptureGroups { requested: usize, available: usize },
    NoCaptureGroups,
    ZeroGuard(&'static str),
    ZeroTimeout,
    ZeroInterval(&'static str),
    NoWorkers,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoSeeds(which) => write!(f, "No {} configured", which),
            ConfigError::TooManyCaptureGroups {
                requested,
                available,
            } => write!(
                f,
                "Requested {} capture groups but only {} seed combinations exist",
                requested, available
            ),
            ConfigError::NoCaptureGroups => write!(f, "At least one capture group is required"),
            ConfigError::ZeroGuard(which) => write!(f, "The {} must not be empty", which),
            ConfigError::ZeroTimeout => write!(f, "The execution timeout must not be zero"),
            ConfigError::ZeroInterval(which) => {
                write!(f, "The {} interval must not be zero", which)
            }
            ConfigError::NoWorkers => write!(f, "At least one worker is required"),
        }
    }
}

impl Error for ConfigError {}

/// Tunables of the harness and its execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Register seeds of the crash sweep; `None` leaves the registers as they are.
    pub crash_register_seeds: Vec<Option<u32>>,
    /// Flag seeds of the crash sweep; `None` leaves the flags as they are.
    pub crash_flag_seeds: Vec<Option<u32>>,
    pub capture_register_seeds: Vec<u32>,
    pub capture_flag_seeds: Vec<u32>,
    /// How many (register, flags) seed pairs are captured, taken in nested order.
    pub capture_groups: usize,
    /// `pushad` frames written below the stack pointer before every sweep iteration.
    pub stack_guard_frames: usize,
    /// Size of the `int3` block on each side of the candidate.
    pub jump_guard_bytes: usize,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            crash_register_seeds: vec![
                Some(0x0000_0000),
                Some(0x7fff_ffff),
                Some(0x8000_0000),
                Some(0xffff_ffff),
                None,
            ],
            crash_flag_seeds: vec![
                Some(SET_PROBE_FLAGS),
                Some(UNSET_PROBE_FLAGS),
                Some(0x0000_0080),
                None,
            ],
            capture_register_seeds: vec![0x0000_0000, 0x7fff_ffff, 0x8000_0000, 0xffff_ffff],
            capture_flag_seeds: vec![SET_PROBE_FLAGS, 0x0000_0080, UNSET_PROBE_FLAGS],
            capture_groups: DEFAULT_CAPTURE_GROUPS,
            stack_guard_frames: 8,
            jump_guard_bytes: 512,
            timeout: Duration::from_secs(10),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crash_register_seeds.is_empty() {
            return Err(ConfigError::NoSeeds("crash register seeds"));
        }
        if self.crash_flag_seeds.is_empty() {
            return Err(ConfigError::NoSeeds("crash flag seeds"));
        }
        if self.capture_register_seeds.is_empty() {
            return Err(ConfigError::NoSeeds("capture register seeds"));
        }
        if self.capture_flag_seeds.is_empty() {
            return Err(ConfigError::NoSeeds("capture flag seeds"));
        }
        if self.capture_groups == 0 {
            return Err(ConfigError::NoCaptureGroups);
        }
        let available = self.capture_register_seeds.len() * self.capture_flag_seeds.len();
        if self.capture_groups > available {
            return Err(ConfigError::TooManyCaptureGroups {
                requested: self.capture_groups,
                available,
            });
        }
        if self.stack_guard_frames == 0 {
            return Err(ConfigError::ZeroGuard("stack guard"));
        }
        if self.jump_guard_bytes == 0 {
            return Err(ConfigError::ZeroGuard("jump guard"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// (registers, flags) seeds of every capture group, register seed outermost.
    pub fn capture_seeds(&self) -> Vec<(u32, u32)> {
        self.capture_register_seeds
            .iter()
            .flat_map(|r| self.capture_flag_seeds.iter().map(move |f| (*r, *f)))
            .take(self.capture_groups)
            .collect()
    }

    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(self.capture_groups)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub checkpoint_interval: Duration,
    pub status_interval: Duration,
    pub checkpoint_path: PathBuf,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 16,
            checkpoint_interval: Duration::from_secs(600),
            status_interval: Duration::from_secs(10),
            checkpoint_path: PathBuf::from("result.json"),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("checkpoint"));
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("status"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProbeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.layout().expected_len(), 296);
        assert_eq!(
            config.capture_seeds(),
            vec![(0, 0), (0, 0x80), (0, 0xffff_feff)]
        );
        SchedulerSettings::default().validate().unwrap();
    }

    #[test]
    fn test_full_capture_product() {
        let config = ProbeConfig {
            capture_groups: 12,
            ..Default::default()
        };
        config.validate().unwrap();
        let seeds = config.capture_seeds();
        assert_eq!(seeds.len(), 12);
        assert_eq!(seeds[11], (0xffff_ffff, 0xffff_feff));
        assert_eq!(config.layout().expected_len(), 1160);

        let config = ProbeConfig {
            capture_groups: 13,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyCaptureGroups {
                requested: 13,
                available: 12
            })
        );
    }

    #[test]
    fn test_invalid_config() {
        let config = ProbeConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));

        let config = ProbeConfig {
            crash_flag_seeds: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoSeeds(_))));
    }

    #[test]
    fn test_scheduler_settings() {
        let settings = SchedulerSettings {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(settings.validate(), Err(ConfigError::NoWorkers));

        let settings = SchedulerSettings {
            status_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err(ConfigError::ZeroInterval("status"))
        );
    }
}
