//! Configuration for envsync
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use crate::engine::EnvFlags;
use crate::error::{Result, SyncError};

/// Main configuration for a synchronized environment
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Resize Recovery
    // -------------------------------------------------------------------------
    /// How many times one call may adopt an externally resized map before
    /// the resize error is returned to the caller
    pub max_resize_retries: u32,

    /// Delay applied (under the exclusive admission lock) before adopting a
    /// size set by another process
    pub resize_backoff: Backoff,

    // -------------------------------------------------------------------------
    // Environment Configuration
    // -------------------------------------------------------------------------
    /// Flags passed to the engine on open
    pub open_flags: EnvFlags,

    /// Unix permission bits for files the engine creates
    pub file_mode: u32,

    /// Map size set before opening (in bytes)
    pub map_size: u64,
}

/// Delay policy between consecutive resize adoptions within one call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Adopt immediately
    None,

    /// Same delay for every adoption
    Fixed(Duration),

    /// `base * factor^n`, capped at `max`
    Exponential {
        base: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    /// Delay before the adoption following `retries` earlier adoptions
    pub fn delay(&self, retries: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max, factor } => {
                let scaled = base.as_secs_f64() * factor.powi(retries as i32);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_millis(1),
            max: Duration::from_millis(100),
            factor: 2.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_resize_retries: 2,
            resize_backoff: Backoff::default(),
            open_flags: EnvFlags::empty(),
            file_mode: 0o644,
            map_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check invariants the builder cannot enforce by type
    pub fn validate(&self) -> Result<()> {
        if self.map_size == 0 {
            return Err(SyncError::Config("map_size must be non-zero".to_string()));
        }
        if let Backoff::Exponential { base, max, factor } = self.resize_backoff {
            if !(factor.is_finite() && factor >= 1.0) {
                return Err(SyncError::Config(format!(
                    "backoff factor must be >= 1.0, got {}",
                    factor
                )));
            }
            if base > max {
                return Err(SyncError::Config(format!(
                    "backoff base {:?} exceeds max {:?}",
                    base, max
                )));
            }
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set how many resize adoptions one call may perform
    pub fn max_resize_retries(mut self, retries: u32) -> Self {
        self.config.max_resize_retries = retries;
        self
    }

    /// Set the delay policy for resize adoption
    pub fn resize_backoff(mut self, backoff: Backoff) -> Self {
        self.config.resize_backoff = backoff;
        self
    }

    /// Set the flags used when opening the environment
    pub fn open_flags(mut self, flags: EnvFlags) -> Self {
        self.config.open_flags = flags;
        self
    }

    /// Set the file mode for created files
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = mode;
        self
    }

    /// Set the initial map size (in bytes)
    pub fn map_size(mut self, size: u64) -> Self {
        self.config.map_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
