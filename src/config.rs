use crate::error::{Error, Result};
use std::time::Duration;

/// Sizing and thread parameters for a [`PriorityTaskQueue`](crate::PriorityTaskQueue).
///
/// `core_size` workers stay alive even when idle. Under load the pool grows
/// up to `max_size`; workers beyond `core_size` retire after sitting idle for
/// `keep_alive`. Retirement only happens between tasks.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub keep_alive: Duration,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            core_size: 1,
            max_size: num_cpus::get().max(1),
            keep_alive: Duration::from_secs(30),
            thread_name_prefix: "priotask-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024),
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// A fixed pool: `size` workers, none of them ever retired.
    pub fn fixed(size: usize) -> Self {
        Self {
            core_size: size,
            max_size: size,
            keep_alive: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("max_size must be > 0"));
        }
        if self.max_size > 1024 {
            return Err(Error::config("max_size too large (max 1024)"));
        }
        if self.core_size > self.max_size {
            return Err(Error::config("core_size must be <= max_size"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
        }
    }

    pub fn core_size(mut self, n: usize) -> Self {
        self.config.core_size = n;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.config.max_size = n;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn build(self) -> Result<QueueConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_max() {
        let config = QueueConfig::builder().core_size(0).max_size(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn test_rejects_core_above_max() {
        let config = QueueConfig::builder().core_size(4).max_size(2).build();
        assert!(config.is_err());
    }

    #[test]
    fn test_fixed_pool_shape() {
        let config = QueueConfig::fixed(3);
        assert_eq!(config.core_size, 3);
        assert_eq!(config.max_size, 3);
        assert_eq!(config.keep_alive, Duration::ZERO);
        assert!(config.validate().is_ok());
    }
}
