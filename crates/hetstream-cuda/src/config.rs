//! Configuration for the process-wide stream and event caches.

/// Configuration for the stream/event caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Streams to create per device up front (0 = create on demand).
    pub preallocated_streams_per_device: usize,
    /// Events to create per device up front (0 = create on demand).
    pub preallocated_events_per_device: usize,
    /// Create events with blocking host synchronization instead of the
    /// default timing-disabled spin wait. Blocking sync trades wake-up
    /// latency for lower CPU usage on host-side waits.
    pub blocking_sync_events: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            preallocated_streams_per_device: 0,
            preallocated_events_per_device: 0,
            blocking_sync_events: false,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration that warms both pools up front.
    ///
    /// Useful for latency-sensitive pipelines where the first stage must
    /// not pay stream/event creation cost.
    #[must_use]
    pub fn eager(per_device: usize) -> Self {
        Self {
            preallocated_streams_per_device: per_device,
            preallocated_events_per_device: per_device,
            blocking_sync_events: false,
        }
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of streams preallocated per device.
    #[must_use]
    pub fn with_preallocated_streams(mut self, count: usize) -> Self {
        self.config.preallocated_streams_per_device = count;
        self
    }

    /// Sets the number of events preallocated per device.
    #[must_use]
    pub fn with_preallocated_events(mut self, count: usize) -> Self {
        self.config.preallocated_events_per_device = count;
        self
    }

    /// Enables or disables blocking host synchronization on events.
    #[must_use]
    pub fn with_blocking_sync_events(mut self, enabled: bool) -> Self {
        self.config.blocking_sync_events = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.preallocated_streams_per_device, 0);
        assert_eq!(config.preallocated_events_per_device, 0);
        assert!(!config.blocking_sync_events);
    }

    #[test]
    fn test_cache_config_eager() {
        let config = CacheConfig::eager(4);
        assert_eq!(config.preallocated_streams_per_device, 4);
        assert_eq!(config.preallocated_events_per_device, 4);
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfigBuilder::new()
            .with_preallocated_streams(2)
            .with_preallocated_events(8)
            .with_blocking_sync_events(true)
            .build();

        assert_eq!(config.preallocated_streams_per_device, 2);
        assert_eq!(config.preallocated_events_per_device, 8);
        assert!(config.blocking_sync_events);
    }
}
