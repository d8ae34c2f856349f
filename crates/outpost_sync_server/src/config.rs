//! Server configuration.

use std::time::Duration;

/// Configuration for the central sync manager.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of sessions open at once.
    pub max_concurrent_sessions: usize,
    /// A session that has not been touched for this long is abandoned.
    pub session_timeout: Duration,
    /// Largest page a facility may pull.
    pub max_pull_page: u32,
    /// Largest page a facility may push.
    pub max_push_page: u32,
    /// How long a snapshot waits for in-flight writers.
    pub tick_wait_timeout: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_concurrent_sessions: 16,
            session_timeout: Duration::from_secs(600),
            max_pull_page: 40_000,
            max_push_page: 40_000,
            tick_wait_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the maximum number of open sessions.
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Sets the idle timeout of a session.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the largest pull page.
    pub fn with_max_pull_page(mut self, size: u32) -> Self {
        self.max_pull_page = size;
        self
    }

    /// Sets the largest push page.
    pub fn with_max_push_page(mut self, size: u32) -> Self {
        self.max_push_page = size;
        self
    }

    /// Sets the writer wait timeout.
    pub fn with_tick_wait_timeout(mut self, timeout: Duration) -> Self {
        self.tick_wait_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_concurrent_sessions, 16);
        assert_eq!(config.max_pull_page, 40_000);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_concurrent_sessions(2)
            .with_session_timeout(Duration::from_secs(5))
            .with_max_pull_page(50);

        assert_eq!(config.max_concurrent_sessions, 2);
        assert_eq!(config.session_timeout, Duration::from_secs(5));
        assert_eq!(config.max_pull_page, 50);
    }
}
