//! Router configuration

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Name used in log output
    pub name: String,
    /// Panic on a response that matches no pending call instead of dropping it
    pub strict_correlation: bool,
    /// Maximum number of messages buffered while a sync call blocks or a
    /// drain is in progress
    pub reentrant_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "router".to_string(),
            strict_correlation: cfg!(debug_assertions),
            reentrant_queue_capacity: 1024,
        }
    }
}

impl RouterConfig {
    /// Creates the default configuration with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self::default().with_name(name)
    }

    /// Sets the log name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets how unmatched responses are handled
    pub fn with_strict_correlation(mut self, strict: bool) -> Self {
        self.strict_correlation = strict;
        self
    }

    /// Sets the reentrant queue capacity
    pub fn with_reentrant_queue_capacity(mut self, capacity: usize) -> Self {
        self.reentrant_queue_capacity = capacity;
        self
    }
}
