//! Database configuration.

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of entries in each connection's object cache.
    /// Zero disables the bound (unbounded cache).
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: 250,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-connection object cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}
