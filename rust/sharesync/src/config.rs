use std::time::Duration;

/// Grace window between the last release of a shared subscription and its
/// actual teardown.
pub const DEFAULT_TEARDOWN_DELAY: Duration = Duration::from_secs(3);

/// Maximum number of links followed when resolving a path in the data tree.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 16;

/// Document fields whose changes are not propagated to consumers.
pub const DEFAULT_IGNORED_FIELDS: &[&str] = &["_meta", "updatedAt", "updatedBy"];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay before a subscription whose ref count dropped to zero is torn
    /// down. A re-acquire inside this window reuses the live subscription.
    pub teardown_delay: Duration,
    /// Top-level document fields whose remote changes are ignored.
    pub ignored_fields: Vec<String>,
    pub max_link_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            teardown_delay: DEFAULT_TEARDOWN_DELAY,
            ignored_fields: DEFAULT_IGNORED_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            max_link_depth: DEFAULT_MAX_LINK_DEPTH,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = delay;
        self
    }

    pub fn with_ignored_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_link_depth(mut self, depth: usize) -> Self {
        self.max_link_depth = depth.max(1);
        self
    }

    pub fn is_ignored_field(&self, field: &str) -> bool {
        self.ignored_fields.iter().any(|f| f == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.teardown_delay, Duration::from_secs(3));
        assert!(config.is_ignored_field("updatedAt"));
        assert!(!config.is_ignored_field("title"));
    }

    #[test]
    fn test_builder_overrides() {
        let config = SyncConfig::new()
            .with_teardown_delay(Duration::from_millis(250))
            .with_ignored_fields(["touchedAt"])
            .with_max_link_depth(0);

        assert_eq!(config.teardown_delay, Duration::from_millis(250));
        assert!(config.is_ignored_field("touchedAt"));
        assert!(!config.is_ignored_field("_meta"));
        assert_eq!(config.max_link_depth, 1);
    }
}
