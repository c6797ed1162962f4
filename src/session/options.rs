use crate::core::{OperationKind, Result, TxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Key into the session timeout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKey {
    /// Fallback for any key without its own entry
    Default,
    SessionConnect,
    SessionClose,
    StatementPrepare,
    StatementClose,
    TransactionBegin,
    TransactionCommit,
    TransactionRollback,
    TransactionClose,
    ResultConnect,
    ResultClose,
    StatusConnect,
    StatusClose,
    ExplainConnect,
    ExplainClose,
    SystemInfoConnect,
    SystemInfoClose,
}

impl TimeoutKey {
    /// Key bounding the wait for an operation's outcome.
    pub fn connect(operation: OperationKind) -> Self {
        match operation {
            OperationKind::Begin => Self::TransactionBegin,
            OperationKind::Result => Self::ResultConnect,
            OperationKind::Commit => Self::TransactionCommit,
            OperationKind::Rollback => Self::TransactionRollback,
            OperationKind::Status => Self::StatusConnect,
            OperationKind::Explain => Self::ExplainConnect,
            OperationKind::SystemInfo => Self::SystemInfoConnect,
            OperationKind::TransactionClose => Self::TransactionClose,
            OperationKind::Statement => Self::StatementPrepare,
        }
    }

    /// Key bounding the release of an operation's pending response.
    pub fn close(operation: OperationKind) -> Self {
        match operation {
            OperationKind::Begin
            | OperationKind::Commit
            | OperationKind::Rollback
            | OperationKind::TransactionClose => Self::TransactionClose,
            OperationKind::Result => Self::ResultClose,
            OperationKind::Status => Self::StatusClose,
            OperationKind::Explain => Self::ExplainClose,
            OperationKind::SystemInfo => Self::SystemInfoClose,
            OperationKind::Statement => Self::StatementClose,
        }
    }
}

/// Session-wide options.
///
/// Clones share the same timeout table, so an update made through any clone
/// is seen by every `TimeoutPolicy` on its next resolution.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    timeouts: Arc<RwLock<HashMap<TimeoutKey, Duration>>>,
    label: Option<String>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a timeout (builder style)
    pub fn timeout(self, key: TimeoutKey, duration: Duration) -> Self {
        self.set_timeout(key, duration);
        self
    }

    /// Set the DEFAULT entry (builder style)
    pub fn default_timeout(self, duration: Duration) -> Self {
        self.timeout(TimeoutKey::Default, duration)
    }

    /// Set the session label shown in logs
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn session_label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Update a timeout in place; later resolutions observe it.
    pub fn set_timeout(&self, key: TimeoutKey, duration: Duration) {
        let mut table = self.timeouts.write().unwrap_or_else(|e| e.into_inner());
        table.insert(key, duration);
    }

    pub fn clear_timeout(&self, key: TimeoutKey) {
        let mut table = self.timeouts.write().unwrap_or_else(|e| e.into_inner());
        table.remove(&key);
    }

    /// Raw table entry, without DEFAULT fallback.
    pub fn get_timeout(&self, key: TimeoutKey) -> Option<Duration> {
        let table = self.timeouts.read().unwrap_or_else(|e| e.into_inner());
        table.get(&key).copied()
    }

    pub fn policy(&self, key: TimeoutKey) -> TimeoutPolicy {
        TimeoutPolicy::new(self.clone(), key)
    }

    /// Build options from a deserialized configuration.
    pub fn from_config(config: &TimeoutConfig) -> Result<Self> {
        config.validate()?;

        let options = Self::new();
        if let Some(ms) = config.default_ms {
            options.set_timeout(TimeoutKey::Default, Duration::from_millis(ms));
        }
        for (key, ms) in &config.timeouts_ms {
            options.set_timeout(*key, Duration::from_millis(*ms));
        }
        Ok(match &config.label {
            Some(label) => options.label(label),
            None => options,
        })
    }

    /// Parse a JSON timeout configuration.
    ///
    /// ```ignore
    /// let options = SessionOptions::from_json(r#"{
    ///     "default_ms": 30000,
    ///     "timeouts_ms": { "transaction_commit": 60000 }
    /// }"#)?;
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TimeoutConfig = serde_json::from_str(json)
            .map_err(|e| TxError::config(format!("invalid timeout configuration: {}", e)))?;
        Self::from_config(&config)
    }
}

/// Serializable description of a timeout table, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub default_ms: Option<u64>,
    #[serde(default)]
    pub timeouts_ms: HashMap<TimeoutKey, u64>,
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_ms == Some(0) {
            return Err(TxError::config("default_ms must be > 0"));
        }
        if let Some((key, _)) = self.timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(TxError::config(format!("timeout for {:?} must be > 0", key)));
        }
        Ok(())
    }
}

/// Resolves the duration for one operation key.
///
/// Never caches: every call re-reads the shared table, falling back to the
/// DEFAULT entry and then to unbounded (`None`).
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    options: SessionOptions,
    key: TimeoutKey,
}

impl TimeoutPolicy {
    pub fn new(options: SessionOptions, key: TimeoutKey) -> Self {
        Self { options, key }
    }

    pub fn key(&self) -> TimeoutKey {
        self.key
    }

    pub fn duration(&self) -> Option<Duration> {
        self.options
            .get_timeout(self.key)
            .or_else(|| self.options.get_timeout(TimeoutKey::Default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_when_unconfigured() {
        let options = SessionOptions::new();
        assert_eq!(options.policy(TimeoutKey::TransactionCommit).duration(), None);
    }

    #[test]
    fn test_default_fallback() {
        let options = SessionOptions::new()
            .default_timeout(Duration::from_secs(10))
            .timeout(TimeoutKey::TransactionCommit, Duration::from_secs(60));

        assert_eq!(
            options.policy(TimeoutKey::TransactionCommit).duration(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            options.policy(TimeoutKey::ResultConnect).duration(),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_policy_sees_later_updates() {
        let options = SessionOptions::new();
        let policy = options.policy(TimeoutKey::TransactionBegin);
        assert_eq!(policy.duration(), None);

        options.set_timeout(TimeoutKey::TransactionBegin, Duration::from_millis(250));
        assert_eq!(policy.duration(), Some(Duration::from_millis(250)));

        options.clear_timeout(TimeoutKey::TransactionBegin);
        options.set_timeout(TimeoutKey::Default, Duration::from_millis(5));
        assert_eq!(policy.duration(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_operation_keys() {
        assert_eq!(TimeoutKey::connect(OperationKind::Commit), TimeoutKey::TransactionCommit);
        assert_eq!(TimeoutKey::close(OperationKind::Commit), TimeoutKey::TransactionClose);
        assert_eq!(TimeoutKey::close(OperationKind::Result), TimeoutKey::ResultClose);
    }

    #[test]
    fn test_from_json() {
        let options = SessionOptions::from_json(
            r#"{"label": "batch", "default_ms": 1500, "timeouts_ms": {"transaction_commit": 9000}}"#,
        )
        .unwrap();

        assert_eq!(options.session_label(), Some("batch"));
        assert_eq!(
            options.policy(TimeoutKey::TransactionCommit).duration(),
            Some(Duration::from_millis(9000))
        );
        assert_eq!(
            options.policy(TimeoutKey::ExplainClose).duration(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(SessionOptions::from_json("not json").is_err());
        assert!(SessionOptions::from_json(r#"{"default_ms": 0}"#).is_err());
        assert!(SessionOptions::from_json(r#"{"timeouts_ms": {"result_close": 0}}"#).is_err());
    }
}
