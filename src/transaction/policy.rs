// ============================================================================
// Retry Policy
// ============================================================================
//
// Decides, after an aborted attempt, whether the transaction manager runs
// another attempt and with which transaction option.
//
// ============================================================================

use crate::core::{CommitType, DiagnosticCode, Result, ServerCategory, TransactionOption, TxError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUp {
    /// The failure is not one a retry can fix
    NotRetryable,
    /// Retryable, but the attempt budget is spent
    RetryOver {
        next_option: Option<TransactionOption>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(TransactionOption),
    GiveUp(GiveUp),
}

/// Whether a failure is worth another attempt.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, code: &DiagnosticCode, cause: &TxError) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&DiagnosticCode, &TxError) -> bool + Send + Sync,
{
    fn is_retryable(&self, code: &DiagnosticCode, cause: &TxError) -> bool {
        self(code, cause)
    }
}

/// Retries serialization failures (conflicts) only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictClassifier;

impl RetryClassifier for ConflictClassifier {
    fn is_retryable(&self, code: &DiagnosticCode, _cause: &TxError) -> bool {
        code.server_category() == Some(ServerCategory::Serialization)
    }
}

/// Supplies the option for the first attempt and decides what follows an
/// aborted one.
pub trait TransactionOptionSupplier: Send + Sync {
    fn initial_option(&self) -> TransactionOption;

    /// `attempt` is the 1-based number of the attempt that just failed.
    fn decide(&self, attempt: u32, cause: &TxError, code: &DiagnosticCode) -> RetryDecision;
}

fn default_classifier() -> Arc<dyn RetryClassifier> {
    Arc::new(ConflictClassifier)
}

/// The same option for every attempt.
#[derive(Clone)]
pub struct FixedOption {
    option: TransactionOption,
    max_attempts: u32,
    classifier: Arc<dyn RetryClassifier>,
}

impl FixedOption {
    pub fn new(option: TransactionOption, max_attempts: u32) -> Self {
        Self {
            option,
            max_attempts: max_attempts.max(1),
            classifier: default_classifier(),
        }
    }

    /// A single attempt, never retried.
    pub fn once(option: TransactionOption) -> Self {
        Self::new(option, 1)
    }

    pub fn with_classifier(mut self, classifier: impl RetryClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl TransactionOptionSupplier for FixedOption {
    fn initial_option(&self) -> TransactionOption {
        self.option.clone()
    }

    fn decide(&self, attempt: u32, cause: &TxError, code: &DiagnosticCode) -> RetryDecision {
        if !self.classifier.is_retryable(code, cause) {
            return RetryDecision::GiveUp(GiveUp::NotRetryable);
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUp::RetryOver {
                next_option: Some(self.option.clone()),
            });
        }
        RetryDecision::Retry(self.option.clone())
    }
}

/// One option per attempt, in order, e.g. OCC first and LTX after a
/// conflict.
#[derive(Clone)]
pub struct OptionSequence {
    options: Vec<TransactionOption>,
    classifier: Arc<dyn RetryClassifier>,
}

impl OptionSequence {
    pub fn new(options: Vec<TransactionOption>) -> Result<Self> {
        if options.is_empty() {
            return Err(TxError::config("option sequence must not be empty"));
        }
        Ok(Self {
            options,
            classifier: default_classifier(),
        })
    }

    pub fn with_classifier(mut self, classifier: impl RetryClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }
}

impl TransactionOptionSupplier for OptionSequence {
    fn initial_option(&self) -> TransactionOption {
        self.options[0].clone()
    }

    fn decide(&self, attempt: u32, cause: &TxError, code: &DiagnosticCode) -> RetryDecision {
        if !self.classifier.is_retryable(code, cause) {
            return RetryDecision::GiveUp(GiveUp::NotRetryable);
        }
        match self.options.get(attempt as usize) {
            Some(next) => RetryDecision::Retry(next.clone()),
            None => RetryDecision::GiveUp(GiveUp::RetryOver { next_option: None }),
        }
    }
}

/// `first` for the first `first_attempts` attempts, then `fallback`, up to
/// `max_attempts` in total.
#[derive(Clone)]
pub struct Escalating {
    first: TransactionOption,
    fallback: TransactionOption,
    first_attempts: u32,
    max_attempts: u32,
    classifier: Arc<dyn RetryClassifier>,
}

impl Escalating {
    pub fn new(
        first: TransactionOption,
        first_attempts: u32,
        fallback: TransactionOption,
        max_attempts: u32,
    ) -> Self {
        Self {
            first,
            fallback,
            first_attempts: first_attempts.max(1),
            max_attempts: max_attempts.max(1),
            classifier: default_classifier(),
        }
    }

    pub fn with_classifier(mut self, classifier: impl RetryClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    fn option_for(&self, attempt: u32) -> &TransactionOption {
        if attempt <= self.first_attempts {
            &self.first
        } else {
            &self.fallback
        }
    }
}

impl TransactionOptionSupplier for Escalating {
    fn initial_option(&self) -> TransactionOption {
        self.first.clone()
    }

    fn decide(&self, attempt: u32, cause: &TxError, code: &DiagnosticCode) -> RetryDecision {
        if !self.classifier.is_retryable(code, cause) {
            return RetryDecision::GiveUp(GiveUp::NotRetryable);
        }
        let next = self.option_for(attempt + 1).clone();
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUp::RetryOver {
                next_option: Some(next),
            });
        }
        RetryDecision::Retry(next)
    }
}

/// Supplier backed by a closure over `(attempt, cause, code)`.
pub struct DecideFn<F> {
    initial: TransactionOption,
    decide: F,
}

impl<F> DecideFn<F>
where
    F: Fn(u32, &TxError, &DiagnosticCode) -> RetryDecision + Send + Sync,
{
    pub fn new(initial: TransactionOption, decide: F) -> Self {
        Self { initial, decide }
    }
}

impl<F> TransactionOptionSupplier for DecideFn<F>
where
    F: Fn(u32, &TxError, &DiagnosticCode) -> RetryDecision + Send + Sync,
{
    fn initial_option(&self) -> TransactionOption {
        self.initial.clone()
    }

    fn decide(&self, attempt: u32, cause: &TxError, code: &DiagnosticCode) -> RetryDecision {
        (self.decide)(attempt, cause, code)
    }
}

/// Exponential delay between attempts. Zero by default (retry at once).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Backoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before the attempt following `failed_attempt` (1-based).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let shift = failed_attempt.saturating_sub(1).min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Manager-wide execution settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub commit_type: CommitType,
    /// Applied to options that carry no label of their own
    pub label: Option<String>,
    pub backoff: Backoff,
}

impl ManagerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_type(mut self, commit_type: CommitType) -> Self {
        self.commit_type = commit_type;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TxError::config(format!("invalid manager settings: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClientCode, ServerCode};

    fn conflict() -> (TxError, DiagnosticCode) {
        let code = ServerCode::cc_exception();
        (
            TxError::server(code.clone(), "serialization failure"),
            DiagnosticCode::Server(code),
        )
    }

    fn syntax() -> (TxError, DiagnosticCode) {
        let code = ServerCode::syntax_error();
        (TxError::server(code.clone(), "bad sql"), DiagnosticCode::Server(code))
    }

    #[test]
    fn test_fixed_option_budget() {
        let supplier = FixedOption::new(TransactionOption::occ(), 3);
        let (cause, code) = conflict();

        assert_eq!(
            supplier.decide(1, &cause, &code),
            RetryDecision::Retry(TransactionOption::occ())
        );
        assert_eq!(
            supplier.decide(3, &cause, &code),
            RetryDecision::GiveUp(GiveUp::RetryOver {
                next_option: Some(TransactionOption::occ())
            })
        );

        let (cause, code) = syntax();
        assert_eq!(
            supplier.decide(1, &cause, &code),
            RetryDecision::GiveUp(GiveUp::NotRetryable)
        );
    }

    #[test]
    fn test_closure_classifier() {
        let supplier = FixedOption::new(TransactionOption::occ(), 2)
            .with_classifier(|code: &DiagnosticCode, _: &TxError| code.is_client());
        let timeout = TxError::internal("x");
        assert_eq!(
            supplier.decide(1, &timeout, &DiagnosticCode::Client(ClientCode::Internal)),
            RetryDecision::Retry(TransactionOption::occ())
        );
    }

    #[test]
    fn test_option_sequence() {
        let ltx = TransactionOption::ltx(["accounts"]);
        let supplier = OptionSequence::new(vec![TransactionOption::occ(), ltx.clone()]).unwrap();
        let (cause, code) = conflict();

        assert_eq!(supplier.initial_option(), TransactionOption::occ());
        assert_eq!(supplier.decide(1, &cause, &code), RetryDecision::Retry(ltx));
        assert_eq!(
            supplier.decide(2, &cause, &code),
            RetryDecision::GiveUp(GiveUp::RetryOver { next_option: None })
        );
        assert!(OptionSequence::new(Vec::new()).is_err());
    }

    #[test]
    fn test_escalating() {
        let ltx = TransactionOption::ltx(["accounts"]);
        let supplier = Escalating::new(TransactionOption::occ(), 2, ltx.clone(), 4);
        let (cause, code) = conflict();

        assert_eq!(
            supplier.decide(1, &cause, &code),
            RetryDecision::Retry(TransactionOption::occ())
        );
        assert_eq!(supplier.decide(2, &cause, &code), RetryDecision::Retry(ltx.clone()));
        assert_eq!(
            supplier.decide(4, &cause, &code),
            RetryDecision::GiveUp(GiveUp::RetryOver {
                next_option: Some(ltx)
            })
        );
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(Backoff::default().delay(5), Duration::ZERO);

        let backoff = Backoff::new(10, 50);
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(200), Duration::from_millis(50));
    }

    #[test]
    fn test_settings_from_json() {
        let settings = ManagerSettings::from_json(
            r#"{"commit_type": "Stored", "backoff": {"base_delay_ms": 5, "max_delay_ms": 100}}"#,
        )
        .unwrap();
        assert_eq!(settings.commit_type, CommitType::Stored);
        assert_eq!(settings.backoff.max_delay_ms, 100);
        assert_eq!(settings.label, None);
    }
}
