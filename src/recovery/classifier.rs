//! Error classification
//!
//! Failures are matched by message text against an ordered rule table.
//! The first matching rule decides the kind, whether the failure is worth
//! retrying, and what to do before the retry.

use crate::utils::errors::{HubError, HubResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    NotFound,
    PermissionDenied,
    DependencyMissing,
    StaleSession,
    ElementNotFound,
    NetworkError,
    InvalidInput,
    CommandNotFound,
    CapabilityNotFound,
    ProcessExit,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::DependencyMissing => "DEPENDENCY_MISSING",
            ErrorKind::StaleSession => "STALE_SESSION",
            ErrorKind::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::CommandNotFound => "COMMAND_NOT_FOUND",
            ErrorKind::CapabilityNotFound => "CAPABILITY_NOT_FOUND",
            ErrorKind::ProcessExit => "PROCESS_EXIT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery step run before a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// Re-fetch every connection's tool list
    ReloadTools,
    /// The downstream session needs a fresh browser context
    RebuildContext,
    /// The caller should take a new page snapshot
    RefreshSnapshot,
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationAction::ReloadTools => f.write_str("reload_tools"),
            RemediationAction::RebuildContext => f.write_str("rebuild_context"),
            RemediationAction::RefreshSnapshot => f.write_str("refresh_snapshot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub delay: Duration,
    pub action: Option<RemediationAction>,
}

impl RetryStrategy {
    pub const fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay: Duration::from_millis(delay_ms),
            action: None,
        }
    }

    pub const fn with_action(mut self, action: RemediationAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Result of classifying one failure
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// The original error text
    pub message: String,
    pub recoverable: bool,
    pub suggestion: String,
    pub strategy: Option<RetryStrategy>,
}

impl ClassifiedError {
    /// Whether another attempt is allowed after `retries_so_far` retries
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        match (self.recoverable, self.strategy) {
            (true, Some(strategy)) => retries_so_far < strategy.max_retries,
            _ => false,
        }
    }
}

/// One entry of the classification table
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub kind: ErrorKind,
    pattern: Regex,
    pub recoverable: bool,
    pub suggestion: String,
    pub strategy: Option<RetryStrategy>,
}

impl ClassificationRule {
    /// Build a rule; `pattern` is matched case-insensitively
    pub fn new(
        kind: ErrorKind,
        pattern: &str,
        suggestion: impl Into<String>,
        strategy: Option<RetryStrategy>,
    ) -> HubResult<Self> {
        let pattern = Regex::new(&format!("(?i){}", pattern))
            .map_err(|e| HubError::Config(format!("Invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            kind,
            pattern,
            recoverable: strategy.is_some(),
            suggestion: suggestion.into(),
            strategy,
        })
    }

    pub fn matches(&self, message: &str) -> bool {
        self.pattern.is_match(message)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

const BUILTIN_RULES: &[(ErrorKind, &str, &str, Option<RetryStrategy>)] = &[
    (
        ErrorKind::Timeout,
        r"timeout|timed? out|etimedout",
        "The operation timed out. Retry, split the task, or run it in the background.",
        Some(RetryStrategy::new(2, 1000)),
    ),
    (
        ErrorKind::CapabilityNotFound,
        r"tool.*not.*found|unknown tool",
        "Tool not found. The tool list may be stale; reload it.",
        Some(RetryStrategy::new(1, 500).with_action(RemediationAction::ReloadTools)),
    ),
    (
        ErrorKind::ElementNotFound,
        r"element.*not.*found|selector.*not.*found|no.*element.*match|uid.*not.*found",
        "Element not found. Take a fresh snapshot for current uids or check the selector.",
        Some(RetryStrategy::new(1, 500).with_action(RemediationAction::RefreshSnapshot)),
    ),
    (
        ErrorKind::CommandNotFound,
        r"command not found|not recognized|unknown command",
        "Command not found. Check that it is installed and spelled correctly.",
        None,
    ),
    (
        ErrorKind::DependencyMissing,
        r"browser.*not.*install|executable.*not.*found|chromium.*missing",
        "A required dependency is missing (e.g. run `npx playwright install chromium`).",
        Some(RetryStrategy::new(0, 0)),
    ),
    (
        ErrorKind::NotFound,
        r"not found|enoent|no such file|does not exist",
        "File or path does not exist. Confirm it with list_directory.",
        None,
    ),
    (
        ErrorKind::PermissionDenied,
        r"permission denied|eacces|access denied|not permitted",
        "Permission denied. Check the path is inside an allowed directory.",
        None,
    ),
    (
        ErrorKind::StaleSession,
        r"page.*closed|context.*destroyed|target.*closed|session.*closed",
        "The page or session was closed. The context will be rebuilt.",
        Some(RetryStrategy::new(1, 500).with_action(RemediationAction::RebuildContext)),
    ),
    (
        ErrorKind::NetworkError,
        r"network|econnrefused|econnreset|socket hang up|fetch failed",
        "Network error. Check connectivity and retry.",
        Some(RetryStrategy::new(3, 2000)),
    ),
    (
        ErrorKind::InvalidInput,
        r"invalid.*param|invalid.*argument|expected.*string|validation.*error|schema.*error",
        "Invalid arguments. Check the parameters against the tool's input schema.",
        None,
    ),
    (
        ErrorKind::ProcessExit,
        r"process.*exit|exited.*code|spawn.*error|connection lost",
        "The MCP server process exited. Reloading the tool list.",
        Some(RetryStrategy::new(1, 1000).with_action(RemediationAction::ReloadTools)),
    ),
];

static DEFAULT_RULES: LazyLock<Vec<ClassificationRule>> = LazyLock::new(|| {
    BUILTIN_RULES
        .iter()
        .map(|(kind, pattern, suggestion, strategy)| {
            ClassificationRule::new(*kind, pattern, *suggestion, *strategy)
                .expect("Invalid builtin classification pattern")
        })
        .collect()
});

/// Ordered, first-match-wins classification table
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }

    /// Append a rule after the built-in ones
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, message: &str) -> ClassifiedError {
        match self.rules.iter().find(|rule| rule.matches(message)) {
            Some(rule) => ClassifiedError {
                kind: rule.kind,
                message: message.to_string(),
                recoverable: rule.recoverable,
                suggestion: rule.suggestion.clone(),
                strategy: rule.strategy,
            },
            None => ClassifiedError {
                kind: ErrorKind::Unknown,
                message: message.to_string(),
                recoverable: false,
                suggestion: "Unknown error. See the error message for details.".to_string(),
                strategy: None,
            },
        }
    }

    pub fn classify_error(&self, error: &HubError) -> ClassifiedError {
        self.classify(&error.to_string())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
