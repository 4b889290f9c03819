use crate::config::RetryConfig;
use crate::recovery::classifier::{ClassifiedError, ErrorClassifier, RemediationAction};
use crate::utils::errors::HubResult;
use crate::utils::shutdown::ShutdownCoordinator;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runs remediation actions before a retry
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn remediate(&self, action: RemediationAction) -> HubResult<()>;
}

/// Remediator that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemediation;

#[async_trait]
impl Remediator for NoRemediation {
    async fn remediate(&self, action: RemediationAction) -> HubResult<()> {
        debug!(action = %action, "No remediation available");
        Ok(())
    }
}

/// Failure history of one call id
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt: Instant,
}

#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Success { result: Value, attempts: u32 },
    Failure { error: ClassifiedError, attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Failure { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }
}

/// Bounded retry loop with per-call failure state
pub struct RetryManager {
    classifier: ErrorClassifier,
    state: DashMap<String, RetryState>,
    max_attempts: u32,
    state_ttl: Duration,
}

impl RetryManager {
    pub fn new(classifier: ErrorClassifier, config: &RetryConfig) -> Self {
        Self {
            classifier,
            state: DashMap::new(),
            max_attempts: config.max_attempts.max(1),
            state_ttl: Duration::from_secs(config.state_ttl_secs),
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Current state for `call_id`, if any and not expired
    pub fn state(&self, call_id: &str) -> Option<RetryState> {
        let state = self.state.get(call_id).map(|entry| entry.clone())?;
        if state.last_attempt.elapsed() > self.state_ttl {
            self.state.remove(call_id);
            return None;
        }
        Some(state)
    }

    pub fn tracked_calls(&self) -> usize {
        self.state.len()
    }

    pub fn clear(&self, call_id: &str) {
        self.state.remove(call_id);
    }

    /// Record a failure and return the cumulative attempt count
    fn record_failure(&self, call_id: &str, error: &str) -> u32 {
        let now = Instant::now();
        let mut entry = self
            .state
            .entry(call_id.to_string())
            .or_insert_with(|| RetryState {
                attempts: 0,
                last_error: None,
                last_attempt: now,
            });
        if now.duration_since(entry.last_attempt) > self.state_ttl {
            entry.attempts = 0;
        }
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.last_attempt = now;
        entry.attempts
    }

    /// Drop state older than the expiry window
    pub fn cleanup(&self) -> usize {
        let before = self.state.len();
        let ttl = self.state_ttl;
        self.state
            .retain(|_, state| state.last_attempt.elapsed() <= ttl);
        let removed = before.saturating_sub(self.state.len());
        if removed > 0 {
            debug!("Expired {} retry states", removed);
        }
        removed
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: ShutdownCoordinator,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.cleanup();
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    }

    /// Invoke `invoke(args)` until it succeeds, the error is not worth
    /// retrying, or the attempt ceiling is reached.
    pub async fn execute_with_retry<F, Fut>(
        &self,
        call_id: &str,
        tool: &str,
        args: &Value,
        mut invoke: F,
        remediator: &dyn Remediator,
    ) -> RetryOutcome
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = HubResult<Value>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            info!(
                tool = %tool,
                call_id = %call_id,
                "Executing (attempt {}/{})",
                attempts,
                self.max_attempts
            );

            let error = match invoke(args.clone()).await {
                Ok(result) => {
                    self.clear(call_id);
                    return RetryOutcome::Success { result, attempts };
                }
                Err(e) => self.classifier.classify_error(&e),
            };

            let recorded = self.record_failure(call_id, &error.message);
            let strategy = match error.strategy {
                Some(strategy)
                    if attempts < self.max_attempts && error.should_retry(recorded - 1) =>
                {
                    strategy
                }
                _ => {
                    warn!(
                        tool = %tool,
                        call_id = %call_id,
                        kind = %error.kind,
                        "Giving up after {} attempts: {}",
                        attempts,
                        error.message
                    );
                    return RetryOutcome::Failure { error, attempts };
                }
            };

            if let Some(action) = strategy.action {
                info!(tool = %tool, action = %action, "Running remediation before retry");
                if let Err(e) = remediator.remediate(action).await {
                    warn!(tool = %tool, action = %action, "Remediation failed: {}", e);
                }
            }

            info!(tool = %tool, "Retrying in {:?}", strategy.delay);
            tokio::time::sleep(strategy.delay).await;
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(ErrorClassifier::new(), &RetryConfig::default())
    }
}
