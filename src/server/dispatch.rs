use crate::cache::ResultCache;
use crate::core::Hub;
use crate::recovery::{ClassifiedError, ErrorClassifier, ErrorKind, RetryManager, RetryOutcome};
use crate::server::safety::SafetyGate;
use crate::utils::errors::HubError;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DENIED_SUGGESTION: &str =
    "Refused by the safety policy. Change the arguments or the safety configuration.";

/// Outcome of one client tool call after cache, retries and invalidation
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub result: Result<Value, ClassifiedError>,
    pub cached: bool,
    pub attempts: u32,
}

/// Runs a tool call through the safety gate, the cache, the retry loop and the hub
pub struct Dispatcher {
    hub: Arc<Hub>,
    cache: Option<Arc<ResultCache>>,
    retry: Option<Arc<RetryManager>>,
    safety: Option<Arc<SafetyGate>>,
    classifier: ErrorClassifier,
}

impl Dispatcher {
    pub fn new(
        hub: Arc<Hub>,
        cache: Option<Arc<ResultCache>>,
        retry: Option<Arc<RetryManager>>,
    ) -> Self {
        Self {
            hub,
            cache,
            retry,
            safety: None,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn with_safety(mut self, safety: Arc<SafetyGate>) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn retry(&self) -> Option<&Arc<RetryManager>> {
        self.retry.as_ref()
    }

    pub fn safety(&self) -> Option<&Arc<SafetyGate>> {
        self.safety.as_ref()
    }

    pub fn classify(&self, message: &str) -> ClassifiedError {
        self.classifier.classify(message)
    }

    /// Execute `tool`. `retry_key` identifies the call for retry bookkeeping.
    pub async fn execute(&self, retry_key: &str, tool: &str, params: Value) -> CallOutcome {
        if let Some(safety) = &self.safety {
            if let Err(e) = safety.check(tool, &params).await {
                warn!(tool = %tool, "Call refused: {}", e);
                return CallOutcome {
                    result: Err(denied(&e)),
                    cached: false,
                    attempts: 0,
                };
            }
        }

        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get(tool, &params)) {
            return CallOutcome {
                result: Ok(hit.result),
                cached: true,
                attempts: 0,
            };
        }

        let hub = self.hub.as_ref();
        let outcome = match &self.retry {
            Some(retry) => {
                retry
                    .execute_with_retry(retry_key, tool, &params, move |args| hub.invoke(tool, args), hub)
                    .await
            }
            None => match hub.invoke(tool, params.clone()).await {
                Ok(result) => RetryOutcome::Success { result, attempts: 1 },
                Err(e) => RetryOutcome::Failure {
                    error: self.classifier.classify_error(&e),
                    attempts: 1,
                },
            },
        };

        match outcome {
            RetryOutcome::Success { result, attempts } => {
                if let Some(cache) = &self.cache {
                    cache.set(tool, &params, &result);
                    let removed = cache.invalidate_for(tool, &params);
                    if removed > 0 {
                        info!(tool = %tool, "Invalidated {} cached results", removed);
                    }
                }
                debug!(tool = %tool, attempts, "Call succeeded");
                CallOutcome {
                    result: Ok(result),
                    cached: false,
                    attempts,
                }
            }
            RetryOutcome::Failure { error, attempts } => CallOutcome {
                result: Err(error),
                cached: false,
                attempts,
            },
        }
    }
}

fn denied(error: &HubError) -> ClassifiedError {
    ClassifiedError {
        kind: ErrorKind::PermissionDenied,
        message: error.to_string(),
        recoverable: false,
        suggestion: DENIED_SUGGESTION.to_string(),
        strategy: None,
    }
}
