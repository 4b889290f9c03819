pub mod classifier;
pub mod retry;

pub use classifier::{
    ClassificationRule, ClassifiedError, ErrorClassifier, ErrorKind, RemediationAction,
    RetryStrategy,
};
pub use retry::{NoRemediation, Remediator, RetryManager, RetryOutcome, RetryState};
