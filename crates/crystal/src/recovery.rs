//! What to do when neither the primary nor the backup snapshot is usable.

use std::fmt;

use async_trait::async_trait;

use crystal_types::CrystalError;

/// Outcome chosen by a [`RecoveryPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Discard the unreadable snapshot and start from a fresh object.
    Continue,
    /// Fail the load with `CrystalError::Aborted`.
    Abort,
}

/// Consulted by the snapshot loader after both copies failed verification.
#[async_trait]
pub trait RecoveryPolicy: Send + Sync {
    /// `target` names the snapshot; `failure` is the primary copy's error.
    async fn decide(&self, target: &str, failure: &CrystalError) -> RecoveryDecision;
}

/// Always abort.
#[derive(Clone, Copy, Debug, Default)]
pub struct AbortPolicy;

#[async_trait]
impl RecoveryPolicy for AbortPolicy {
    async fn decide(&self, _target: &str, _failure: &CrystalError) -> RecoveryDecision {
        RecoveryDecision::Abort
    }
}

/// Always start fresh.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContinuePolicy;

#[async_trait]
impl RecoveryPolicy for ContinuePolicy {
    async fn decide(&self, _target: &str, _failure: &CrystalError) -> RecoveryDecision {
        RecoveryDecision::Continue
    }
}

/// Policy backed by a closure, e.g. an operator prompt.
pub struct FnPolicy<F>(pub F);

impl<F> fmt::Debug for FnPolicy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnPolicy")
    }
}

#[async_trait]
impl<F> RecoveryPolicy for FnPolicy<F>
where
    F: Fn(&str, &CrystalError) -> RecoveryDecision + Send + Sync,
{
    async fn decide(&self, target: &str, failure: &CrystalError) -> RecoveryDecision {
        (self.0)(target, failure)
    }
}
