//! Fault injection for exercising failure paths in tests

use crate::error::StoreError;

/// Which documents a fault applies to.
#[derive(Debug, Clone)]
pub enum FaultTarget {
    Any,
    Id(String),
    Prefix(String),
}

impl FaultTarget {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    fn matches(&self, id: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Id(target) => target == id,
            Self::Prefix(prefix) => id.starts_with(prefix.as_str()),
        }
    }
}

/// Store operation kinds a fault can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Insert,
    Upsert,
    Replace,
    Remove,
    LookupIn,
    MutateIn,
}

/// An injected failure, consumed by matching operations.
#[derive(Debug, Clone)]
pub struct Fault {
    pub(crate) op: StoreOp,
    pub(crate) target: FaultTarget,
    pub(crate) error: StoreError,
    /// Matching calls to let through before the fault fires.
    pub(crate) skip: usize,
    /// How many matching calls fail once armed.
    pub(crate) times: usize,
    /// Apply the mutation before returning the error, the shape of a
    /// durability-ambiguous response.
    pub(crate) applied: bool,
}

impl Fault {
    pub fn new(op: StoreOp, target: FaultTarget, error: StoreError) -> Self {
        Self {
            op,
            target,
            error,
            skip: 0,
            times: 1,
            applied: false,
        }
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }

    pub fn applied(mut self) -> Self {
        self.applied = true;
        self
    }
}

/// A fault that fired for the current operation.
#[derive(Debug, Clone)]
pub(crate) struct FiredFault {
    pub error: StoreError,
    pub applied: bool,
}

/// Consume the first matching fault for `(op, id)`, honoring skip/times
/// counters in place.
pub(crate) fn fire(faults: &mut Vec<Fault>, op: StoreOp, id: &str) -> Option<FiredFault> {
    let position = faults
        .iter()
        .position(|f| f.op == op && f.target.matches(id))?;
    let fault = &mut faults[position];
    if fault.skip > 0 {
        fault.skip -= 1;
        return None;
    }
    let fired = FiredFault {
        error: fault.error.clone(),
        applied: fault.applied,
    };
    fault.times -= 1;
    if fault.times == 0 {
        faults.remove(position);
    }
    Some(fired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_then_fire_then_exhaust() {
        let mut faults = vec![Fault::new(
            StoreOp::MutateIn,
            FaultTarget::id("doc"),
            StoreError::TemporaryFailure,
        )
        .with_skip(1)];

        assert!(fire(&mut faults, StoreOp::MutateIn, "doc").is_none());
        assert!(fire(&mut faults, StoreOp::MutateIn, "doc").is_some());
        assert!(fire(&mut faults, StoreOp::MutateIn, "doc").is_none());
        assert!(faults.is_empty());
    }

    #[test]
    fn test_target_matching() {
        let mut faults = vec![Fault::new(
            StoreOp::MutateIn,
            FaultTarget::prefix("_txn:atr-"),
            StoreError::DurabilityAmbiguous,
        )];

        assert!(fire(&mut faults, StoreOp::MutateIn, "user-doc").is_none());
        assert!(fire(&mut faults, StoreOp::LookupIn, "_txn:atr-3").is_none());
        assert!(fire(&mut faults, StoreOp::MutateIn, "_txn:atr-3").is_some());
    }
}
