//! The user-supplied aggregation strategy.

use crate::route::Record;

/// Boxed error type for fold failures.
///
/// Fold errors are never retried per-record; they are classified as
/// task failures and trigger a rollback-restart, since a partial retry
/// could break exactly-once accounting.
pub type FoldError = Box<dyn std::error::Error + Send + Sync>;

/// Strategy object for keyed aggregation, injected at task
/// construction.
///
/// One instance is shared by every operator task; all per-key mutable
/// state lives in the task's [`crate::state::KeyedState`], so
/// implementations should be pure functions of their arguments.
pub trait FoldLogic<V, A>: Send + Sync {
    /// Accumulator for a key's first record.
    fn initial(&self) -> A;

    /// Fold the next record for a key into its accumulator.
    fn fold(&self, acc: A, record: &Record<V>) -> Result<A, FoldError>;
}

/// Running sum of `i64` record values. The word-count aggregation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumFold;

impl FoldLogic<i64, i64> for SumFold {
    fn initial(&self) -> i64 {
        0
    }

    fn fold(&self, acc: i64, record: &Record<i64>) -> Result<i64, FoldError> {
        Ok(acc + record.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::StateKey;

    #[test]
    fn sum_fold_accumulates() {
        let fold = SumFold;
        let mut acc = fold.initial();
        for (value, timestamp) in [(1, 0), (1, 1), (2, 2)] {
            let record = Record {
                key: StateKey::from("a"),
                value,
                timestamp,
            };
            acc = fold.fold(acc, &record).unwrap();
        }
        assert_eq!(acc, 4);
    }
}
