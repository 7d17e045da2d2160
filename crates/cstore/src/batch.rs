//! Per-item outcomes for multi-argument lookups.
//!
//! Resolving several names at once never stops at the first failure: each
//! argument gets its own outcome, and the batch as a whole succeeded only if
//! every argument did.

use crate::error::{Result, StorageError};

/// The outcome for one requested argument.
#[derive(Debug)]
pub struct BatchItem<T> {
    /// The argument as given by the caller.
    pub requested: String,
    /// What it resolved to.
    pub outcome: Result<T>,
}

/// Outcomes for a list of requested arguments, in request order.
#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<BatchItem<T>>,
}

impl<T> Batch<T> {
    pub(crate) fn collect<I, S>(requested: I, mut f: impl FnMut(&str) -> Result<T>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items = requested
            .into_iter()
            .map(|arg| {
                let arg = arg.as_ref();
                BatchItem {
                    requested: arg.to_string(),
                    outcome: f(arg),
                }
            })
            .collect();
        Self { items }
    }

    /// All items, in request order.
    pub fn items(&self) -> &[BatchItem<T>] {
        &self.items
    }

    /// Number of requested arguments.
    pub fn requested(&self) -> usize {
        self.items.len()
    }

    /// Successful outcomes, in request order.
    pub fn matched(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|i| i.outcome.as_ref().ok())
    }

    /// Failed arguments with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &StorageError)> {
        self.items
            .iter()
            .filter_map(|i| i.outcome.as_ref().err().map(|e| (i.requested.as_str(), e)))
    }

    /// Whether every requested argument succeeded.
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|i| i.outcome.is_ok())
    }

    /// Consume the batch, keeping only successful outcomes.
    pub fn into_matched(self) -> Vec<T> {
        self.items
            .into_iter()
            .filter_map(|i| i.outcome.ok())
            .collect()
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = BatchItem<T>;
    type IntoIter = std::vec::IntoIter<BatchItem<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
