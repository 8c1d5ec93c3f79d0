//! Reconciliation primitives.
//!
//! This library provides the building blocks the orchestrator uses to
//! converge declared VMs with what each hypervisor reports:
//!
//! - **Partition**: desired items split into "present" and "missing", grouped
//!   by the backend that owns them.
//! - **Batching**: slicing one group's items into ordered, bounded chunks.
//! - **Fan-out**: one concurrent unit of work per group, where a failing
//!   group never stops its siblings and failures are aggregated after a
//!   join barrier.
//! - **Content hashing**: stable names for artifacts derived from content.
//!
//! # Invariants
//!
//! - An item recorded in a partition lands in exactly one side
//! - Group order within a partition is insertion order
//! - Every group of a fan-out runs to completion before the outcome is known

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

// ============================================================================
// Partition
// ============================================================================

/// Desired items split by observed existence, grouped by owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<K: Ord, T> {
    exists: BTreeMap<K, Vec<T>>,
    not_exists: BTreeMap<K, Vec<T>>,
}

impl<K: Ord, T> Default for Partition<K, T> {
    fn default() -> Self {
        Self {
            exists: BTreeMap::new(),
            not_exists: BTreeMap::new(),
        }
    }
}

impl<K: Ord, T> Partition<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an item under `key` on the side selected by `present`.
    pub fn record(&mut self, key: K, present: bool, item: T) {
        let side = if present {
            &mut self.exists
        } else {
            &mut self.not_exists
        };
        side.entry(key).or_default().push(item);
    }

    /// Items observed to exist.
    pub fn existing(&self) -> &BTreeMap<K, Vec<T>> {
        &self.exists
    }

    /// Items observed to be missing.
    pub fn missing(&self) -> &BTreeMap<K, Vec<T>> {
        &self.not_exists
    }

    /// Total number of recorded items.
    pub fn len(&self) -> usize {
        self.exists.values().chain(self.not_exists.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into `(exists, not_exists)`.
    pub fn into_parts(self) -> (BTreeMap<K, Vec<T>>, BTreeMap<K, Vec<T>>) {
        (self.exists, self.not_exists)
    }
}

impl<K: Ord + Clone, T: Clone> Partition<K, T> {
    /// Both sides merged per key, existing items first.
    pub fn all(&self) -> BTreeMap<K, Vec<T>> {
        let mut merged = self.exists.clone();
        for (key, items) in &self.not_exists {
            merged.entry(key.clone()).or_default().extend(items.iter().cloned());
        }
        merged
    }
}

// ============================================================================
// Batching
// ============================================================================

/// Slice `items` into consecutive chunks of at most `size` items.
///
/// Without a size the whole list forms a single chunk. An empty list yields
/// no chunks.
pub fn batches<T>(items: Vec<T>, size: Option<NonZeroUsize>) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }

    let Some(size) = size else {
        return vec![items];
    };

    let mut chunks = Vec::with_capacity(items.len().div_ceil(size.get()));
    let mut current = Vec::with_capacity(size.get());
    for item in items {
        current.push(item);
        if current.len() == size.get() {
            chunks.push(std::mem::replace(
                &mut current,
                Vec::with_capacity(size.get()),
            ));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ============================================================================
// Fan-out
// ============================================================================

/// Why a group failed.
#[derive(Debug)]
pub enum GroupFailure<E> {
    /// The unit of work returned an error.
    Failed(E),

    /// The unit of work panicked.
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for GroupFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Outcome of every group of a fan-out, in group key order.
#[derive(Debug)]
pub struct FanOutReport<K, R, E> {
    pub succeeded: Vec<(K, R)>,
    pub failed: Vec<(K, GroupFailure<E>)>,
}

impl<K, R, E> FanOutReport<K, R, E> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Successful results, or an aggregate error if any group failed.
    pub fn into_result(self) -> Result<Vec<(K, R)>, AggregateError<K, E>> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(AggregateError {
                succeeded: self.succeeded.len(),
                failures: self.failed,
            })
        }
    }
}

/// At least one group of a fan-out failed.
#[derive(Debug)]
pub struct AggregateError<K, E> {
    /// Number of groups that completed successfully.
    pub succeeded: usize,

    /// Every failed group with its failure.
    pub failures: Vec<(K, GroupFailure<E>)>,
}

impl<K: fmt::Display, E: fmt::Display> fmt::Display for AggregateError<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} groups failed",
            self.failures.len(),
            self.failures.len() + self.succeeded
        )?;
        for (key, failure) in &self.failures {
            write!(f, "; {key}: {failure}")?;
        }
        Ok(())
    }
}

impl<K, E> std::error::Error for AggregateError<K, E>
where
    K: fmt::Display + fmt::Debug,
    E: fmt::Display + fmt::Debug,
{
}

/// Concurrent execution of one unit of work per group.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    max_concurrency: Option<NonZeroUsize>,
}

impl FanOut {
    /// Fan-out with one concurrent task per group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of groups running at the same time.
    pub fn with_max_concurrency(mut self, max: Option<NonZeroUsize>) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Run `unit` once per group, concurrently, and wait for all of them.
    ///
    /// A failing or panicking group is recorded and never cancels the
    /// others.
    pub async fn run<K, T, R, E, F, Fut>(
        &self,
        groups: BTreeMap<K, Vec<T>>,
        unit: F,
    ) -> FanOutReport<K, R, E>
    where
        K: Ord + Clone + fmt::Display + Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(K, Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let limiter = self
            .max_concurrency
            .map(|max| Arc::new(Semaphore::new(max.get())));

        let mut handles = Vec::with_capacity(groups.len());
        for (key, items) in groups {
            debug!(group = %key, items = items.len(), "Dispatching group");
            let work = unit(key.clone(), items);
            let limiter = limiter.clone();
            let handle = tokio::spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => limiter.acquire_owned().await.ok(),
                    None => None,
                };
                work.await
            });
            handles.push((key, handle));
        }

        let mut report = FanOutReport {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for (key, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => report.succeeded.push((key, result)),
                Ok(Err(e)) => {
                    warn!(group = %key, error = %e, "Group failed");
                    report.failed.push((key, GroupFailure::Failed(e)));
                }
                Err(join_error) => {
                    warn!(group = %key, error = %join_error, "Group task aborted");
                    report
                        .failed
                        .push((key, GroupFailure::Panicked(join_error.to_string())));
                }
            }
        }

        report
    }
}

// ============================================================================
// Content hashing
// ============================================================================

/// A content hash used to name derived artifacts deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a sequence of parts; parts are length-prefixed so boundaries
    /// matter.
    pub fn of<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let result = hasher.finalize();
        Self(hex::encode(&result[..16])) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
