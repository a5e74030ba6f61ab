//! A bounded, thread-safe window of recent [`Sample`] records.
//!
//! The window sits between the ingest hot path and the flush worker: ingest
//! appends under the write lock, live queries copy under the read lock, and
//! the flush worker swaps the whole backing vector out in O(1).
//!
//! When the window is full new samples are dropped rather than applying
//! back-pressure to ingest; the drop count is tracked so operators can see
//! when the window is undersized.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs
)]

use std::sync::atomic::{AtomicU64, Ordering};

use data_types::Sample;
use parking_lot::RwLock;

/// Default window capacity, in samples.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// A bounded buffer of recent samples.
///
/// All operations serialize on one reader/writer lock; none holds it across
/// I/O.
#[derive(Debug)]
pub struct RingWindow {
    samples: RwLock<Vec<Sample>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for RingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RingWindow {
    /// Initialise a window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append `sample`, dropping it silently when the window is full.
    pub fn add(&self, sample: Sample) {
        let mut samples = self.samples.write();
        if samples.len() >= self.capacity {
            drop(samples);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        samples.push(sample);
    }

    /// Swap the window contents for a fresh, empty backing vector of the same
    /// capacity, returning everything buffered so far in insertion order.
    pub fn flush(&self) -> Vec<Sample> {
        let mut samples = self.samples.write();
        std::mem::replace(&mut *samples, Vec::with_capacity(self.capacity))
    }

    /// A defensive copy of the current contents, in insertion order.
    pub fn read_all(&self) -> Vec<Sample> {
        self.samples.read().clone()
    }

    /// Number of samples currently buffered.
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    /// `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of samples dropped on overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
