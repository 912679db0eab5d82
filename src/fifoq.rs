//! Bounded signing queue between workers and drudgers.
//!
//! A worker in its SIGN stage pushes one unit per owner name that needs
//! signatures, then blocks in [`FifoQ::wait_for_completion`] until every
//! unit it pushed has been reported by a drudger. Each push carries an
//! `Arc<Batch>` back-reference to the submitting worker's counters.
//!
//! `push` never blocks and never drops: a full queue hands the item back as
//! [`Push::Full`], and the caller waits on the not-full condition before
//! retrying. All waits re-check the shared exit flag when they resume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::lock_utils::{lock_or_recover, wait_timeout_or_recover};

/// Items carried by the queue name the batch they belong to.
pub trait Submitted {
    type Report;
    fn batch(&self) -> &Arc<Batch<Self::Report>>;
}

/// Result of a non-blocking push.
#[derive(Debug)]
pub enum Push<T> {
    Queued,
    /// Queue at capacity; the item is handed back untouched.
    Full(T),
}

impl<T> Push<T> {
    pub fn is_full(&self) -> bool {
        matches!(self, Push::Full(_))
    }
}

#[derive(Debug)]
struct BatchState<R> {
    appointed: usize,
    succeeded: usize,
    failed: usize,
    reports: Vec<R>,
    /// Set once the submitter stopped waiting; late reports are dropped.
    closed: bool,
}

/// Completion counters for one submitting worker's signing pass.
#[derive(Debug)]
pub struct Batch<R> {
    state: Mutex<BatchState<R>>,
    done: Condvar,
}

/// What the submitter learns once its barrier returns.
#[derive(Debug)]
pub struct Completion<R> {
    pub appointed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Payloads of every report received, successful or not.
    pub reports: Vec<R>,
    /// The wait ended because the engine is exiting.
    pub aborted: bool,
}

impl<R> Default for Batch<R> {
    fn default() -> Self {
        Self {
            state: Mutex::new(BatchState {
                appointed: 0,
                succeeded: 0,
                failed: 0,
                reports: Vec::new(),
                closed: false,
            }),
            done: Condvar::new(),
        }
    }
}

impl<R> Batch<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one more unit as handed to the queue.
    pub fn appoint(&self) {
        lock_or_recover(&self.state, "batch").appointed += 1;
    }

    pub fn appointed(&self) -> usize {
        lock_or_recover(&self.state, "batch").appointed
    }

    fn retire(&self, success: bool, report: R) {
        let mut state = lock_or_recover(&self.state, "batch");
        if state.closed {
            debug!("Dropping late signing report for a closed batch");
            return;
        }
        if success {
            state.succeeded += 1;
        } else {
            state.failed += 1;
        }
        assert!(
            state.succeeded + state.failed <= state.appointed,
            "batch received more reports than units appointed"
        );
        state.reports.push(report);
        if state.succeeded + state.failed == state.appointed {
            self.done.notify_all();
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// The bounded queue.
pub struct FifoQ<T> {
    inner: Mutex<Inner<T>>,
    has_work: Condvar,
    not_full: Condvar,
    exit: Arc<AtomicBool>,
    /// Upper bound on any single wait, so exit is observed even if a wakeup
    /// is missed.
    poll: Duration,
}

impl<T: Submitted> FifoQ<T> {
    pub fn new(capacity: usize, exit: Arc<AtomicBool>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            }),
            has_work: Condvar::new(),
            not_full: Condvar::new(),
            exit,
            poll: Duration::from_secs(1),
        }
    }

    fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Push without blocking. The batch is credited with one appointed unit
    /// only when the item is actually queued.
    pub fn push(&self, item: T) -> Push<T> {
        let mut inner = lock_or_recover(&self.inner, "fifoq");
        if inner.items.len() >= inner.capacity {
            return Push::Full(item);
        }
        item.batch().appoint();
        inner.items.push_back(item);
        self.has_work.notify_one();
        Push::Queued
    }

    /// Sleep until the queue has room or `timeout` passes.
    pub fn wait_not_full(&self, timeout: Duration) {
        let inner = lock_or_recover(&self.inner, "fifoq");
        if inner.items.len() < inner.capacity || self.exiting() {
            return;
        }
        let _ = wait_timeout_or_recover(&self.not_full, inner, timeout, "fifoq");
    }

    /// Push, backing off on the not-full condition until the item is queued.
    /// Hands the item back if the engine starts exiting first.
    pub fn push_blocking(&self, mut item: T) -> Result<(), T> {
        loop {
            if self.exiting() {
                return Err(item);
            }
            match self.push(item) {
                Push::Queued => return Ok(()),
                Push::Full(returned) => {
                    debug!("Signing queue full, waiting for room");
                    item = returned;
                    self.wait_not_full(self.poll);
                }
            }
        }
    }

    /// Take one item, blocking while the queue is empty. Returns `None`
    /// once the exit flag is raised.
    pub fn pop(&self) -> Option<T> {
        let mut inner = lock_or_recover(&self.inner, "fifoq");
        loop {
            if self.exiting() {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            inner = wait_timeout_or_recover(&self.has_work, inner, self.poll, "fifoq").0;
        }
    }

    /// Record one unit's outcome against its submitter's batch.
    pub fn report(&self, submitter: &Batch<T::Report>, success: bool, report: T::Report) {
        submitter.retire(success, report);
    }

    /// Block until `expected` reports arrived for `batch`.
    ///
    /// On exit the wait ends early and every unit still outstanding is
    /// counted as failed, so `appointed == succeeded + failed` holds either
    /// way.
    pub fn wait_for_completion(&self, batch: &Batch<T::Report>, expected: usize) -> Completion<T::Report> {
        let mut state = lock_or_recover(&batch.state, "batch");
        let mut aborted = false;
        while state.succeeded + state.failed < expected {
            if self.exiting() {
                let outstanding = expected - state.succeeded - state.failed;
                warn!(
                    "Abandoning wait for {} outstanding signing units on exit",
                    outstanding
                );
                state.failed += outstanding;
                aborted = true;
                break;
            }
            state = wait_timeout_or_recover(&batch.done, state, self.poll, "batch").0;
        }
        state.closed = true;
        Completion {
            appointed: state.appointed.max(expected),
            succeeded: state.succeeded,
            failed: state.failed,
            reports: std::mem::take(&mut state.reports),
            aborted,
        }
    }

    /// Remove everything still queued, for failing on shutdown.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = lock_or_recover(&self.inner, "fifoq");
        let drained: Vec<T> = inner.items.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    /// Wake every waiter so it re-checks the exit flag.
    pub fn wake_all(&self) {
        let _inner = lock_or_recover(&self.inner, "fifoq");
        self.has_work.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner, "fifoq").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock_or_recover(&self.inner, "fifoq").capacity
    }
}
