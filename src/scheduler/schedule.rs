//! Time-ordered task queue shared by the worker pool.
//!
//! Tasks are ordered by `(due_date, owner)`, so tasks due at the same second
//! come out in lexical zone-name order. One mutex guards the queue; one
//! condition variable wakes idle workers. Stage execution never happens
//! under this lock: workers pop a task, release, run the stage, and lock
//! again to reschedule.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Result, SignerError};
use crate::lock_utils::{lock_or_recover, wait_timeout_or_recover};
use crate::scheduler::task::{Stage, Task};

/// The tasks themselves; reachable through [`Schedule::lock`] for compound
/// operations that must be atomic with respect to workers.
#[derive(Debug, Default)]
pub struct Queue {
    tasks: BTreeMap<(u64, String), Task>,
    owners: HashMap<String, u64>,
    loading: bool,
}

impl Queue {
    /// Insert a task; an owner may hold only one task at a time.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.owners.contains_key(&task.owner) {
            return Err(SignerError::SchedulingConflict(task.owner));
        }
        self.owners.insert(task.owner.clone(), task.due_date);
        self.tasks.insert((task.due_date, task.owner.clone()), task);
        Ok(())
    }

    /// Remove the owner's task if present and, when `stage` is given, only
    /// if the task is at that stage.
    pub fn remove(&mut self, owner: &str, stage: Option<Stage>) -> Option<Task> {
        let due = *self.owners.get(owner)?;
        let key = (due, owner.to_string());
        if let Some(stage) = stage {
            if self.tasks.get(&key).map(|t| t.current()) != Some(stage) {
                return None;
            }
        }
        self.owners.remove(owner);
        self.tasks.remove(&key)
    }

    /// Remove and return the earliest task due at or before `now`.
    pub fn pop_ready(&mut self, now: u64) -> Option<Task> {
        let key = self.tasks.keys().next()?.clone();
        if key.0 > now {
            return None;
        }
        let task = self.tasks.remove(&key)?;
        self.owners.remove(&task.owner);
        Some(task)
    }

    pub fn first(&self) -> Option<&Task> {
        self.tasks.values().next()
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.owners.contains_key(owner)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Pull every task due date in to `now`.
    fn flush(&mut self, now: u64) -> usize {
        let tasks = std::mem::take(&mut self.tasks);
        let count = tasks.len();
        self.owners.clear();
        for (_, mut task) in tasks {
            task.due_date = task.due_date.min(now);
            self.owners.insert(task.owner.clone(), task.due_date);
            self.tasks.insert((task.due_date, task.owner.clone()), task);
        }
        count
    }
}

/// Thread-safe scheduler.
#[derive(Debug, Default)]
pub struct Schedule {
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the queue for a compound operation. Call [`Schedule::notify`]
    /// after releasing the guard if tasks were added.
    pub fn lock(&self) -> MutexGuard<'_, Queue> {
        lock_or_recover(&self.queue, "schedule")
    }

    /// Wake one idle worker unless a bulk load is in progress.
    pub fn notify(&self) {
        let queue = self.lock();
        if !queue.loading {
            self.wake.notify_one();
        }
    }

    /// Wake every idle worker, regardless of the loading flag.
    pub fn wake_all(&self) {
        let _queue = self.lock();
        self.wake.notify_all();
    }

    /// Insert a task. Fails with [`SignerError::SchedulingConflict`] if the
    /// owner already has a task; the caller must unschedule first.
    pub fn schedule(&self, task: Task) -> Result<()> {
        let mut queue = self.lock();
        debug!(
            "Scheduling {} for {} at {}",
            task.current(),
            task.owner,
            task.due_date
        );
        queue.insert(task)?;
        if !queue.loading {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Remove a pending task; no-op if absent.
    pub fn unschedule(&self, owner: &str, stage: Option<Stage>) -> Option<Task> {
        self.lock().remove(owner, stage)
    }

    pub fn pop_ready(&self, now: u64) -> Option<Task> {
        self.lock().pop_ready(now)
    }

    /// Clone of the earliest task, without removing it.
    pub fn peek_first(&self) -> Option<Task> {
        self.lock().first().cloned()
    }

    /// Force every due date to `now` and wake all sleeping workers.
    pub fn flush_all(&self, now: u64) -> usize {
        let mut queue = self.lock();
        let count = queue.flush(now);
        self.wake.notify_all();
        count
    }

    /// While loading, inserts do not wake workers; clearing the flag wakes
    /// all of them once.
    pub fn set_loading(&self, loading: bool) {
        let mut queue = self.lock();
        queue.loading = loading;
        if !loading {
            self.wake.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of all pending tasks in due order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().iter().cloned().collect()
    }

    /// Remove every task.
    pub fn purge(&self) -> Vec<Task> {
        let mut queue = self.lock();
        queue.owners.clear();
        std::mem::take(&mut queue.tasks).into_values().collect()
    }

    /// Worker idle path: pop a ready task, or sleep until the first task is
    /// due (at most `poll`) and try once more.
    ///
    /// `exit` is re-checked under the queue lock right before sleeping, and
    /// whoever raises it must call [`Schedule::wake_all`], so the wakeup
    /// cannot be lost.
    pub fn wait_for_task(&self, now: impl Fn() -> u64, exit: &AtomicBool, poll: Duration) -> Option<Task> {
        let mut queue = self.lock();
        if let Some(task) = queue.pop_ready(now()) {
            return Some(task);
        }
        let timeout = match queue.first() {
            Some(task) => Duration::from_secs(task.due_date.saturating_sub(now())).min(poll),
            None => poll,
        };
        if exit.load(Ordering::SeqCst) {
            return None;
        }
        trace!("Worker sleeping for {:?}", timeout);
        let (mut queue, _) = wait_timeout_or_recover(&self.wake, queue, timeout, "schedule");
        if exit.load(Ordering::SeqCst) {
            return None;
        }
        queue.pop_ready(now())
    }
}
