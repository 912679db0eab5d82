//! Workers pull due tasks from the scheduler and run one zone stage each.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::current_timestamp;
use crate::engine::drudger::LazyContext;
use crate::engine::stages;
use crate::engine::EngineShared;
use crate::error::SignerError;
use crate::scheduler::Task;

pub struct Worker {
    pub id: usize,
    shared: Arc<EngineShared>,
    hsm: LazyContext,
}

impl Worker {
    pub fn new(id: usize, shared: Arc<EngineShared>) -> Self {
        let hsm = LazyContext::new(shared.hsm.clone());
        Self { id, shared, hsm }
    }

    pub fn run(mut self) {
        debug!("Worker[{}] started", self.id);
        while !self.shared.exiting() {
            if let Some(task) =
                self.shared
                    .schedule
                    .wait_for_task(current_timestamp, &self.shared.exit, self.shared.poll)
            {
                self.execute(task);
            }
        }
        debug!("Worker[{}] exiting", self.id);
    }

    /// Run one ready task if there is one. Returns whether a task ran.
    pub fn run_once(&mut self) -> bool {
        match self.shared.schedule.pop_ready(current_timestamp()) {
            Some(task) => {
                self.execute(task);
                true
            }
            None => false,
        }
    }

    pub fn execute(&mut self, mut task: Task) {
        let Some(entry) = self.shared.zone_entry(task.zone) else {
            info!("Worker[{}] dropping task for removed zone {}", self.id, task.owner);
            return;
        };
        let stage = task.current();
        debug!("Worker[{}] running {} for {}", self.id, stage, task.owner);

        let result = {
            let mut zone = entry.lock();
            stages::execute(stage, &mut zone, &mut self.hsm, &self.shared, current_timestamp())
        };

        let now = current_timestamp();
        let mut queue = self.shared.schedule.lock();
        let due = match result {
            Ok(outcome) => {
                task.backoff = 0;
                task.stage.advance(outcome.next, outcome.due_date)
            }
            Err(SignerError::Interrupted) => {
                debug!("Worker[{}] {} for {} interrupted", self.id, stage, task.owner);
                now
            }
            Err(e) => {
                task.backoff = self.shared.backoff.next(task.backoff);
                if e.is_soft() {
                    info!(
                        "{}: {} postponed: {}, retry in {}s",
                        task.owner, stage, e, task.backoff
                    );
                } else if matches!(e, SignerError::Hsm(_)) {
                    error!(
                        "{}: {} failed: {}, retry in {}s",
                        task.owner, stage, e, task.backoff
                    );
                } else {
                    warn!(
                        "{}: {} failed: {}, retry in {}s",
                        task.owner, stage, e, task.backoff
                    );
                }
                if e.needs_reload() {
                    self.hsm.invalidate();
                    self.shared.request_reload();
                }
                now + task.backoff
            }
        };

        task.due_date = due;
        if let Some(target) = entry.take_interrupt() {
            task.due_date = task.stage.interrupt(target, due, now);
            debug!("{}: interrupted to {}", task.owner, target);
        }
        if let Err(e) = queue.insert(task) {
            error!("Worker[{}] failed to reschedule: {}", self.id, e);
        }
        drop(queue);
        self.shared.schedule.notify();
    }
}
