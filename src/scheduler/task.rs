//! Scheduled units of work and the per-zone stage state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signer::ZoneHandle;

/// Pipeline stage of a zone.
///
/// `None -> Signconf -> Read -> Sign -> Write -> Sign (at resign interval)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    None,
    Signconf,
    Read,
    Sign,
    Write,
}

impl Stage {
    /// Position in the pipeline, used to decide when an interrupted chain
    /// has caught up with the stage it displaced.
    pub fn order(&self) -> u8 {
        match self {
            Stage::None => 0,
            Stage::Signconf => 1,
            Stage::Read => 2,
            Stage::Sign => 3,
            Stage::Write => 4,
        }
    }

    /// Natural successor after a successful run.
    pub fn successor(&self) -> Stage {
        match self {
            Stage::None => Stage::Signconf,
            Stage::Signconf => Stage::Read,
            Stage::Read => Stage::Sign,
            Stage::Sign => Stage::Write,
            Stage::Write => Stage::Sign,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::None => write!(f, "none"),
            Stage::Signconf => write!(f, "signconf"),
            Stage::Read => write!(f, "read"),
            Stage::Sign => write!(f, "sign"),
            Stage::Write => write!(f, "write"),
        }
    }
}

/// A stage displaced by an interrupt, with the time it was due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted {
    pub stage: Stage,
    pub due_date: u64,
}

/// Current stage plus the stage an interrupt displaced, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageState {
    pub current: Stage,
    pub halted: Option<Halted>,
}

impl Default for StageState {
    fn default() -> Self {
        Self::new(Stage::None)
    }
}

impl StageState {
    pub fn new(current: Stage) -> Self {
        Self {
            current,
            halted: None,
        }
    }

    /// Jump to `target` now, remembering `(current, due_date)` so the chain
    /// can pick it up again.
    ///
    /// An interrupt never skips ahead of the displaced stage: asking for a
    /// later stage than the one pending only expedites the pending one.
    /// Returns the due date the task should carry afterwards.
    pub fn interrupt(&mut self, target: Stage, due_date: u64, now: u64) -> u64 {
        let displaced = self.current;
        if displaced != Stage::None && target.order() > displaced.order() {
            return now;
        }
        if target == displaced {
            return now;
        }
        if self.halted.is_none() && displaced != Stage::None {
            self.halted = Some(Halted {
                stage: displaced,
                due_date,
            });
        }
        self.current = target;
        now
    }

    /// Move to `next` after a successful run due at `due_date`.
    ///
    /// Once the chain reaches the halted stage's position the halted stage is
    /// dropped, keeping whichever due date comes first.
    pub fn advance(&mut self, next: Stage, due_date: u64) -> u64 {
        self.current = next;
        match self.halted {
            Some(halted) if next.order() >= halted.stage.order() => {
                self.halted = None;
                due_date.min(halted.due_date)
            }
            _ => due_date,
        }
    }
}

/// One zone's pending work in the scheduler.
#[derive(Debug, Clone)]
pub struct Task {
    /// Zone name; unique across the scheduler.
    pub owner: String,
    /// Arena handle of the zone.
    pub zone: ZoneHandle,
    pub stage: StageState,
    /// Unix seconds.
    pub due_date: u64,
    /// Seconds; 0 after a success.
    pub backoff: u64,
}

impl Task {
    pub fn new(owner: impl Into<String>, zone: ZoneHandle, stage: Stage, due_date: u64) -> Self {
        Self {
            owner: owner.into(),
            zone,
            stage: StageState::new(stage),
            due_date,
            backoff: 0,
        }
    }

    pub fn current(&self) -> Stage {
        self.stage.current
    }
}
