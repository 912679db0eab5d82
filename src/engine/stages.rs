//! Stage bodies. Each runs with the zone lock held by the calling worker
//! and tells the worker which stage comes next and when.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::engine::drudger::{LazyContext, SignUnit};
use crate::engine::EngineShared;
use crate::error::{Result, SignerError};
use crate::fifoq::Batch;
use crate::scheduler::Stage;
use crate::signer::zone::{SignPass, Zone};

/// Where a successful stage leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub next: Stage,
    pub due_date: u64,
}

impl StageOutcome {
    fn now(next: Stage, now: u64) -> Self {
        Self {
            next,
            due_date: now,
        }
    }
}

pub fn execute(
    stage: Stage,
    zone: &mut Zone,
    hsm: &mut LazyContext,
    shared: &EngineShared,
    now: u64,
) -> Result<StageOutcome> {
    match stage {
        Stage::None => panic!("task for {} has no stage", zone.name),
        Stage::Signconf => {
            zone.load_signconf()?;
            Ok(StageOutcome::now(Stage::Read, now))
        }
        Stage::Read => {
            let ctx = hsm.get()?;
            if !zone.read(ctx)? {
                debug!("{}: input unchanged, signatures will be recycled", zone.name);
            }
            Ok(StageOutcome::now(Stage::Sign, now))
        }
        Stage::Sign => {
            sign(zone, hsm, shared, now)?;
            Ok(StageOutcome::now(Stage::Write, now))
        }
        Stage::Write => {
            let outcome = zone.write(now)?;
            if outcome.written {
                if let (Some(notifier), Some(location)) = (&shared.notifier, zone.output_location()) {
                    notifier.notify(&zone.name, &location);
                }
            }
            Ok(StageOutcome {
                next: Stage::Sign,
                due_date: outcome.next_sign,
            })
        }
    }
}

fn sign(zone: &mut Zone, hsm: &mut LazyContext, shared: &EngineShared, now: u64) -> Result<()> {
    let started = Instant::now();
    let pass = zone.prepare_sign(hsm.get()?, now)?;
    let result = sign_pass(zone, pass, hsm, shared, now, started);
    if result.is_err() {
        zone.abort_sign();
    }
    result
}

fn sign_pass(
    zone: &mut Zone,
    pass: SignPass,
    hsm: &mut LazyContext,
    shared: &EngineShared,
    now: u64,
    started: Instant,
) -> Result<()> {
    let (mut tally, units) = zone.take_units(&pass);
    debug!(
        "{}: {} domains need signatures, {} signatures recycled",
        zone.name,
        units.len(),
        tally.reused
    );

    if !shared.has_drudgers() {
        let ctx = hsm.get()?;
        let mut units = units.into_iter();
        while let Some(mut domain) = units.next() {
            let result = domain.sign_missing(ctx, &pass.keys, &pass.window, &pass.apex);
            zone.restore(domain);
            match result {
                Ok(done) => tally.merge(&done),
                Err(e) => {
                    units.for_each(|d| zone.restore(d));
                    return Err(e.into());
                }
            }
        }
        zone.finish_sign(&tally, now, started.elapsed());
        return Ok(());
    }

    let batch = Batch::new();
    let pass = Arc::new(pass);
    let mut pushed = 0;
    let mut unqueued = Vec::new();
    for domain in units {
        let unit = SignUnit {
            domain,
            pass: pass.clone(),
            batch: batch.clone(),
        };
        match shared.fifoq.push_blocking(unit) {
            Ok(()) => pushed += 1,
            Err(unit) => unqueued.push(unit.domain),
        }
    }

    let completion = shared.fifoq.wait_for_completion(&batch, pushed);
    let interrupted = completion.aborted || !unqueued.is_empty();
    let mut first_error = None;
    for report in completion.reports {
        tally.merge(&report.tally);
        if let Some(e) = report.error {
            first_error.get_or_insert(e);
        }
        zone.restore(report.domain);
    }
    for domain in unqueued {
        zone.restore(domain);
    }

    if interrupted {
        if completion.aborted {
            // Units still with drudgers never come back.
            warn!(
                "{}: signing interrupted with units outstanding, content will be re-read",
                zone.name
            );
            zone.discard_content();
        }
        return Err(SignerError::Interrupted);
    }
    if completion.failed > 0 {
        if let Some(e) = first_error {
            error!("{}: {}", zone.name, e);
        }
        return Err(SignerError::Batch {
            appointed: completion.appointed,
            failed: completion.failed,
        });
    }

    zone.finish_sign(&tally, now, started.elapsed());
    if tally.created > 0 {
        info!(
            "{}: {} units signed by drudgers, min expiration {:?}",
            zone.name, pushed, tally.min_expiration
        );
    }
    Ok(())
}
