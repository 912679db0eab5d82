//! Drudgers: signing-only threads fed by the FifoQ.
//!
//! Every popped unit is reported exactly once, whatever happens to it.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::engine::EngineShared;
use crate::error::HsmError;
use crate::fifoq::{Batch, Submitted};
use crate::signer::hsm::{Hsm, HsmContext};
use crate::signer::namedb::Domain;
use crate::signer::rrset::SignTally;
use crate::signer::zone::SignPass;

/// One owner name's RRsets, handed to a drudger.
#[derive(Debug)]
pub struct SignUnit {
    pub domain: Domain,
    pub pass: Arc<SignPass>,
    pub batch: Arc<Batch<UnitReport>>,
}

impl Submitted for SignUnit {
    type Report = UnitReport;

    fn batch(&self) -> &Arc<Batch<UnitReport>> {
        &self.batch
    }
}

/// A unit coming back: the domain always returns to its zone.
#[derive(Debug)]
pub struct UnitReport {
    pub domain: Domain,
    pub tally: SignTally,
    pub error: Option<HsmError>,
}

/// Per-thread HSM context, created on first use and dropped when the HSM
/// reports it unhealthy.
pub struct LazyContext {
    hsm: Arc<dyn Hsm>,
    ctx: Option<Box<dyn HsmContext>>,
}

impl LazyContext {
    pub fn new(hsm: Arc<dyn Hsm>) -> Self {
        Self { hsm, ctx: None }
    }

    pub fn get(&mut self) -> Result<&mut dyn HsmContext, HsmError> {
        if let Some(ctx) = &self.ctx {
            if let Err(e) = ctx.check() {
                self.ctx = None;
                return Err(e);
            }
        }
        if self.ctx.is_none() {
            self.ctx = Some(self.hsm.create_context()?);
        }
        match self.ctx.as_deref_mut() {
            Some(ctx) => Ok(ctx),
            None => Err(HsmError::Closed),
        }
    }

    pub fn invalidate(&mut self) {
        self.ctx = None;
    }

    pub fn is_open(&self) -> bool {
        self.ctx.is_some()
    }
}

pub struct Drudger {
    pub id: usize,
    shared: Arc<EngineShared>,
    hsm: LazyContext,
    /// Earliest expiration among the signatures this thread produced.
    min_expiration: Option<u32>,
}

impl Drudger {
    pub fn new(id: usize, shared: Arc<EngineShared>) -> Self {
        let hsm = LazyContext::new(shared.hsm.clone());
        Self {
            id,
            shared,
            hsm,
            min_expiration: None,
        }
    }

    pub fn min_expiration(&self) -> Option<u32> {
        self.min_expiration
    }

    /// Pop and sign until the exit flag is raised.
    pub fn run(mut self) {
        debug!("Drudger[{}] started", self.id);
        while let Some(unit) = self.shared.fifoq.pop() {
            self.process(unit);
        }
        debug!("Drudger[{}] exiting", self.id);
    }

    pub fn process(&mut self, unit: SignUnit) {
        let SignUnit {
            mut domain,
            pass,
            batch,
        } = unit;
        trace!("Drudger[{}] signing {}", self.id, domain.name);

        let ctx = match self.hsm.get() {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(
                    "Drudger[{}] cannot create HSM context: {}, requesting reload",
                    self.id, e
                );
                self.shared.request_reload();
                self.shared.fifoq.report(
                    &batch,
                    false,
                    UnitReport {
                        domain,
                        tally: SignTally::default(),
                        error: Some(e),
                    },
                );
                return;
            }
        };

        match domain.sign_missing(ctx, &pass.keys, &pass.window, &pass.apex) {
            Ok(tally) => {
                if let Some(expiration) = tally.min_expiration {
                    self.min_expiration =
                        Some(self.min_expiration.map_or(expiration, |m| m.min(expiration)));
                }
                self.shared.fifoq.report(
                    &batch,
                    true,
                    UnitReport {
                        domain,
                        tally,
                        error: None,
                    },
                );
            }
            Err(e) => {
                warn!("Drudger[{}] failed to sign {}: {}", self.id, domain.name, e);
                if e.is_context_failure() {
                    self.hsm.invalidate();
                    self.shared.request_reload();
                }
                self.shared.fifoq.report(
                    &batch,
                    false,
                    UnitReport {
                        domain,
                        tally: SignTally::default(),
                        error: Some(e),
                    },
                );
            }
        }
    }
}
