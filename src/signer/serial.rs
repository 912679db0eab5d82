//! SOA serial schemes and RFC 1982 serial arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SignerError};

/// How the outbound SOA serial advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialScheme {
    /// Use the inbound serial unchanged; it must move forward.
    Keep,
    /// Increment the previous outbound serial.
    #[default]
    Counter,
    /// Seconds since the epoch.
    Unixtime,
    /// YYYYMMDDnn
    Datecounter,
}

/// `a > b` in serial number arithmetic (RFC 1982).
pub fn serial_gt(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Inbound, outbound and operator-forced serials of one zone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialState {
    /// Serial seen in the last imported SOA.
    pub inbound: Option<u32>,
    /// Serial last put in the signed SOA.
    pub outbound: Option<u32>,
    /// One-shot override from `sign <zone> --serial N`.
    pub forced: Option<u32>,
}

impl SerialState {
    /// Compute and commit the next outbound serial.
    pub fn advance(&mut self, scheme: SerialScheme, now: u64) -> Result<u32> {
        let next = self.next(scheme, now)?;
        self.commit(next);
        Ok(next)
    }

    /// The serial the next SIGN pass would publish. Nothing is consumed
    /// until [`SerialState::commit`].
    pub fn next(&self, scheme: SerialScheme, now: u64) -> Result<u32> {
        let inbound = self.inbound.unwrap_or(0);
        let candidate = if let Some(forced) = self.forced {
            forced
        } else {
            match scheme {
                SerialScheme::Keep => {
                    if let Some(prev) = self.outbound {
                        if !serial_gt(inbound, prev) {
                            return Err(SignerError::Config(format!(
                                "serial scheme keep: inbound serial {} not newer than {}",
                                inbound, prev
                            )));
                        }
                    }
                    inbound
                }
                SerialScheme::Counter => inbound,
                SerialScheme::Unixtime => now as u32,
                SerialScheme::Datecounter => datecounter_base(now),
            }
        };

        Ok(match self.outbound {
            Some(prev) if !serial_gt(candidate, prev) => prev.wrapping_add(1),
            _ => candidate,
        })
    }

    /// Record `serial` as published and drop any forced serial.
    pub fn commit(&mut self, serial: u32) {
        self.outbound = Some(serial);
        self.forced = None;
    }
}

fn datecounter_base(now: u64) -> u32 {
    DateTime::<Utc>::from_timestamp(now as i64, 0)
        .and_then(|t| t.format("%Y%m%d").to_string().parse::<u32>().ok())
        .map(|day| day.saturating_mul(100))
        .unwrap_or(now as u32)
}
