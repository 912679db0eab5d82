//! RRset signing and signature recycling.
//!
//! Before any HSM work an RRset drops the signatures it may no longer keep.
//! A signature survives only while all of these hold:
//!
//! 1. the RRset content is unchanged since it was signed,
//! 2. it still expires after `signtime + refresh`,
//! 3. its inception has passed,
//! 4. the key that made it (matched by locator and flags) is still active
//!    for the RRset's role,
//! 5. the owner is eligible for signatures at all (not occluded, and at a
//!    delegation only the DS RRset).
//!
//! Fresh signatures are then requested for every role not covered: one per
//! ZSK algorithm for ordinary RRsets, one per KSK for the DNSKEY RRset.

use std::collections::BTreeSet;

use tracing::trace;

use crate::error::HsmError;
use crate::signer::hsm::HsmContext;
use crate::signer::keys::SigningKey;
use crate::signer::records::{Record, RecordType, RecordValue};
use crate::signer::signconf::ValidityWindow;
use crate::signer::wire::{canonical_rrset, count_labels, rdata, rrsig_prefix};

/// A stored signature, remembering which roster key produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrsig {
    pub locator: String,
    pub flags: u16,
    pub algorithm: u8,
    pub key_tag: u16,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub signer_name: String,
    pub signature: Vec<u8>,
}

impl Rrsig {
    fn made_by(&self, key: &SigningKey) -> bool {
        self.locator == key.locator && self.flags == key.flags
    }

    pub fn to_value(&self, type_covered: RecordType) -> RecordValue {
        RecordValue::RRSIG {
            type_covered,
            algorithm: self.algorithm,
            labels: self.labels,
            original_ttl: self.original_ttl,
            expiration: self.expiration,
            inception: self.inception,
            key_tag: self.key_tag,
            signer_name: self.signer_name.clone(),
            signature: self.signature.clone(),
        }
    }

    /// Bytes this signature was computed over, given the RRset.
    pub fn signed_data(&self, rrset: &RRset) -> Vec<u8> {
        let mut data = rrsig_prefix(
            rrset.rtype,
            self.algorithm,
            self.labels,
            self.original_ttl,
            self.expiration,
            self.inception,
            self.key_tag,
            &self.signer_name,
        );
        data.extend_from_slice(&canonical_rrset(
            &rrset.owner,
            rrset.rtype,
            self.original_ttl,
            &rrset.values,
        ));
        data
    }
}

/// Signature counters for one RRset, domain or pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignTally {
    pub created: usize,
    pub reused: usize,
    /// New signatures over the SOA RRset.
    pub soa_created: usize,
    pub min_expiration: Option<u32>,
}

impl SignTally {
    pub fn merge(&mut self, other: &SignTally) {
        self.created += other.created;
        self.reused += other.reused;
        self.soa_created += other.soa_created;
        self.observe_expiration(other.min_expiration);
    }

    pub fn observe_expiration(&mut self, expiration: Option<u32>) {
        self.min_expiration = match (self.min_expiration, expiration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Records sharing owner and type, plus their signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RRset {
    pub owner: String,
    pub rtype: RecordType,
    pub ttl: u32,
    /// Sorted by canonical RDATA, no duplicates.
    values: Vec<RecordValue>,
    pub sigs: Vec<Rrsig>,
    changed: bool,
}

impl RRset {
    pub fn new(owner: impl Into<String>, rtype: RecordType, ttl: u32) -> Self {
        Self {
            owner: owner.into(),
            rtype,
            ttl,
            values: Vec::new(),
            sigs: Vec::new(),
            changed: true,
        }
    }

    pub fn with_values(owner: impl Into<String>, ttl: u32, values: Vec<RecordValue>) -> Option<Self> {
        let rtype = values.first()?.record_type();
        let mut rrset = Self::new(owner, rtype, ttl);
        rrset.values = canonical_order(values);
        Some(rrset)
    }

    pub fn values(&self) -> &[RecordValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Replace the content; returns whether anything differed. Signatures
    /// are kept until recycling judges them.
    pub fn replace(&mut self, ttl: u32, values: Vec<RecordValue>) -> bool {
        let values = canonical_order(values);
        if self.ttl == ttl && self.values == values {
            return false;
        }
        self.ttl = ttl;
        self.values = values;
        self.changed = true;
        true
    }

    fn is_dnskey(&self) -> bool {
        self.rtype == RecordType::DNSKEY
    }

    fn is_denial(&self) -> bool {
        matches!(self.rtype, RecordType::NSEC | RecordType::NSEC3)
    }

    fn survives(&self, sig: &Rrsig, keys: &[SigningKey], window: &ValidityWindow) -> bool {
        !self.changed
            && sig.original_ttl == self.ttl
            && sig.expiration as u64 > window.refresh_until
            && sig.inception as u64 <= window.signtime
            && keys
                .iter()
                .any(|k| sig.made_by(k) && k.is_active_for(self.is_dnskey()))
    }

    /// Keys that must produce a fresh signature, assuming `kept` survive.
    fn keys_to_sign<'k>(&self, kept: &[&Rrsig], keys: &'k [SigningKey]) -> Vec<&'k SigningKey> {
        if self.is_dnskey() {
            return keys
                .iter()
                .filter(|k| k.ksk && !kept.iter().any(|s| s.made_by(k)))
                .collect();
        }

        let mut covered: BTreeSet<u8> = kept
            .iter()
            .filter(|s| keys.iter().any(|k| s.made_by(k) && k.zsk))
            .map(|s| s.algorithm)
            .collect();
        let mut chosen = Vec::new();
        for key in keys.iter().filter(|k| k.zsk) {
            if covered.insert(key.algorithm) {
                chosen.push(key);
            }
        }
        chosen
    }

    /// Whether a SIGN pass would change this RRset's signatures.
    pub fn needs_signing(&self, keys: &[SigningKey], window: &ValidityWindow, eligible: bool) -> bool {
        if !eligible {
            return !self.sigs.is_empty();
        }
        let kept: Vec<&Rrsig> = self
            .sigs
            .iter()
            .filter(|s| self.survives(s, keys, window))
            .collect();
        kept.len() != self.sigs.len() || !self.keys_to_sign(&kept, keys).is_empty()
    }

    /// Drop signatures that may not be kept. Returns how many survived.
    /// Unsigned RRsets are settled here, signed ones by `sign_missing`.
    pub fn recycle(&mut self, keys: &[SigningKey], window: &ValidityWindow, eligible: bool) -> usize {
        if !eligible {
            self.sigs.clear();
            self.changed = false;
            return 0;
        }
        let before = self.sigs.len();
        let sigs = std::mem::take(&mut self.sigs);
        self.sigs = sigs
            .into_iter()
            .filter(|s| self.survives(s, keys, window))
            .collect();
        if self.sigs.len() != before {
            trace!(
                "{} {}: dropped {} signatures",
                self.owner,
                self.rtype,
                before - self.sigs.len()
            );
        }
        self.sigs.len()
    }

    /// Whether recycled signatures leave any role uncovered.
    pub fn has_missing(&self, keys: &[SigningKey]) -> bool {
        let kept: Vec<&Rrsig> = self.sigs.iter().collect();
        !self.keys_to_sign(&kept, keys).is_empty()
    }

    /// Request fresh signatures for every uncovered role. Call after
    /// [`RRset::recycle`]. Any HSM failure aborts the RRset.
    pub fn sign_missing(
        &mut self,
        ctx: &mut dyn HsmContext,
        keys: &[SigningKey],
        window: &ValidityWindow,
        apex: &str,
    ) -> Result<usize, HsmError> {
        let kept: Vec<&Rrsig> = self.sigs.iter().collect();
        let todo: Vec<SigningKey> = self.keys_to_sign(&kept, keys).into_iter().cloned().collect();

        let expiration = if self.is_denial() {
            window.denial_expiration
        } else {
            window.expiration
        };

        for key in &todo {
            let handle = ctx.find_key(&key.locator)?;
            let mut sig = Rrsig {
                locator: key.locator.clone(),
                flags: key.flags,
                algorithm: key.algorithm,
                key_tag: key.key_tag,
                labels: count_labels(&self.owner),
                original_ttl: self.ttl,
                expiration: expiration as u32,
                inception: window.inception as u32,
                signer_name: apex.to_string(),
                signature: Vec::new(),
            };
            sig.signature = ctx.sign(&handle, &sig.signed_data(self))?;
            self.sigs.push(sig);
        }
        self.changed = false;
        Ok(todo.len())
    }

    pub fn min_expiration(&self) -> Option<u32> {
        self.sigs.iter().map(|s| s.expiration).min()
    }

    pub fn to_records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .values
            .iter()
            .map(|v| Record::new(&self.owner, self.ttl, v.clone()))
            .collect();
        records.extend(
            self.sigs
                .iter()
                .map(|s| Record::new(&self.owner, self.ttl, s.to_value(self.rtype))),
        );
        records
    }
}

fn canonical_order(values: Vec<RecordValue>) -> Vec<RecordValue> {
    let mut keyed: Vec<(Vec<u8>, RecordValue)> = values.into_iter().map(|v| (rdata(&v), v)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    keyed.into_iter().map(|(_, v)| v).collect()
}
