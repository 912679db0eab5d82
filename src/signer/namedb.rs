//! Zone content: domains in canonical order, each with its RRsets, its
//! denial RRset and its authority status.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::error::{AdapterError, HsmError};
use crate::signer::hsm::HsmContext;
use crate::signer::keys::SigningKey;
use crate::signer::records::{Record, RecordType, RecordValue};
use crate::signer::rrset::{RRset, SignTally};
use crate::signer::signconf::ValidityWindow;
use crate::signer::wire::{check_record_names, is_subdomain, normalize_name, parent, CanonicalName};

/// Authority of a name within the zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Apex,
    /// Authoritative data.
    Auth,
    /// Delegation point (NS below the apex).
    Delegation,
    /// Below a delegation: glue, never signed.
    Occluded,
    /// Empty non-terminal.
    Ent,
}

impl DomainStatus {
    /// Which RRsets at a name of this status carry signatures.
    pub fn signs(&self, rtype: RecordType) -> bool {
        match self {
            DomainStatus::Apex | DomainStatus::Auth => true,
            DomainStatus::Delegation => rtype == RecordType::DS,
            DomainStatus::Occluded | DomainStatus::Ent => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub status: DomainStatus,
    pub rrsets: BTreeMap<RecordType, RRset>,
    /// NSEC at this name, or the NSEC3 whose hashed owner covers it.
    pub denial: Option<RRset>,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: DomainStatus::Auth,
            rrsets: BTreeMap::new(),
            denial: None,
        }
    }

    pub fn types(&self) -> Vec<RecordType> {
        self.rrsets.keys().copied().collect()
    }

    fn denial_eligible(&self) -> bool {
        self.status != DomainStatus::Occluded
    }

    /// Install a freshly generated denial RRset, keeping the current one
    /// (and its signatures) when nothing differs.
    pub fn set_denial(&mut self, owner: &str, ttl: u32, value: RecordValue) {
        if let Some(current) = self.denial.as_mut() {
            if current.owner == owner && current.rtype == value.record_type() {
                current.replace(ttl, vec![value]);
                return;
            }
        }
        self.denial = RRset::with_values(owner, ttl, vec![value]);
    }

    pub fn needs_signing(&self, keys: &[SigningKey], window: &ValidityWindow) -> bool {
        self.rrsets
            .values()
            .any(|r| r.needs_signing(keys, window, self.status.signs(r.rtype)))
            || self
                .denial
                .as_ref()
                .is_some_and(|d| d.needs_signing(keys, window, self.denial_eligible()))
    }

    /// Apply the recycling rules to every RRset. Returns the tally of kept
    /// signatures and whether fresh ones are needed.
    pub fn recycle(&mut self, keys: &[SigningKey], window: &ValidityWindow) -> (SignTally, bool) {
        let mut tally = SignTally::default();
        let mut missing = false;
        let status = self.status;
        for rrset in self.rrsets.values_mut() {
            let eligible = status.signs(rrset.rtype);
            tally.reused += rrset.recycle(keys, window, eligible);
            missing |= eligible && rrset.has_missing(keys);
        }
        if let Some(denial) = self.denial.as_mut() {
            let eligible = status != DomainStatus::Occluded;
            tally.reused += denial.recycle(keys, window, eligible);
            missing |= eligible && denial.has_missing(keys);
        }
        tally.observe_expiration(self.min_expiration());
        (tally, missing)
    }

    /// Produce the signatures [`Domain::recycle`] left uncovered.
    pub fn sign_missing(
        &mut self,
        ctx: &mut dyn HsmContext,
        keys: &[SigningKey],
        window: &ValidityWindow,
        apex: &str,
    ) -> Result<SignTally, HsmError> {
        let mut tally = SignTally::default();
        let status = self.status;
        for rrset in self.rrsets.values_mut() {
            if !status.signs(rrset.rtype) {
                continue;
            }
            let created = rrset.sign_missing(ctx, keys, window, apex)?;
            tally.created += created;
            if rrset.rtype == RecordType::SOA {
                tally.soa_created += created;
            }
        }
        if status != DomainStatus::Occluded {
            if let Some(denial) = self.denial.as_mut() {
                tally.created += denial.sign_missing(ctx, keys, window, apex)?;
            }
        }
        tally.observe_expiration(self.min_expiration());
        Ok(tally)
    }

    pub fn min_expiration(&self) -> Option<u32> {
        self.rrsets
            .values()
            .chain(self.denial.iter())
            .filter_map(|r| r.min_expiration())
            .min()
    }

    pub fn is_changed(&self) -> bool {
        self.rrsets.values().any(|r| r.is_changed())
    }

    pub fn signature_count(&self) -> usize {
        self.rrsets
            .values()
            .chain(self.denial.iter())
            .map(|r| r.sigs.len())
            .sum()
    }
}

/// Result of importing unsigned content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Any RRset added, removed or altered.
    pub changed: bool,
    pub inbound_serial: u32,
}

/// All domains of one zone, in canonical order.
#[derive(Debug, Clone)]
pub struct NameDb {
    apex: String,
    domains: BTreeMap<CanonicalName, Domain>,
}

impl NameDb {
    pub fn new(apex: &str) -> Self {
        Self {
            apex: normalize_name(apex),
            domains: BTreeMap::new(),
        }
    }

    pub fn apex(&self) -> &str {
        &self.apex
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Domain> {
        self.domains.get(&CanonicalName::new(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Domain> {
        self.domains.values_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.domains.keys().map(|k| k.as_str().to_string()).collect()
    }

    /// Move a domain out, e.g. to hand it to a drudger.
    pub fn take(&mut self, name: &str) -> Option<Domain> {
        self.domains.remove(&CanonicalName::new(name))
    }

    pub fn put(&mut self, domain: Domain) {
        self.domains.insert(CanonicalName::new(&domain.name), domain);
    }

    /// Replace the unsigned content with `records`. Signer-managed types
    /// and out-of-zone names are dropped. The SOA serial of the input is
    /// reported but does not by itself count as a change.
    pub fn import(&mut self, records: Vec<Record>) -> Result<ImportOutcome, AdapterError> {
        let mut incoming: BTreeMap<CanonicalName, HashMap<RecordType, (u32, Vec<RecordValue>)>> =
            BTreeMap::new();
        let mut inbound_serial = None;

        for record in records {
            let rtype = record.record_type();
            if rtype.is_signer_managed() {
                debug!("Dropping {} {} from input", record.name, rtype);
                continue;
            }
            if !is_subdomain(&record.name, &self.apex) {
                warn!("Ignoring out-of-zone record {} {}", record.name, rtype);
                continue;
            }
            check_record_names(&record.name, &record.value).map_err(AdapterError::Parse)?;
            if rtype == RecordType::SOA {
                if record.name != self.apex {
                    warn!("Ignoring SOA below apex at {}", record.name);
                    continue;
                }
                if let RecordValue::SOA { serial, .. } = &record.value {
                    inbound_serial = Some(*serial);
                }
            }
            let entry = incoming
                .entry(CanonicalName::new(&record.name))
                .or_default()
                .entry(rtype)
                .or_insert((record.ttl, Vec::new()));
            entry.0 = entry.0.min(record.ttl);
            entry.1.push(record.value);
        }

        let inbound_serial = inbound_serial
            .ok_or_else(|| AdapterError::Parse(format!("no SOA record for {}", self.apex)))?;

        let current_serial = self.soa_serial();
        let mut changed = false;

        // Drop RRsets that vanished, keep signer-managed ones.
        for (name, domain) in self.domains.iter_mut() {
            let keep = incoming.get(name);
            let before = domain.rrsets.len();
            domain
                .rrsets
                .retain(|t, _| t.is_signer_managed() || keep.is_some_and(|k| k.contains_key(t)));
            changed |= domain.rrsets.len() != before;
        }

        for (name, rrsets) in incoming {
            let domain = self
                .domains
                .entry(name.clone())
                .or_insert_with(|| Domain::new(name.as_str()));
            for (rtype, (ttl, mut values)) in rrsets {
                if rtype == RecordType::SOA {
                    values.truncate(1);
                    if let (Some(serial), Some(RecordValue::SOA { serial: s, .. })) =
                        (current_serial, values.first_mut())
                    {
                        *s = serial;
                    }
                }
                match domain.rrsets.get_mut(&rtype) {
                    Some(rrset) => changed |= rrset.replace(ttl, values),
                    None => {
                        if let Some(rrset) = RRset::with_values(name.as_str(), ttl, values) {
                            domain.rrsets.insert(rtype, rrset);
                            changed = true;
                        }
                    }
                }
            }
        }

        self.domains
            .retain(|_, d| !d.rrsets.is_empty() || d.status == DomainStatus::Ent);
        self.classify();

        Ok(ImportOutcome {
            changed,
            inbound_serial,
        })
    }

    /// Publish a signer-managed RRset at the apex, or withdraw it when
    /// `values` is empty. Returns whether the content moved.
    pub fn publish(&mut self, rtype: RecordType, ttl: u32, values: Vec<RecordValue>) -> bool {
        let apex = self.apex.clone();
        let domain = self
            .domains
            .entry(CanonicalName::new(&apex))
            .or_insert_with(|| Domain::new(apex.as_str()));
        domain.status = DomainStatus::Apex;

        if values.is_empty() {
            return domain.rrsets.remove(&rtype).is_some();
        }
        match domain.rrsets.get_mut(&rtype) {
            Some(rrset) => rrset.replace(ttl, values),
            None => match RRset::with_values(apex.as_str(), ttl, values) {
                Some(rrset) => {
                    domain.rrsets.insert(rtype, rrset);
                    true
                }
                None => false,
            },
        }
    }

    pub fn soa_serial(&self) -> Option<u32> {
        self.soa_value().and_then(|v| match v {
            RecordValue::SOA { serial, .. } => Some(*serial),
            _ => None,
        })
    }

    pub fn soa_value(&self) -> Option<&RecordValue> {
        self.get(&self.apex)?
            .rrsets
            .get(&RecordType::SOA)?
            .values()
            .first()
    }

    pub fn soa_ttl(&self) -> Option<u32> {
        Some(self.get(&self.apex)?.rrsets.get(&RecordType::SOA)?.ttl)
    }

    /// Rewrite the SOA serial, plus optional TTL and minimum overrides.
    pub fn update_soa(&mut self, serial: u32, ttl: Option<u32>, minimum: Option<u32>) -> bool {
        let Some(rrset) = self
            .domains
            .get_mut(&CanonicalName::new(&self.apex))
            .and_then(|d| d.rrsets.get_mut(&RecordType::SOA))
        else {
            return false;
        };
        let Some(mut value) = rrset.values().first().cloned() else {
            return false;
        };
        if let RecordValue::SOA {
            serial: s,
            minimum: m,
            ..
        } = &mut value
        {
            *s = serial;
            if let Some(minimum) = minimum {
                *m = minimum;
            }
        }
        let ttl = ttl.unwrap_or(rrset.ttl);
        rrset.replace(ttl, vec![value])
    }

    /// SOA minimum, the default TTL of denial records.
    pub fn soa_minimum(&self) -> u32 {
        match self.soa_value() {
            Some(RecordValue::SOA { minimum, .. }) => *minimum,
            _ => 3600,
        }
    }

    /// Recompute domain status and the empty non-terminals.
    pub fn classify(&mut self) {
        let apex = self.apex.clone();

        let mut wanted_ents = BTreeSet::new();
        for domain in self.domains.values() {
            if domain.rrsets.is_empty() {
                continue;
            }
            let mut name = domain.name.as_str();
            while let Some(up) = parent(name) {
                if !is_subdomain(up, &apex) || up == apex {
                    break;
                }
                wanted_ents.insert(CanonicalName::new(up));
                name = up;
            }
        }
        self.domains
            .retain(|k, d| !d.rrsets.is_empty() || wanted_ents.contains(k) || d.name == apex);
        for ent in wanted_ents {
            self.domains
                .entry(ent.clone())
                .or_insert_with(|| Domain::new(ent.as_str()));
        }

        let cuts: BTreeSet<String> = self
            .domains
            .values()
            .filter(|d| d.name != apex && d.rrsets.contains_key(&RecordType::NS))
            .map(|d| d.name.clone())
            .collect();

        for domain in self.domains.values_mut() {
            domain.status = if domain.name == apex {
                DomainStatus::Apex
            } else if cuts
                .iter()
                .any(|cut| domain.name != *cut && is_subdomain(&domain.name, cut))
            {
                DomainStatus::Occluded
            } else if cuts.contains(&domain.name) {
                DomainStatus::Delegation
            } else if domain.rrsets.is_empty() {
                DomainStatus::Ent
            } else {
                DomainStatus::Auth
            };
        }
    }

    /// Forget every denial RRset and its signatures.
    pub fn invalidate_denial(&mut self) {
        for domain in self.domains.values_mut() {
            domain.denial = None;
        }
    }

    pub fn is_changed(&self) -> bool {
        self.domains.values().any(|d| d.is_changed())
    }

    pub fn signature_count(&self) -> usize {
        self.domains.values().map(|d| d.signature_count()).sum()
    }

    pub fn min_expiration(&self) -> Option<u32> {
        self.domains.values().filter_map(|d| d.min_expiration()).min()
    }

    /// The signed zone: SOA first, then domains in canonical order, then
    /// the NSEC3 chain in hash order.
    pub fn to_records(&self) -> Vec<Record> {
        let mut records = Vec::new();
        let mut nsec3 = Vec::new();
        if let Some(apex) = self.get(&self.apex) {
            if let Some(soa) = apex.rrsets.get(&RecordType::SOA) {
                records.extend(soa.to_records());
            }
        }
        for domain in self.domains.values() {
            for (rtype, rrset) in &domain.rrsets {
                if domain.status == DomainStatus::Apex && *rtype == RecordType::SOA {
                    continue;
                }
                records.extend(rrset.to_records());
            }
            if let Some(denial) = &domain.denial {
                if denial.rtype == RecordType::NSEC3 {
                    nsec3.push(denial);
                } else {
                    records.extend(denial.to_records());
                }
            }
        }
        nsec3.sort_by(|a, b| a.owner.cmp(&b.owner));
        for denial in nsec3 {
            records.extend(denial.to_records());
        }
        records
    }

    pub fn to_zone_text(&self) -> String {
        let mut text = String::new();
        for record in self.to_records() {
            text.push_str(&record.to_zone_line());
            text.push('\n');
        }
        text
    }
}
