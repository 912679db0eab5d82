//! Authenticated denial of existence: NSEC (RFC 4034) and NSEC3 (RFC 5155)
//! chains, regenerated over the name database on every SIGN pass.

use std::collections::BTreeMap;

use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use tracing::{debug, warn};

use crate::error::Result;
use crate::signer::namedb::{DomainStatus, NameDb};
use crate::signer::records::{RecordType, RecordValue};
use crate::signer::signconf::DenialConfig;
use crate::signer::wire::{base32hex_encode, name_to_wire};

/// NSEC3 flag: this record may cover unsigned delegations.
pub const NSEC3_OPTOUT: u8 = 0x01;

/// NSEC3PARAM value for the configured chain, if any.
pub fn nsec3param(config: &DenialConfig) -> Result<Option<RecordValue>> {
    match config {
        DenialConfig::Nsec { .. } => Ok(None),
        DenialConfig::Nsec3 {
            algorithm,
            iterations,
            ..
        } => Ok(Some(RecordValue::NSEC3PARAM {
            hash_algorithm: *algorithm,
            // Opt-out is signalled in NSEC3 records only.
            flags: 0,
            iterations: *iterations,
            salt: config.salt_bytes()?,
        })),
    }
}

/// Rebuild the denial chain. Unchanged records keep their signatures.
pub fn rebuild(db: &mut NameDb, config: &DenialConfig) -> Result<()> {
    let ttl = config.ttl().unwrap_or_else(|| db.soa_minimum());
    match config {
        DenialConfig::Nsec { .. } => {
            build_nsec(db, ttl);
            Ok(())
        }
        DenialConfig::Nsec3 {
            iterations,
            optout,
            ..
        } => {
            let salt = config.salt_bytes()?;
            build_nsec3(db, ttl, *iterations, &salt, *optout);
            Ok(())
        }
    }
}

fn build_nsec(db: &mut NameDb, ttl: u32) {
    let chain: Vec<String> = db
        .iter()
        .filter(|d| {
            matches!(
                d.status,
                DomainStatus::Apex | DomainStatus::Auth | DomainStatus::Delegation
            )
        })
        .map(|d| d.name.clone())
        .collect();

    let mut next_of: BTreeMap<String, String> = BTreeMap::new();
    for (i, name) in chain.iter().enumerate() {
        let next = &chain[(i + 1) % chain.len()];
        next_of.insert(name.clone(), next.clone());
    }

    for domain in db.iter_mut() {
        let Some(next) = next_of.get(&domain.name) else {
            domain.denial = None;
            continue;
        };
        let mut types = domain.types();
        types.push(RecordType::RRSIG);
        types.push(RecordType::NSEC);
        types.sort();
        types.dedup();
        let owner = domain.name.clone();
        domain.set_denial(
            &owner,
            ttl,
            RecordValue::NSEC {
                next_domain: next.clone(),
                types,
            },
        );
    }
    debug!("NSEC chain for {} has {} links", db.apex(), chain.len());
}

/// Iterated, salted SHA-1 of a name (RFC 5155 section 5).
pub fn nsec3_hash(name: &str, salt: &[u8], iterations: u16) -> Vec<u8> {
    let mut input = name_to_wire(name);
    input.extend_from_slice(salt);
    let mut hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &input).as_ref().to_vec();
    for _ in 0..iterations {
        let mut round = hash;
        round.extend_from_slice(salt);
        hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &round).as_ref().to_vec();
    }
    hash
}

fn build_nsec3(db: &mut NameDb, ttl: u32, iterations: u16, salt: &[u8], optout: bool) {
    let apex = db.apex().to_string();

    let mut hashed: BTreeMap<Vec<u8>, String> = BTreeMap::new();
    for domain in db.iter() {
        let participates = match domain.status {
            DomainStatus::Apex | DomainStatus::Auth | DomainStatus::Ent => true,
            DomainStatus::Delegation => !optout || domain.rrsets.contains_key(&RecordType::DS),
            DomainStatus::Occluded => false,
        };
        if !participates {
            continue;
        }
        let hash = nsec3_hash(&domain.name, salt, iterations);
        if let Some(other) = hashed.insert(hash, domain.name.clone()) {
            warn!("NSEC3 hash collision between {} and {}", other, domain.name);
        }
    }

    let order: Vec<&Vec<u8>> = hashed.keys().collect();
    let mut links: BTreeMap<String, (Vec<u8>, Vec<u8>)> = BTreeMap::new();
    for (i, hash) in order.iter().enumerate() {
        let next = order[(i + 1) % order.len()];
        if let Some(name) = hashed.get(*hash) {
            links.insert(name.clone(), ((*hash).clone(), next.clone()));
        }
    }

    let flags = if optout { NSEC3_OPTOUT } else { 0 };
    for domain in db.iter_mut() {
        let Some((hash, next)) = links.remove(&domain.name) else {
            domain.denial = None;
            continue;
        };
        let mut types = domain.types();
        let signed = match domain.status {
            DomainStatus::Apex | DomainStatus::Auth => true,
            DomainStatus::Delegation => domain.rrsets.contains_key(&RecordType::DS),
            _ => false,
        };
        if signed {
            types.push(RecordType::RRSIG);
        }
        types.sort();
        types.dedup();
        let owner = format!("{}.{}", base32hex_encode(&hash), apex);
        domain.set_denial(
            &owner,
            ttl,
            RecordValue::NSEC3 {
                hash_algorithm: 1,
                flags,
                iterations,
                salt: salt.to_vec(),
                next_hashed: next,
                types,
            },
        );
    }
    debug!("NSEC3 chain for {} has {} links", apex, order.len());
}
