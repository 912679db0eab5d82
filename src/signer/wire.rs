//! Canonical wire encoding (RFC 4034 section 6) used for signing and for
//! NSEC/NSEC3 chain ordering.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::signer::records::{RecordType, RecordValue};

/// Lower-case, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim().trim_end_matches('.');
    trimmed.to_lowercase()
}

/// Label and name limits (RFC 1035 section 2.3.4).
pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

/// Reject names whose wire form would not fit the length octets.
pub fn check_name(name: &str) -> Result<(), String> {
    let mut wire_len = 1;
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(format!(
                "label '{}' in {} exceeds {} octets",
                label, name, MAX_LABEL_LEN
            ));
        }
        wire_len += label.len() + 1;
    }
    if wire_len > MAX_NAME_LEN {
        return Err(format!("name {} exceeds {} octets", name, MAX_NAME_LEN));
    }
    Ok(())
}

/// Check the owner and every name embedded in the RDATA.
pub fn check_record_names(owner: &str, value: &RecordValue) -> Result<(), String> {
    check_name(owner)?;
    match value {
        RecordValue::CNAME(name) | RecordValue::NS(name) | RecordValue::PTR(name) => check_name(name),
        RecordValue::MX { exchange, .. } => check_name(exchange),
        RecordValue::SRV { target, .. } => check_name(target),
        RecordValue::SOA { mname, rname, .. } => {
            check_name(mname)?;
            check_name(rname)
        }
        RecordValue::NSEC { next_domain, .. } => check_name(next_domain),
        RecordValue::RRSIG { signer_name, .. } => check_name(signer_name),
        _ => Ok(()),
    }
}

/// Convert a domain name to canonical (lower-case) wire format.
pub fn name_to_wire(name: &str) -> Vec<u8> {
    let mut wire = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        let lower = label.to_lowercase();
        wire.push(lower.len() as u8);
        wire.extend_from_slice(lower.as_bytes());
    }
    wire.push(0);
    wire
}

/// RRSIG label count: the wildcard label does not count.
pub fn count_labels(name: &str) -> u8 {
    name.split('.')
        .filter(|s| !s.is_empty())
        .enumerate()
        .filter(|(i, s)| !(*i == 0 && *s == "*"))
        .count() as u8
}

/// Canonical DNS name ordering (RFC 4034 section 6.1).
pub fn canonical_compare(a: &str, b: &str) -> Ordering {
    let a_labels: Vec<String> = a
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect();
    let b_labels: Vec<String> = b
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect();

    for (a_label, b_label) in a_labels.iter().rev().zip(b_labels.iter().rev()) {
        let cmp = a_label.as_bytes().cmp(b_label.as_bytes());
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    a_labels.len().cmp(&b_labels.len())
}

/// A name that sorts in canonical DNS order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalName(String);

impl CanonicalName {
    pub fn new(name: &str) -> Self {
        Self(normalize_name(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for CanonicalName {
    fn cmp(&self, other: &Self) -> Ordering {
        canonical_compare(&self.0, &other.0)
    }
}

impl PartialOrd for CanonicalName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether `name` is `apex` or below it.
pub fn is_subdomain(name: &str, apex: &str) -> bool {
    name == apex || name.ends_with(&format!(".{}", apex))
}

/// Immediate parent name, `None` at the root.
pub fn parent(name: &str) -> Option<&str> {
    name.split_once('.').map(|(_, rest)| rest)
}

/// NSEC/NSEC3 type bitmap (RFC 4034 section 4.1.2).
pub fn types_to_bitmap(types: &[RecordType]) -> Vec<u8> {
    let mut windows: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for rtype in types {
        let code = rtype.code();
        windows
            .entry((code >> 8) as u8)
            .or_default()
            .push((code & 0xff) as u8);
    }

    let mut bitmap = Vec::new();
    for (window, offsets) in windows {
        let max_offset = offsets.iter().max().copied().unwrap_or(0);
        let len = (max_offset / 8) as usize + 1;
        let mut bits = vec![0u8; len];
        for offset in offsets {
            bits[(offset / 8) as usize] |= 0x80 >> (offset % 8);
        }
        bitmap.push(window);
        bitmap.push(len as u8);
        bitmap.extend(bits);
    }
    bitmap
}

/// Canonical RDATA for a record value. Embedded names are lower-cased.
pub fn rdata(value: &RecordValue) -> Vec<u8> {
    match value {
        RecordValue::A(ip) => ip.octets().to_vec(),
        RecordValue::AAAA(ip) => ip.octets().to_vec(),
        RecordValue::CNAME(name) | RecordValue::NS(name) | RecordValue::PTR(name) => name_to_wire(name),
        RecordValue::MX {
            preference,
            exchange,
        } => {
            let mut rdata = preference.to_be_bytes().to_vec();
            rdata.extend_from_slice(&name_to_wire(exchange));
            rdata
        }
        RecordValue::TXT(text) => {
            let mut rdata = Vec::new();
            let bytes = text.as_bytes();
            if bytes.is_empty() {
                rdata.push(0);
            }
            for chunk in bytes.chunks(255) {
                rdata.push(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
            rdata
        }
        RecordValue::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            let mut rdata = name_to_wire(mname);
            rdata.extend_from_slice(&name_to_wire(rname));
            for field in [serial, refresh, retry, expire, minimum] {
                rdata.extend_from_slice(&field.to_be_bytes());
            }
            rdata
        }
        RecordValue::CAA { flags, tag, value } => {
            let mut rdata = vec![*flags, tag.len() as u8];
            rdata.extend_from_slice(tag.as_bytes());
            rdata.extend_from_slice(value.as_bytes());
            rdata
        }
        RecordValue::SRV {
            priority,
            weight,
            port,
            target,
        } => {
            let mut rdata = Vec::new();
            rdata.extend_from_slice(&priority.to_be_bytes());
            rdata.extend_from_slice(&weight.to_be_bytes());
            rdata.extend_from_slice(&port.to_be_bytes());
            rdata.extend_from_slice(&name_to_wire(target));
            rdata
        }
        RecordValue::DS {
            key_tag,
            algorithm,
            digest_type,
            digest,
        } => {
            let mut rdata = key_tag.to_be_bytes().to_vec();
            rdata.push(*algorithm);
            rdata.push(*digest_type);
            rdata.extend_from_slice(digest);
            rdata
        }
        RecordValue::DNSKEY {
            flags,
            protocol,
            algorithm,
            public_key,
        } => {
            let mut rdata = flags.to_be_bytes().to_vec();
            rdata.push(*protocol);
            rdata.push(*algorithm);
            rdata.extend_from_slice(public_key);
            rdata
        }
        RecordValue::RRSIG {
            type_covered,
            algorithm,
            labels,
            original_ttl,
            expiration,
            inception,
            key_tag,
            signer_name,
            signature,
        } => {
            let mut rdata = rrsig_prefix(
                *type_covered,
                *algorithm,
                *labels,
                *original_ttl,
                *expiration,
                *inception,
                *key_tag,
                signer_name,
            );
            rdata.extend_from_slice(signature);
            rdata
        }
        RecordValue::NSEC { next_domain, types } => {
            let mut rdata = name_to_wire(next_domain);
            rdata.extend_from_slice(&types_to_bitmap(types));
            rdata
        }
        RecordValue::NSEC3 {
            hash_algorithm,
            flags,
            iterations,
            salt,
            next_hashed,
            types,
        } => {
            let mut rdata = vec![*hash_algorithm, *flags];
            rdata.extend_from_slice(&iterations.to_be_bytes());
            rdata.push(salt.len() as u8);
            rdata.extend_from_slice(salt);
            rdata.push(next_hashed.len() as u8);
            rdata.extend_from_slice(next_hashed);
            rdata.extend_from_slice(&types_to_bitmap(types));
            rdata
        }
        RecordValue::NSEC3PARAM {
            hash_algorithm,
            flags,
            iterations,
            salt,
        } => {
            let mut rdata = vec![*hash_algorithm, *flags];
            rdata.extend_from_slice(&iterations.to_be_bytes());
            rdata.push(salt.len() as u8);
            rdata.extend_from_slice(salt);
            rdata
        }
    }
}

/// RRSIG RDATA without the signature field: the first part of the data to
/// be signed (RFC 4034 section 3.1.8.1).
#[allow(clippy::too_many_arguments)]
pub fn rrsig_prefix(
    type_covered: RecordType,
    algorithm: u8,
    labels: u8,
    original_ttl: u32,
    expiration: u32,
    inception: u32,
    key_tag: u16,
    signer_name: &str,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(18 + signer_name.len() + 2);
    data.extend_from_slice(&type_covered.code().to_be_bytes());
    data.push(algorithm);
    data.push(labels);
    data.extend_from_slice(&original_ttl.to_be_bytes());
    data.extend_from_slice(&expiration.to_be_bytes());
    data.extend_from_slice(&inception.to_be_bytes());
    data.extend_from_slice(&key_tag.to_be_bytes());
    data.extend_from_slice(&name_to_wire(signer_name));
    data
}

/// Canonical RRset wire form: `owner | type | class IN | ttl | rdlen | rdata`
/// for each record, ordered by RDATA.
pub fn canonical_rrset(owner: &str, rtype: RecordType, ttl: u32, values: &[RecordValue]) -> Vec<u8> {
    let owner_wire = name_to_wire(owner);
    let mut rdatas: Vec<Vec<u8>> = values.iter().map(rdata).collect();
    rdatas.sort();
    rdatas.dedup();

    let mut wire = Vec::new();
    for rd in rdatas {
        wire.extend_from_slice(&owner_wire);
        wire.extend_from_slice(&rtype.code().to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&ttl.to_be_bytes());
        wire.extend_from_slice(&(rd.len() as u16).to_be_bytes());
        wire.extend_from_slice(&rd);
    }
    wire
}

const BASE32HEX: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Unpadded base32hex (RFC 4648 section 7), lower-case, as used for NSEC3
/// owner labels.
pub fn base32hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for byte in data {
        buffer = (buffer << 8) | *byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32HEX[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32HEX[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
