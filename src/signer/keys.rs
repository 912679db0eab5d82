//! DNSSEC Key Roster
//!
//! Key algorithms, DNSKEY flags and key tags, plus the resolved
//! [`SigningKey`] a zone carries once its roster has been looked up in the
//! HSM. DS records for key-signing keys are produced here for submission to
//! the parent zone.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::signer::records::{Record, RecordValue};
use crate::signer::wire::name_to_wire;

/// DNSSEC algorithm identifiers supported by the soft HSM (RFC 8624).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// ECDSA P-256 with SHA-256 (Algorithm 13)
    EcdsaP256Sha256 = 13,
    /// Ed25519 (Algorithm 15)
    Ed25519 = 15,
}

impl Algorithm {
    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::EcdsaP256Sha256 => "ECDSAP256SHA256",
            Algorithm::Ed25519 => "ED25519",
        }
    }

    pub fn from_number(num: u8) -> Option<Self> {
        match num {
            13 => Some(Algorithm::EcdsaP256Sha256),
            15 => Some(Algorithm::Ed25519),
            _ => None,
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Ed25519
    }
}

/// Key flags for DNSKEY records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlags {
    /// Zone Signing Key (256)
    Zsk = 256,
    /// Key Signing Key (257, SEP bit set)
    Ksk = 257,
}

impl KeyFlags {
    pub fn value(&self) -> u16 {
        *self as u16
    }
}

/// A key as listed in a zone's signing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// HSM locator string.
    pub locator: String,
    /// DNSSEC algorithm number.
    pub algorithm: u8,
    /// DNSKEY flags; defaults to 257 for KSKs and 256 otherwise.
    #[serde(default)]
    pub flags: Option<u16>,
    /// Signs the DNSKEY RRset.
    #[serde(default)]
    pub ksk: bool,
    /// Signs everything else.
    #[serde(default)]
    pub zsk: bool,
    /// Published in the DNSKEY RRset.
    #[serde(default = "default_publish")]
    pub publish: bool,
}

fn default_publish() -> bool {
    true
}

impl KeyConfig {
    pub fn flags(&self) -> u16 {
        self.flags.unwrap_or(if self.ksk {
            KeyFlags::Ksk.value()
        } else {
            KeyFlags::Zsk.value()
        })
    }
}

/// A roster key resolved against the HSM: the policy roles plus the public
/// key material needed to publish it and to reference it from signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    pub locator: String,
    pub algorithm: u8,
    pub flags: u16,
    pub key_tag: u16,
    pub ksk: bool,
    pub zsk: bool,
    pub publish: bool,
    pub public_key: Vec<u8>,
}

impl SigningKey {
    pub fn from_config(config: &KeyConfig, public_key: Vec<u8>) -> Self {
        let flags = config.flags();
        Self {
            locator: config.locator.clone(),
            algorithm: config.algorithm,
            flags,
            key_tag: calculate_key_tag(flags, config.algorithm, &public_key),
            ksk: config.ksk,
            zsk: config.zsk,
            publish: config.publish,
            public_key,
        }
    }

    /// Is this key allowed to produce signatures for the given RRset role?
    pub fn is_active_for(&self, dnskey_rrset: bool) -> bool {
        if dnskey_rrset {
            self.ksk
        } else {
            self.zsk
        }
    }

    pub fn dnskey_value(&self) -> RecordValue {
        RecordValue::DNSKEY {
            flags: self.flags,
            protocol: 3,
            algorithm: self.algorithm,
            public_key: self.public_key.clone(),
        }
    }

    pub fn dnskey_record(&self, apex: &str, ttl: u32) -> Record {
        Record::new(apex, ttl, self.dnskey_value())
    }

    /// Get DNSKEY RDATA
    pub fn to_dnskey_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(4 + self.public_key.len());
        rdata.extend_from_slice(&self.flags.to_be_bytes());
        rdata.push(3);
        rdata.push(self.algorithm);
        rdata.extend_from_slice(&self.public_key);
        rdata
    }

    /// SHA-256 DS record for this key at `apex`.
    pub fn ds_record(&self, apex: &str) -> DsRecord {
        let mut hasher = Sha256::new();
        hasher.update(name_to_wire(apex));
        hasher.update(self.to_dnskey_rdata());
        DsRecord {
            key_tag: self.key_tag,
            algorithm: self.algorithm,
            digest_type: 2,
            digest: hasher.finalize().to_vec(),
        }
    }
}

/// DS (Delegation Signer) record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsRecord {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

impl DsRecord {
    /// Format as zone file record
    pub fn to_zone_format(&self, domain: &str, ttl: u32) -> String {
        Record::new(
            domain,
            ttl,
            RecordValue::DS {
                key_tag: self.key_tag,
                algorithm: self.algorithm,
                digest_type: self.digest_type,
                digest: self.digest.clone(),
            },
        )
        .to_zone_line()
    }
}

/// Calculate DNSKEY key tag per RFC 4034 Appendix B
pub fn calculate_key_tag(flags: u16, algorithm: u8, public_key: &[u8]) -> u16 {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(3);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);

    let mut ac: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            ac += (*byte as u32) << 8;
        } else {
            ac += *byte as u32;
        }
    }
    ac += (ac >> 16) & 0xFFFF;
    (ac & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ksk_config() -> KeyConfig {
        KeyConfig {
            locator: "abc123".to_string(),
            algorithm: 15,
            flags: None,
            ksk: true,
            zsk: false,
            publish: true,
        }
    }

    #[test]
    fn test_algorithm_numbers() {
        assert_eq!(Algorithm::Ed25519.number(), 15);
        assert_eq!(Algorithm::from_number(13), Some(Algorithm::EcdsaP256Sha256));
        assert_eq!(Algorithm::from_number(8), None);
        assert_eq!(Algorithm::default().name(), "ED25519");
    }

    #[test]
    fn test_default_flags_follow_role() {
        let ksk = ksk_config();
        assert_eq!(ksk.flags(), 257);

        let zsk = KeyConfig {
            ksk: false,
            zsk: true,
            ..ksk_config()
        };
        assert_eq!(zsk.flags(), 256);
    }

    #[test]
    fn test_key_tag_checksum() {
        // rdata 01 01 03 0f: 0x0101 + 0x030f = 0x0410
        assert_eq!(calculate_key_tag(257, 15, &[]), 0x0410);
        // odd length: trailing byte counts as a high byte, carry folds back
        // 0x0100 + 0x030d + 0xff00 = 0x1040d -> 0x040d + 1
        assert_eq!(calculate_key_tag(256, 13, &[0xff]), 0x040e);
    }

    #[test]
    fn test_role_activity() {
        let key = SigningKey::from_config(&ksk_config(), vec![1, 2, 3, 4]);
        assert!(key.is_active_for(true));
        assert!(!key.is_active_for(false));
    }

    #[test]
    fn test_ds_record() {
        let key = SigningKey::from_config(&ksk_config(), vec![7u8; 32]);
        let ds = key.ds_record("example.com");
        assert_eq!(ds.key_tag, key.key_tag);
        assert_eq!(ds.digest_type, 2);
        assert_eq!(ds.digest.len(), 32);

        let line = ds.to_zone_format("example.com", 3600);
        assert!(line.starts_with("example.com. 3600 IN DS "));
        assert!(line.contains(&hex::encode(&ds.digest).to_uppercase()));
    }

    #[test]
    fn test_dnskey_rdata_layout() {
        let key = SigningKey::from_config(&ksk_config(), vec![9, 9]);
        assert_eq!(key.to_dnskey_rdata(), vec![0x01, 0x01, 3, 15, 9, 9]);
    }
}
