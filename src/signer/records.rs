//! DNS Record Type Definitions
//!
//! Record types and values handled by the signer: the ordinary data types
//! found in unsigned input plus the DNSSEC types the signer produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::AdapterError;
use crate::signer::wire::{base32hex_encode, normalize_name};

/// DNS record types with their IANA type codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    NS = 2,
    CNAME = 5,
    SOA = 6,
    PTR = 12,
    MX = 15,
    TXT = 16,
    AAAA = 28,
    SRV = 33,
    /// Delegation signer
    DS = 43,
    /// DNSSEC signature
    RRSIG = 46,
    /// Next secure record
    NSEC = 47,
    /// DNSSEC key
    DNSKEY = 48,
    /// Hashed next secure record
    NSEC3 = 50,
    /// NSEC3 parameters
    NSEC3PARAM = 51,
    /// Certification Authority Authorization
    CAA = 257,
}

impl RecordType {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Types the signer generates itself and drops from unsigned input.
    pub fn is_signer_managed(&self) -> bool {
        matches!(
            self,
            RecordType::RRSIG
                | RecordType::NSEC
                | RecordType::NSEC3
                | RecordType::NSEC3PARAM
                | RecordType::DNSKEY
        )
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::A => "A",
            RecordType::NS => "NS",
            RecordType::CNAME => "CNAME",
            RecordType::SOA => "SOA",
            RecordType::PTR => "PTR",
            RecordType::MX => "MX",
            RecordType::TXT => "TXT",
            RecordType::AAAA => "AAAA",
            RecordType::SRV => "SRV",
            RecordType::DS => "DS",
            RecordType::RRSIG => "RRSIG",
            RecordType::NSEC => "NSEC",
            RecordType::DNSKEY => "DNSKEY",
            RecordType::NSEC3 => "NSEC3",
            RecordType::NSEC3PARAM => "NSEC3PARAM",
            RecordType::CAA => "CAA",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RecordType {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::NS),
            "CNAME" => Ok(RecordType::CNAME),
            "SOA" => Ok(RecordType::SOA),
            "PTR" => Ok(RecordType::PTR),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "AAAA" => Ok(RecordType::AAAA),
            "SRV" => Ok(RecordType::SRV),
            "DS" => Ok(RecordType::DS),
            "RRSIG" => Ok(RecordType::RRSIG),
            "NSEC" => Ok(RecordType::NSEC),
            "DNSKEY" => Ok(RecordType::DNSKEY),
            "NSEC3" => Ok(RecordType::NSEC3),
            "NSEC3PARAM" => Ok(RecordType::NSEC3PARAM),
            "CAA" => Ok(RecordType::CAA),
            _ => Err(AdapterError::Parse(format!("invalid record type: {}", s))),
        }
    }
}

/// Values for the supported record types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum RecordValue {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    MX {
        preference: u16,
        exchange: String,
    },
    TXT(String),
    NS(String),
    SOA {
        /// Primary nameserver
        mname: String,
        /// Admin mailbox (with . instead of @)
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    CAA {
        flags: u8,
        tag: String,
        value: String,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    PTR(String),
    DS {
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Vec<u8>,
    },
    DNSKEY {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
    },
    RRSIG {
        type_covered: RecordType,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer_name: String,
        signature: Vec<u8>,
    },
    NSEC {
        next_domain: String,
        types: Vec<RecordType>,
    },
    NSEC3 {
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
        next_hashed: Vec<u8>,
        types: Vec<RecordType>,
    },
    NSEC3PARAM {
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
    },
}

impl RecordValue {
    /// Get the record type for this value
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordValue::A(_) => RecordType::A,
            RecordValue::AAAA(_) => RecordType::AAAA,
            RecordValue::CNAME(_) => RecordType::CNAME,
            RecordValue::MX { .. } => RecordType::MX,
            RecordValue::TXT(_) => RecordType::TXT,
            RecordValue::NS(_) => RecordType::NS,
            RecordValue::SOA { .. } => RecordType::SOA,
            RecordValue::CAA { .. } => RecordType::CAA,
            RecordValue::SRV { .. } => RecordType::SRV,
            RecordValue::PTR(_) => RecordType::PTR,
            RecordValue::DS { .. } => RecordType::DS,
            RecordValue::DNSKEY { .. } => RecordType::DNSKEY,
            RecordValue::RRSIG { .. } => RecordType::RRSIG,
            RecordValue::NSEC { .. } => RecordType::NSEC,
            RecordValue::NSEC3 { .. } => RecordType::NSEC3,
            RecordValue::NSEC3PARAM { .. } => RecordType::NSEC3PARAM,
        }
    }

    /// Presentation-format RDATA, as written to zone files.
    pub fn to_presentation(&self) -> String {
        match self {
            RecordValue::A(ip) => ip.to_string(),
            RecordValue::AAAA(ip) => ip.to_string(),
            RecordValue::CNAME(name) | RecordValue::NS(name) | RecordValue::PTR(name) => fqdn_dot(name),
            RecordValue::MX {
                preference,
                exchange,
            } => format!("{} {}", preference, fqdn_dot(exchange)),
            RecordValue::TXT(text) => text
                .as_bytes()
                .chunks(255)
                .map(|c| format!("\"{}\"", String::from_utf8_lossy(c).replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(" "),
            RecordValue::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => format!(
                "{} {} {} {} {} {} {}",
                fqdn_dot(mname),
                fqdn_dot(rname),
                serial,
                refresh,
                retry,
                expire,
                minimum
            ),
            RecordValue::CAA { flags, tag, value } => format!("{} {} \"{}\"", flags, tag, value),
            RecordValue::SRV {
                priority,
                weight,
                port,
                target,
            } => format!("{} {} {} {}", priority, weight, port, fqdn_dot(target)),
            RecordValue::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => format!(
                "{} {} {} {}",
                key_tag,
                algorithm,
                digest_type,
                hex::encode(digest).to_uppercase()
            ),
            RecordValue::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => format!(
                "{} {} {} {}",
                flags,
                protocol,
                algorithm,
                BASE64.encode(public_key)
            ),
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
            } => format!(
                "{} {} {} {} {} {} {} {} {}",
                type_covered,
                algorithm,
                labels,
                original_ttl,
                format_sig_time(*expiration),
                format_sig_time(*inception),
                key_tag,
                fqdn_dot(signer_name),
                BASE64.encode(signature)
            ),
            RecordValue::NSEC { next_domain, types } => {
                let mut out = fqdn_dot(next_domain);
                for t in types {
                    out.push(' ');
                    out.push_str(&t.to_string());
                }
                out
            }
            RecordValue::NSEC3 {
                hash_algorithm,
                flags,
                iterations,
                salt,
                next_hashed,
                types,
            } => {
                let mut out = format!(
                    "{} {} {} {} {}",
                    hash_algorithm,
                    flags,
                    iterations,
                    salt_presentation(salt),
                    base32hex_encode(next_hashed)
                );
                for t in types {
                    out.push(' ');
                    out.push_str(&t.to_string());
                }
                out
            }
            RecordValue::NSEC3PARAM {
                hash_algorithm,
                flags,
                iterations,
                salt,
            } => format!(
                "{} {} {} {}",
                hash_algorithm,
                flags,
                iterations,
                salt_presentation(salt)
            ),
        }
    }
}

fn fqdn_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

fn salt_presentation(salt: &[u8]) -> String {
    if salt.is_empty() {
        "-".to_string()
    } else {
        hex::encode(salt).to_uppercase()
    }
}

/// RRSIG timestamps are written as YYYYMMDDHHmmSS.
fn format_sig_time(secs: u32) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// A resource record with an absolute, lower-case owner name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub value: RecordValue,
}

impl Record {
    pub fn new(name: impl AsRef<str>, ttl: u32, value: RecordValue) -> Self {
        Self {
            name: normalize_name(name.as_ref()),
            ttl,
            value,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.value.record_type()
    }

    /// One zone file line.
    pub fn to_zone_line(&self) -> String {
        format!(
            "{} {} IN {} {}",
            fqdn_dot(&self.name),
            self.ttl,
            self.record_type(),
            self.value.to_presentation()
        )
    }
}

/// On-disk form of unsigned input: names are relative to the zone apex,
/// with `@` for the apex itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRecord {
    pub name: String,
    pub ttl: u32,
    pub value: RecordValue,
}

impl InputRecord {
    pub fn new(name: impl Into<String>, ttl: u32, value: RecordValue) -> Self {
        Self {
            name: name.into(),
            ttl,
            value,
        }
    }

    /// Create an A record
    pub fn a(name: impl Into<String>, ip: Ipv4Addr, ttl: u32) -> Self {
        Self::new(name, ttl, RecordValue::A(ip))
    }

    /// Create an AAAA record
    pub fn aaaa(name: impl Into<String>, ip: Ipv6Addr, ttl: u32) -> Self {
        Self::new(name, ttl, RecordValue::AAAA(ip))
    }

    /// Create an NS record
    pub fn ns(name: impl Into<String>, nameserver: impl Into<String>, ttl: u32) -> Self {
        Self::new(name, ttl, RecordValue::NS(nameserver.into()))
    }

    /// Create an MX record
    pub fn mx(name: impl Into<String>, exchange: impl Into<String>, preference: u16, ttl: u32) -> Self {
        Self::new(
            name,
            ttl,
            RecordValue::MX {
                preference,
                exchange: exchange.into(),
            },
        )
    }

    /// Create a TXT record
    pub fn txt(name: impl Into<String>, text: impl Into<String>, ttl: u32) -> Self {
        Self::new(name, ttl, RecordValue::TXT(text.into()))
    }

    /// Create a SOA record at the apex
    pub fn soa(mname: impl Into<String>, rname: impl Into<String>, serial: u32, ttl: u32) -> Self {
        Self::new(
            "@",
            ttl,
            RecordValue::SOA {
                mname: mname.into(),
                rname: rname.into(),
                serial,
                refresh: 3600,
                retry: 600,
                expire: 604800,
                minimum: 300,
            },
        )
    }

    /// Get the fully qualified domain name for this record
    pub fn fqdn(&self, apex: &str) -> String {
        let apex = normalize_name(apex);
        if self.name == "@" || self.name.is_empty() {
            apex
        } else if self.name.ends_with('.') {
            normalize_name(&self.name)
        } else {
            normalize_name(&format!("{}.{}", self.name, apex))
        }
    }

    pub fn into_record(self, apex: &str) -> Record {
        let name = self.fqdn(apex);
        Record {
            name,
            ttl: self.ttl,
            value: self.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_parsing() {
        assert_eq!(RecordType::from_str("A").unwrap(), RecordType::A);
        assert_eq!(RecordType::from_str("nsec3param").unwrap(), RecordType::NSEC3PARAM);
        assert!(RecordType::from_str("invalid").is_err());
    }

    #[test]
    fn test_record_type_codes() {
        assert_eq!(RecordType::A.code(), 1);
        assert_eq!(RecordType::SOA.code(), 6);
        assert_eq!(RecordType::RRSIG.code(), 46);
        assert_eq!(RecordType::DNSKEY.code(), 48);
        assert_eq!(RecordType::CAA.code(), 257);
    }

    #[test]
    fn test_fqdn() {
        let record = InputRecord::a("www", "192.0.2.1".parse().unwrap(), 300);
        assert_eq!(record.fqdn("example.com"), "www.example.com");

        let apex = InputRecord::a("@", "192.0.2.1".parse().unwrap(), 300);
        assert_eq!(apex.fqdn("Example.COM."), "example.com");

        let absolute = InputRecord::ns("@", "ns1.other.net.", 300);
        let absolute = InputRecord::new("mail.example.com.", 300, absolute.value);
        assert_eq!(absolute.fqdn("example.com"), "mail.example.com");
    }

    #[test]
    fn test_input_record_json_roundtrip() {
        let json = r#"{"name":"www","ttl":300,"value":{"type":"A","data":"192.0.2.1"}}"#;
        let record: InputRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.value.record_type(), RecordType::A);
        assert_eq!(record.into_record("example.com").name, "www.example.com");
    }

    #[test]
    fn test_zone_line() {
        let record = Record::new(
            "example.com",
            300,
            RecordValue::MX {
                preference: 10,
                exchange: "mail.example.com".to_string(),
            },
        );
        assert_eq!(record.to_zone_line(), "example.com. 300 IN MX 10 mail.example.com.");
    }

    #[test]
    fn test_rrsig_time_format() {
        assert_eq!(format_sig_time(0), "19700101000000");
        assert_eq!(format_sig_time(1_700_000_000), "20231114221320");
    }

    #[test]
    fn test_signer_managed_types() {
        assert!(RecordType::RRSIG.is_signer_managed());
        assert!(RecordType::DNSKEY.is_signer_managed());
        assert!(!RecordType::DS.is_signer_managed());
        assert!(!RecordType::SOA.is_signer_managed());
    }
}
