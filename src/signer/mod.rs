//! DNSSEC Signer Core
//!
//! Zone content, signing policy, keys and the RRset signing pipeline:
//!
//! - `records`/`wire`: record model and canonical wire encoding
//! - `keys`/`hsm`: key roster, key tags, DS, the HSM capability
//! - `signconf`/`serial`: per-zone policy and SOA serial schemes
//! - `rrset`/`namedb`/`denial`: recycling, signing and NSEC/NSEC3 chains
//! - `adapter`/`zone`/`zonelist`: zone I/O, per-zone state and the arena

pub mod adapter;
pub mod denial;
pub mod hsm;
pub mod keys;
pub mod namedb;
pub mod records;
pub mod rrset;
pub mod serial;
pub mod signconf;
pub mod wire;
pub mod zone;
pub mod zonelist;

pub use adapter::{AdapterConfig, FileInput, FileOutput, InputAdapter, OutputAdapter, ReadOutcome};
pub use hsm::{Hsm, HsmContext, KeyHandle, SoftHsm};
pub use keys::{Algorithm, KeyConfig, SigningKey};
pub use namedb::{Domain, DomainStatus, NameDb};
pub use records::{InputRecord, Record, RecordType, RecordValue};
pub use rrset::{RRset, Rrsig, SignTally};
pub use serial::SerialScheme;
pub use signconf::{DenialConfig, Signconf, ValidityWindow};
pub use zone::{SignPass, WriteOutcome, Zone, ZoneStats};
pub use zonelist::{ZoneConfig, ZoneEntry, ZoneHandle, Zonelist, ZonelistConfig, ZonelistDiff};
