//! Signing Policy
//!
//! A per-zone TOML document with validity windows, the denial method and
//! the key roster. The SIGNCONF stage reloads it only when the file's
//! modification time moves.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SignerError};
use crate::signer::keys::KeyConfig;
use crate::signer::serial::SerialScheme;

/// The NSEC3 salt length field is one octet.
pub const MAX_SALT_LEN: usize = 255;

/// Denial-of-existence method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum DenialConfig {
    Nsec {
        /// Defaults to the SOA minimum.
        #[serde(default)]
        ttl: Option<u32>,
    },
    Nsec3 {
        /// Hash algorithm, 1 = SHA-1.
        #[serde(default = "default_nsec3_algorithm")]
        algorithm: u8,
        #[serde(default)]
        iterations: u16,
        /// Hex salt, empty for none.
        #[serde(default)]
        salt: String,
        #[serde(default)]
        optout: bool,
        #[serde(default)]
        ttl: Option<u32>,
    },
}

fn default_nsec3_algorithm() -> u8 {
    1
}

impl Default for DenialConfig {
    fn default() -> Self {
        DenialConfig::Nsec { ttl: None }
    }
}

impl DenialConfig {
    pub fn ttl(&self) -> Option<u32> {
        match self {
            DenialConfig::Nsec { ttl } | DenialConfig::Nsec3 { ttl, .. } => *ttl,
        }
    }

    pub fn salt_bytes(&self) -> Result<Vec<u8>> {
        match self {
            DenialConfig::Nsec { .. } => Ok(Vec::new()),
            DenialConfig::Nsec3 { salt, .. } => hex::decode(salt)
                .map_err(|e| SignerError::Config(format!("invalid NSEC3 salt '{}': {}", salt, e))),
        }
    }
}

/// Per-zone signing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signconf {
    /// Interval between SIGN passes.
    pub resign_secs: u64,
    /// Signatures expiring within this window are replaced.
    pub refresh_secs: u64,
    /// Validity of ordinary signatures.
    pub validity_default_secs: u64,
    /// Validity of NSEC/NSEC3 signatures.
    pub validity_denial_secs: u64,
    pub jitter_secs: u64,
    /// Inception is backdated by this much to absorb clock skew.
    pub inception_offset_secs: u64,
    pub dnskey_ttl: u32,
    pub soa_ttl: Option<u32>,
    pub soa_minimum: Option<u32>,
    pub serial: SerialScheme,
    pub denial: DenialConfig,
    pub keys: Vec<KeyConfig>,
}

impl Default for Signconf {
    fn default() -> Self {
        Self {
            resign_secs: 7200,
            refresh_secs: 259_200,
            validity_default_secs: 1_209_600,
            validity_denial_secs: 604_800,
            jitter_secs: 43_200,
            inception_offset_secs: 3600,
            dnskey_ttl: 3600,
            soa_ttl: None,
            soa_minimum: None,
            serial: SerialScheme::default(),
            denial: DenialConfig::default(),
            keys: Vec::new(),
        }
    }
}

impl Signconf {
    pub fn from_toml(content: &str) -> Result<Self> {
        let signconf: Signconf = toml::from_str(content)
            .map_err(|e| SignerError::Config(format!("invalid signconf: {}", e)))?;
        signconf.validate()?;
        Ok(signconf)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SignerError::Config(format!("cannot read signconf {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(SignerError::Config("signconf lists no keys".to_string()));
        }
        if !self.keys.iter().any(|k| k.ksk) {
            return Err(SignerError::Config("signconf has no KSK".to_string()));
        }
        if !self.keys.iter().any(|k| k.zsk) {
            return Err(SignerError::Config("signconf has no ZSK".to_string()));
        }
        if self.jitter_secs >= self.validity_denial_secs.min(self.validity_default_secs) {
            return Err(SignerError::Config(
                "jitter_secs must be smaller than every validity".to_string(),
            ));
        }
        // A fresh signature must outlive the refresh window or it is
        // replaced on every pass.
        for (name, validity) in [
            ("validity_default_secs", self.validity_default_secs),
            ("validity_denial_secs", self.validity_denial_secs),
        ] {
            if validity - self.jitter_secs <= self.refresh_secs {
                return Err(SignerError::Config(format!(
                    "{} minus jitter_secs must exceed refresh_secs",
                    name
                )));
            }
        }
        if let DenialConfig::Nsec3 { algorithm, .. } = &self.denial {
            if *algorithm != 1 {
                return Err(SignerError::Config(format!(
                    "unsupported NSEC3 hash algorithm {}",
                    algorithm
                )));
            }
        }
        if self.denial.salt_bytes()?.len() > MAX_SALT_LEN {
            return Err(SignerError::Config(format!(
                "NSEC3 salt longer than {} octets",
                MAX_SALT_LEN
            )));
        }
        Ok(())
    }

    /// Draw the jitter offset for one signing pass, in `[0, 2 * jitter)`.
    pub fn draw_jitter(&self) -> u64 {
        if self.jitter_secs == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..2 * self.jitter_secs)
        }
    }

    /// Validity window for a pass at `signtime` with a pre-drawn jitter.
    pub fn window(&self, signtime: u64, draw: u64) -> ValidityWindow {
        let inception = signtime.saturating_sub(self.inception_offset_secs);
        let expiration = (signtime + self.validity_default_secs + draw).saturating_sub(self.jitter_secs);
        let denial_expiration =
            (signtime + self.validity_denial_secs + draw).saturating_sub(self.jitter_secs);
        ValidityWindow {
            signtime,
            inception,
            expiration,
            denial_expiration,
            refresh_until: signtime + self.refresh_secs,
        }
    }
}

/// Signature timing for one SIGN pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub signtime: u64,
    pub inception: u64,
    pub expiration: u64,
    pub denial_expiration: u64,
    /// Existing signatures must outlive this to be recycled.
    pub refresh_until: u64,
}

/// Signconf file plus the mtime last loaded.
#[derive(Debug, Clone)]
pub struct SignconfSource {
    path: PathBuf,
    loaded_mtime: Option<SystemTime>,
}

impl SignconfSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the policy if it changed since the last successful load.
    pub fn load_if_changed(&mut self) -> Result<Option<Signconf>> {
        let mtime = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| {
                SignerError::Config(format!("signconf {} unavailable: {}", self.path.display(), e))
            })?;
        if self.loaded_mtime == Some(mtime) {
            debug!("Signconf {} unchanged", self.path.display());
            return Ok(None);
        }
        let signconf = Signconf::load(&self.path)?;
        self.loaded_mtime = Some(mtime);
        Ok(Some(signconf))
    }

    /// Forget the loaded mtime so the next check reloads.
    pub fn invalidate(&mut self) {
        self.loaded_mtime = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
resign_secs = 3600
jitter_secs = 0
serial = "unixtime"

[denial]
method = "nsec3"
iterations = 5
salt = "aabbccdd"
optout = true

[[keys]]
locator = "ksk1"
algorithm = 15
ksk = true

[[keys]]
locator = "zsk1"
algorithm = 15
zsk = true
"#;

    #[test]
    fn test_parse_sample() {
        let signconf = Signconf::from_toml(SAMPLE).unwrap();
        assert_eq!(signconf.resign_secs, 3600);
        assert_eq!(signconf.refresh_secs, 259_200);
        assert_eq!(signconf.serial, SerialScheme::Unixtime);
        assert_eq!(signconf.keys.len(), 2);
        assert_eq!(signconf.keys[0].flags(), 257);
        assert_eq!(signconf.keys[1].flags(), 256);
        assert_eq!(signconf.denial.salt_bytes().unwrap(), vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert!(matches!(
            signconf.denial,
            DenialConfig::Nsec3 {
                iterations: 5,
                optout: true,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_roles_rejected() {
        let only_ksk = r#"
[[keys]]
locator = "ksk1"
algorithm = 15
ksk = true
"#;
        assert!(matches!(
            Signconf::from_toml(only_ksk),
            Err(SignerError::Config(_))
        ));
    }

    #[test]
    fn test_bad_salt_rejected() {
        let bad = SAMPLE.replace("aabbccdd", "xyz");
        assert!(Signconf::from_toml(&bad).is_err());
    }

    fn policy(validity_default_secs: u64, validity_denial_secs: u64, jitter_secs: u64) -> Signconf {
        Signconf {
            validity_default_secs,
            validity_denial_secs,
            jitter_secs,
            refresh_secs: 259_200,
            ..Signconf::from_toml(SAMPLE).unwrap()
        }
    }

    #[test]
    fn test_denial_validity_must_outlive_refresh() {
        assert!(matches!(
            policy(1_209_600, 86_400, 0).validate(),
            Err(SignerError::Config(_))
        ));
        // Only the jitter pushes it below the refresh window.
        assert!(matches!(
            policy(1_209_600, 300_000, 50_000).validate(),
            Err(SignerError::Config(_))
        ));
        assert!(policy(1_209_600, 300_000, 40_000).validate().is_ok());
    }

    #[test]
    fn test_default_validity_must_outlive_refresh() {
        assert!(matches!(
            policy(259_200, 604_800, 0).validate(),
            Err(SignerError::Config(_))
        ));
        assert!(matches!(
            policy(300_000, 604_800, 50_000).validate(),
            Err(SignerError::Config(_))
        ));
        assert!(policy(300_000, 604_800, 40_000).validate().is_ok());
    }

    #[test]
    fn test_fresh_signatures_recycle_under_valid_policy() {
        let signconf = policy(1_209_600, 300_000, 40_000);
        let window = signconf.window(1_700_000_000, 0);
        assert!(window.expiration > window.refresh_until);
        assert!(window.denial_expiration > window.refresh_until);
    }

    #[test]
    fn test_long_salt_rejected() {
        let salt = "ab".repeat(MAX_SALT_LEN);
        assert!(Signconf::from_toml(&SAMPLE.replace("aabbccdd", &salt)).is_ok());
        let salt = "ab".repeat(MAX_SALT_LEN + 1);
        assert!(matches!(
            Signconf::from_toml(&SAMPLE.replace("aabbccdd", &salt)),
            Err(SignerError::Config(_))
        ));
    }

    #[test]
    fn test_window_centres_jitter() {
        let signconf = Signconf {
            validity_default_secs: 1000,
            validity_denial_secs: 500,
            jitter_secs: 100,
            inception_offset_secs: 10,
            refresh_secs: 200,
            ..Default::default()
        };
        let low = signconf.window(10_000, 0);
        assert_eq!(low.inception, 9_990);
        assert_eq!(low.expiration, 10_900);
        assert_eq!(low.denial_expiration, 10_400);
        assert_eq!(low.refresh_until, 10_200);

        let high = signconf.window(10_000, 199);
        assert_eq!(high.expiration, 11_099);

        for _ in 0..100 {
            let draw = signconf.draw_jitter();
            assert!(draw < 200);
        }
    }

    #[test]
    fn test_source_reloads_on_change_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signconf.toml");
        let mut source = SignconfSource::new(&path);
        assert!(matches!(
            source.load_if_changed(),
            Err(SignerError::Config(_))
        ));

        fs::write(&path, SAMPLE).unwrap();
        assert!(source.load_if_changed().unwrap().is_some());
        assert!(source.load_if_changed().unwrap().is_none());

        source.invalidate();
        assert!(source.load_if_changed().unwrap().is_some());
    }
}
