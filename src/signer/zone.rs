//! Per-zone state and the zone-local halves of each pipeline stage.
//!
//! Everything here runs with the zone's lock held by the worker executing
//! the stage. The engine supplies the HSM context and, for SIGN, fans the
//! signing units out to drudgers between [`Zone::prepare_sign`],
//! [`Zone::take_units`] and [`Zone::finish_sign`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{HsmError, Result, SignerError};
use crate::signer::adapter::{write_atomic, InputAdapter, OutputAdapter, ReadOutcome};
use crate::signer::denial;
use crate::signer::hsm::HsmContext;
use crate::signer::keys::SigningKey;
use crate::signer::namedb::{Domain, NameDb};
use crate::signer::records::RecordType;
use crate::signer::rrset::SignTally;
use crate::signer::serial::SerialState;
use crate::signer::signconf::{Signconf, SignconfSource, ValidityWindow};

/// Counters of the most recent SIGN pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneStats {
    pub sig_count: usize,
    pub sig_soa_count: usize,
    pub sig_reuse: usize,
    pub min_expiration: Option<u32>,
    pub sign_duration: Duration,
    pub last_signed: Option<u64>,
    pub last_written: Option<u64>,
}

/// Inputs of one SIGN pass, shared with every unit it produces.
#[derive(Debug, Clone)]
pub struct SignPass {
    pub apex: String,
    pub keys: Arc<Vec<SigningKey>>,
    pub window: ValidityWindow,
}

/// What WRITE did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: bool,
    /// When SIGN should run next.
    pub next_sign: u64,
}

pub struct Zone {
    pub name: String,
    signconf_source: SignconfSource,
    signconf: Option<Arc<Signconf>>,
    pub db: NameDb,
    pub serial: SerialState,
    input: Box<dyn InputAdapter>,
    output: Box<dyn OutputAdapter>,
    keys: Arc<Vec<SigningKey>>,
    pub stats: ZoneStats,
    /// SOA serial before the running SIGN pass, and the one it publishes.
    pending_serial: Option<(u32, u32)>,
    /// Content or signatures changed since the last write.
    dirty: bool,
    written: bool,
    force_write: bool,
}

impl Zone {
    pub fn new(
        name: &str,
        signconf: impl Into<PathBuf>,
        input: Box<dyn InputAdapter>,
        output: Box<dyn OutputAdapter>,
    ) -> Self {
        Self {
            name: name.to_string(),
            signconf_source: SignconfSource::new(signconf),
            signconf: None,
            db: NameDb::new(name),
            serial: SerialState::default(),
            input,
            output,
            keys: Arc::new(Vec::new()),
            stats: ZoneStats::default(),
            pending_serial: None,
            dirty: false,
            written: false,
            force_write: false,
        }
    }

    pub fn signconf(&self) -> Option<&Arc<Signconf>> {
        self.signconf.as_ref()
    }

    fn require_signconf(&self) -> Result<Arc<Signconf>> {
        self.signconf
            .clone()
            .ok_or_else(|| SignerError::Config(format!("{}: no signconf loaded", self.name)))
    }

    pub fn keys(&self) -> &Arc<Vec<SigningKey>> {
        &self.keys
    }

    /// Point the zone at new configuration after a zonelist reload.
    pub fn reconfigure(
        &mut self,
        signconf: impl Into<PathBuf>,
        input: Box<dyn InputAdapter>,
        output: Box<dyn OutputAdapter>,
    ) {
        self.signconf_source = SignconfSource::new(signconf);
        self.input = input;
        self.output = output;
        self.force_write = true;
    }

    pub fn output_description(&self) -> String {
        self.output.describe()
    }

    pub fn output_location(&self) -> Option<PathBuf> {
        self.output.location().map(|p| p.to_path_buf())
    }

    /// SIGNCONF: reload the policy if its file changed. Returns whether a
    /// new policy was installed.
    pub fn load_signconf(&mut self) -> Result<bool> {
        let Some(signconf) = self.signconf_source.load_if_changed()? else {
            if self.signconf.is_none() {
                return Err(SignerError::Config(format!(
                    "{}: signconf {} not loaded",
                    self.name,
                    self.signconf_source.path().display()
                )));
            }
            return Ok(false);
        };

        if let Some(old) = &self.signconf {
            if old.denial != signconf.denial {
                info!("{}: denial parameters changed, dropping denial records", self.name);
                self.db.invalidate_denial();
            }
        }
        let nsec3param = denial::nsec3param(&signconf.denial)?;
        self.db.publish(
            RecordType::NSEC3PARAM,
            0,
            nsec3param.into_iter().collect(),
        );
        info!(
            "{}: loaded signconf {} ({} keys)",
            self.name,
            self.signconf_source.path().display(),
            signconf.keys.len()
        );
        self.signconf = Some(Arc::new(signconf));
        Ok(true)
    }

    /// Look every roster key up in the HSM and publish the DNSKEY RRset.
    pub fn resolve_keys(&mut self, ctx: &mut dyn HsmContext) -> Result<Arc<Vec<SigningKey>>> {
        let signconf = self.require_signconf()?;
        let mut keys = Vec::with_capacity(signconf.keys.len());
        for config in &signconf.keys {
            let handle = ctx.find_key(&config.locator)?;
            if handle.algorithm != config.algorithm {
                return Err(HsmError::UnsupportedAlgorithm(config.algorithm).into());
            }
            let public_key = ctx.public_key(&handle)?;
            keys.push(SigningKey::from_config(config, public_key));
        }

        let published = keys
            .iter()
            .filter(|k| k.publish)
            .map(|k| k.dnskey_value())
            .collect();
        if self.db.publish(RecordType::DNSKEY, signconf.dnskey_ttl, published) {
            debug!("{}: DNSKEY RRset updated", self.name);
        }
        self.keys = Arc::new(keys);
        Ok(self.keys.clone())
    }

    /// READ: import unsigned content. Returns whether anything changed.
    pub fn read(&mut self, ctx: &mut dyn HsmContext) -> Result<bool> {
        self.require_signconf()?;
        let changed = match self.input.read()? {
            ReadOutcome::Unchanged => {
                debug!("{}: input {} unchanged", self.name, self.input.describe());
                false
            }
            ReadOutcome::Changed(records) => {
                let count = records.len();
                let outcome = self.db.import(records)?;
                self.serial.inbound = Some(outcome.inbound_serial);
                info!(
                    "{}: read {} records from {}, inbound serial {}",
                    self.name,
                    count,
                    self.input.describe(),
                    outcome.inbound_serial
                );
                outcome.changed
            }
        };
        self.resolve_keys(ctx)?;
        Ok(changed)
    }

    /// Queue a fresh import on the next READ.
    pub fn reset_input(&mut self) {
        self.input.reset();
    }

    /// Forget all content, e.g. after a SIGN pass lost units on shutdown.
    pub fn discard_content(&mut self) {
        self.db = NameDb::new(&self.name);
        self.pending_serial = None;
        self.input.reset();
        self.force_write = true;
    }

    /// First half of SIGN: keys, SOA, denial chain and serial.
    pub fn prepare_sign(&mut self, ctx: &mut dyn HsmContext, now: u64) -> Result<SignPass> {
        let signconf = self.require_signconf()?;
        if self.db.soa_serial().is_none() {
            return Err(SignerError::Config(format!("{}: nothing read yet", self.name)));
        }
        let keys = self.resolve_keys(ctx)?;

        let current = self.db.soa_serial().unwrap_or_default();
        self.db
            .update_soa(current, signconf.soa_ttl, signconf.soa_minimum);
        denial::rebuild(&mut self.db, &signconf.denial)?;

        let window = signconf.window(now, signconf.draw_jitter());
        let content_changed = self.db.is_changed();
        let needs_signatures = self.db.iter().any(|d| d.needs_signing(&keys, &window));
        let forced = self.serial.forced.is_some();

        self.pending_serial = None;
        if content_changed || needs_signatures || forced || self.serial.outbound.is_none() {
            let next = self.serial.next(signconf.serial, now)?;
            self.db
                .update_soa(next, signconf.soa_ttl, signconf.soa_minimum);
            self.pending_serial = Some((current, next));
            debug!("{}: outbound serial {}", self.name, next);
        }
        self.dirty |= content_changed;
        self.force_write |= forced;

        Ok(SignPass {
            apex: self.db.apex().to_string(),
            keys,
            window,
        })
    }

    /// Recycle every domain; move out the ones that still need signatures.
    pub fn take_units(&mut self, pass: &SignPass) -> (SignTally, Vec<Domain>) {
        let mut tally = SignTally::default();
        let mut pending = Vec::new();
        for domain in self.db.iter_mut() {
            let (kept, missing) = domain.recycle(&pass.keys, &pass.window);
            tally.reused += kept.reused;
            if missing {
                pending.push(domain.name.clone());
            } else {
                tally.observe_expiration(kept.min_expiration);
            }
        }
        let units = pending
            .iter()
            .filter_map(|name| self.db.take(name))
            .collect();
        (tally, units)
    }

    /// Return a signed (or failed) domain to the database.
    pub fn restore(&mut self, domain: Domain) {
        self.db.put(domain);
    }

    /// Undo the serial change of a SIGN pass that did not complete, so the
    /// retry publishes the same serial.
    pub fn abort_sign(&mut self) {
        let Some((previous, next)) = self.pending_serial.take() else {
            return;
        };
        if let Some(signconf) = &self.signconf {
            self.db
                .update_soa(previous, signconf.soa_ttl, signconf.soa_minimum);
        }
        debug!("{}: serial {} not published, back to {}", self.name, next, previous);
    }

    /// Last half of SIGN: commit the serial and record statistics.
    pub fn finish_sign(&mut self, tally: &SignTally, started: u64, elapsed: Duration) {
        if let Some((_, next)) = self.pending_serial.take() {
            self.serial.commit(next);
        }
        if tally.created > tally.soa_created {
            self.dirty = true;
        }
        self.stats.sig_count = tally.created;
        self.stats.sig_soa_count = tally.soa_created;
        self.stats.sig_reuse = tally.reused;
        self.stats.min_expiration = self.db.min_expiration();
        self.stats.sign_duration = elapsed;
        self.stats.last_signed = Some(started);
        info!(
            "{}: signed serial {} with {} new ({} SOA), {} reused signatures in {:?}",
            self.name,
            self.db.soa_serial().unwrap_or_default(),
            tally.created,
            tally.soa_created,
            tally.reused,
            elapsed
        );
    }

    /// When the next SIGN is due: the resign interval, or earlier if a
    /// signature enters its refresh window first.
    pub fn next_sign(&self, now: u64) -> u64 {
        let Some(signconf) = &self.signconf else {
            return now;
        };
        let mut due = now + signconf.resign_secs;
        if let Some(expiration) = self.stats.min_expiration {
            due = due.min((expiration as u64).saturating_sub(signconf.refresh_secs));
        }
        due.max(now)
    }

    /// WRITE: emit the signed zone and DS records unless nothing moved
    /// since the previous write.
    pub fn write(&mut self, now: u64) -> Result<WriteOutcome> {
        let signconf = self.require_signconf()?;
        if self.written && !self.dirty && !self.force_write {
            debug!(
                "{}: skip write, serial {} unchanged",
                self.name,
                self.db.soa_serial().unwrap_or_default()
            );
            return Ok(WriteOutcome {
                written: false,
                next_sign: self.next_sign(now),
            });
        }

        self.output.write(&self.db.to_zone_text())?;
        if let Some(location) = self.output.location() {
            let mut ds_path = location.as_os_str().to_owned();
            ds_path.push(".ds");
            let ds_ttl = signconf.dnskey_ttl;
            let ds: String = self
                .keys
                .iter()
                .filter(|k| k.ksk)
                .map(|k| k.ds_record(&self.name).to_zone_format(&self.name, ds_ttl) + "\n")
                .collect();
            if let Err(e) = write_atomic(&PathBuf::from(ds_path), ds.as_bytes()) {
                warn!("{}: failed to write DS records: {}", self.name, e);
            }
        }

        info!(
            "{}: wrote serial {} to {}",
            self.name,
            self.db.soa_serial().unwrap_or_default(),
            self.output.describe()
        );
        self.written = true;
        self.dirty = false;
        self.force_write = false;
        self.stats.last_written = Some(now);
        Ok(WriteOutcome {
            written: true,
            next_sign: self.next_sign(now),
        })
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("domains", &self.db.len())
            .field("input", &self.input.describe())
            .field("output", &self.output.describe())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signer::adapter::{FileInput, FileOutput};
    use crate::signer::hsm::{verify_signature, Hsm, KeyHandle, SoftHsm};
    use crate::signer::keys::Algorithm;
    use crate::signer::records::{InputRecord, RecordValue};
    use std::fs;
    use std::path::Path;
    use std::result::Result as StdResult;
    use tempfile::TempDir;

    pub(crate) fn write_signconf(dir: &Path, hsm: &SoftHsm, denial: &str) -> PathBuf {
        let ksk = hsm.generate_key(Algorithm::Ed25519).unwrap();
        let zsk = hsm.generate_key(Algorithm::EcdsaP256Sha256).unwrap();
        let content = format!(
            r#"
resign_secs = 3600
jitter_secs = 600
serial = "counter"

{}

[[keys]]
locator = "{}"
algorithm = 15
ksk = true

[[keys]]
locator = "{}"
algorithm = 13
zsk = true
"#,
            denial, ksk, zsk
        );
        let path = dir.join("signconf.toml");
        fs::write(&path, content).unwrap();
        path
    }

    pub(crate) fn write_input(path: &Path, extra: &[InputRecord]) {
        let mut records = vec![
            InputRecord::soa("ns1.example.com", "hostmaster.example.com", 1, 3600),
            InputRecord::a("www", "192.0.2.1".parse().unwrap(), 300),
            InputRecord::mx("@", "mail.example.com", 10, 300),
        ];
        records.extend_from_slice(extra);
        fs::write(path, serde_json::to_string(&records).unwrap()).unwrap();
    }

    struct Setup {
        zone: Zone,
        hsm: SoftHsm,
        dir: TempDir,
    }

    fn setup(denial: &str) -> Setup {
        let dir = TempDir::new().unwrap();
        let key_dir = dir.path().join("keys");
        fs::create_dir_all(&key_dir).unwrap();
        let hsm = SoftHsm::new(&key_dir);
        hsm.open().unwrap();
        let signconf = write_signconf(dir.path(), &hsm, denial);
        let input = dir.path().join("example.com.json");
        write_input(&input, &[]);
        let zone = Zone::new(
            "example.com",
            signconf,
            Box::new(FileInput::new(&input, "example.com")),
            Box::new(FileOutput::new(dir.path().join("example.com.signed"))),
        );
        Setup { zone, hsm, dir }
    }

    fn sign_inline(zone: &mut Zone, ctx: &mut dyn HsmContext, now: u64) -> SignTally {
        let pass = zone.prepare_sign(ctx, now).unwrap();
        let (mut tally, units) = zone.take_units(&pass);
        for mut domain in units {
            let created = domain
                .sign_missing(ctx, &pass.keys, &pass.window, &pass.apex)
                .unwrap();
            tally.merge(&created);
            zone.restore(domain);
        }
        zone.finish_sign(&tally, now, Duration::ZERO);
        tally
    }

    #[test]
    fn test_full_pipeline_and_idempotent_resign() {
        let Setup { mut zone, hsm, dir } = setup("[denial]\nmethod = \"nsec\"");
        let mut ctx = hsm.create_context().unwrap();
        let now = 1_700_000_000;

        assert!(zone.load_signconf().unwrap());
        assert!(zone.read(ctx.as_mut()).unwrap());
        let first = sign_inline(&mut zone, ctx.as_mut(), now);
        assert!(first.created > 0);
        assert_eq!(first.reused, 0);
        let outcome = zone.write(now).unwrap();
        assert!(outcome.written);
        assert!(outcome.next_sign > now);

        let output = dir.path().join("example.com.signed");
        let text = fs::read_to_string(&output).unwrap();
        assert!(text.starts_with("example.com. 3600 IN SOA ns1.example.com. hostmaster.example.com. 1 "));
        assert!(text.contains("IN DNSKEY 257 3 15 "));
        assert!(text.contains("IN NSEC www.example.com. "));
        let ds = fs::read_to_string(dir.path().join("example.com.signed.ds")).unwrap();
        assert!(ds.starts_with("example.com. 3600 IN DS "));

        // Nothing changed: every signature is reused, serial and file stay.
        assert!(!zone.load_signconf().unwrap());
        assert!(!zone.read(ctx.as_mut()).unwrap());
        let second = sign_inline(&mut zone, ctx.as_mut(), now + 60);
        assert_eq!(second.created, 0);
        assert_eq!(second.reused, zone.db.signature_count());
        assert_eq!(zone.db.soa_serial(), Some(1));
        assert!(!zone.write(now + 60).unwrap().written);
        assert_eq!(fs::read_to_string(&output).unwrap(), text);
    }

    #[test]
    fn test_signatures_validate() {
        let Setup { mut zone, hsm, dir: _dir } = setup("");
        let mut ctx = hsm.create_context().unwrap();
        let now = 1_700_000_000;
        zone.load_signconf().unwrap();
        zone.read(ctx.as_mut()).unwrap();
        sign_inline(&mut zone, ctx.as_mut(), now);

        let keys = zone.keys().clone();
        for domain in zone.db.iter() {
            for rrset in domain.rrsets.values().chain(domain.denial.iter()) {
                for sig in &rrset.sigs {
                    assert!(sig.inception as u64 <= now && now <= sig.expiration as u64);
                    let key = keys.iter().find(|k| k.key_tag == sig.key_tag).unwrap();
                    assert!(verify_signature(
                        key.algorithm,
                        &key.public_key,
                        &sig.signed_data(rrset),
                        &sig.signature
                    ));
                }
            }
        }
    }

    #[test]
    fn test_input_change_bumps_serial() {
        let Setup { mut zone, hsm, dir } = setup("");
        let mut ctx = hsm.create_context().unwrap();
        let now = 1_700_000_000;
        zone.load_signconf().unwrap();
        zone.read(ctx.as_mut()).unwrap();
        sign_inline(&mut zone, ctx.as_mut(), now);
        zone.write(now).unwrap();

        write_input(
            &dir.path().join("example.com.json"),
            &[InputRecord::txt("info", "v=1", 300)],
        );
        assert!(zone.read(ctx.as_mut()).unwrap());
        let tally = sign_inline(&mut zone, ctx.as_mut(), now + 60);
        assert!(tally.created > tally.soa_created);
        assert_eq!(zone.db.soa_serial(), Some(2));
        assert!(zone.write(now + 60).unwrap().written);
    }

    /// Finds keys but refuses to sign.
    struct RefusingContext(Box<dyn HsmContext>);

    impl HsmContext for RefusingContext {
        fn find_key(&mut self, locator: &str) -> StdResult<KeyHandle, HsmError> {
            self.0.find_key(locator)
        }

        fn public_key(&mut self, key: &KeyHandle) -> StdResult<Vec<u8>, HsmError> {
            self.0.public_key(key)
        }

        fn sign(&mut self, _key: &KeyHandle, _data: &[u8]) -> StdResult<Vec<u8>, HsmError> {
            Err(HsmError::Signing("token busy".to_string()))
        }

        fn check(&self) -> StdResult<(), HsmError> {
            self.0.check()
        }
    }

    #[test]
    fn test_failed_sign_keeps_forced_serial() {
        let Setup { mut zone, hsm, dir } = setup("");
        let mut ctx = hsm.create_context().unwrap();
        let now = 1_700_000_000;
        zone.load_signconf().unwrap();
        zone.read(ctx.as_mut()).unwrap();
        sign_inline(&mut zone, ctx.as_mut(), now);
        zone.write(now).unwrap();

        zone.serial.forced = Some(2024010100);
        let mut refusing = RefusingContext(hsm.create_context().unwrap());
        let pass = zone.prepare_sign(&mut refusing, now + 60).unwrap();
        assert_eq!(zone.db.soa_serial(), Some(2024010100));
        let (_, units) = zone.take_units(&pass);
        let mut failures = 0;
        for mut domain in units {
            if domain
                .sign_missing(&mut refusing, &pass.keys, &pass.window, &pass.apex)
                .is_err()
            {
                failures += 1;
            }
            zone.restore(domain);
        }
        assert!(failures > 0);
        zone.abort_sign();
        assert_eq!(zone.db.soa_serial(), Some(1));
        assert_eq!(zone.serial.outbound, Some(1));
        assert_eq!(zone.serial.forced, Some(2024010100));

        // The retry publishes the forced serial, not the one after it.
        sign_inline(&mut zone, ctx.as_mut(), now + 120);
        assert_eq!(zone.db.soa_serial(), Some(2024010100));
        assert!(zone.serial.forced.is_none());
        assert!(zone.write(now + 120).unwrap().written);
        let text = fs::read_to_string(dir.path().join("example.com.signed")).unwrap();
        assert!(text.contains(" hostmaster.example.com. 2024010100 "));
    }

    #[test]
    fn test_missing_signconf_fails() {
        let Setup { mut zone, dir, .. } = setup("");
        fs::remove_file(dir.path().join("signconf.toml")).unwrap();
        assert!(matches!(
            zone.load_signconf(),
            Err(SignerError::Config(_))
        ));
    }

    #[test]
    fn test_denial_change_publishes_nsec3param() {
        let Setup { mut zone, hsm, dir } = setup("");
        let mut ctx = hsm.create_context().unwrap();
        zone.load_signconf().unwrap();
        zone.read(ctx.as_mut()).unwrap();
        sign_inline(&mut zone, ctx.as_mut(), 1_700_000_000);
        assert!(zone.db.get("example.com").unwrap().denial.is_some());

        let path = dir.path().join("signconf.toml");
        let content = fs::read_to_string(&path).unwrap();
        let content = content.replace(
            "serial = \"counter\"",
            "serial = \"counter\"\n\n[denial]\nmethod = \"nsec3\"\niterations = 0",
        );
        // Make sure the mtime moves even on coarse-grained filesystems.
        std::thread::sleep(Duration::from_millis(1100));
        fs::write(&path, content).unwrap();

        assert!(zone.load_signconf().unwrap());
        let apex = zone.db.get("example.com").unwrap();
        assert!(apex.denial.is_none());
        assert!(matches!(
            apex.rrsets.get(&RecordType::NSEC3PARAM).map(|r| &r.values()[0]),
            Some(RecordValue::NSEC3PARAM { iterations: 0, .. })
        ));
    }

    #[test]
    fn test_next_sign_respects_refresh() {
        let Setup { mut zone, dir: _dir, .. } = setup("");
        zone.load_signconf().unwrap();
        let now = 1_700_000_000;
        assert_eq!(zone.next_sign(now), now + 3600);

        let refresh = zone.signconf().unwrap().refresh_secs;
        zone.stats.min_expiration = Some((now + refresh + 100) as u32);
        assert_eq!(zone.next_sign(now), now + 100);

        zone.stats.min_expiration = Some(now as u32);
        assert_eq!(zone.next_sign(now), now);
    }
}
