//! Input and output adapters
//!
//! The READ stage pulls unsigned records through an [`InputAdapter`]; the
//! WRITE stage pushes the signed zone text through an [`OutputAdapter`].
//! File-backed implementations are provided; the unsigned input is a JSON
//! list of zone-relative records.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::AdapterError;
use crate::signer::records::{InputRecord, Record};

/// What a read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Changed(Vec<Record>),
    /// Same content as the last successful read.
    Unchanged,
}

pub trait InputAdapter: Send {
    fn read(&mut self) -> Result<ReadOutcome, AdapterError>;
    /// Force the next read to import, as after a retransfer.
    fn reset(&mut self);
    fn describe(&self) -> String;
}

pub trait OutputAdapter: Send {
    fn write(&mut self, zone_text: &str) -> Result<(), AdapterError>;
    /// Where the signed zone lands; the DS file is written beside it.
    fn location(&self) -> Option<&Path>;
    fn describe(&self) -> String;
}

/// Adapter declarations in the zonelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    File { path: PathBuf },
}

impl AdapterConfig {
    pub fn input(&self, apex: &str) -> Box<dyn InputAdapter> {
        match self {
            AdapterConfig::File { path } => Box::new(FileInput::new(path, apex)),
        }
    }

    pub fn output(&self) -> Box<dyn OutputAdapter> {
        match self {
            AdapterConfig::File { path } => Box::new(FileOutput::new(path)),
        }
    }
}

/// JSON record list on disk.
pub struct FileInput {
    path: PathBuf,
    apex: String,
    last_digest: Option<Vec<u8>>,
}

impl FileInput {
    pub fn new(path: impl Into<PathBuf>, apex: &str) -> Self {
        Self {
            path: path.into(),
            apex: apex.to_string(),
            last_digest: None,
        }
    }
}

impl InputAdapter for FileInput {
    fn read(&mut self) -> Result<ReadOutcome, AdapterError> {
        if !self.path.exists() {
            return Err(AdapterError::NotReady(format!(
                "{} not yet available",
                self.path.display()
            )));
        }
        let content = fs::read(&self.path)
            .map_err(|e| AdapterError::io(self.path.display().to_string(), e))?;

        let digest = Sha256::digest(&content).to_vec();
        if self.last_digest.as_ref() == Some(&digest) {
            debug!("{} unchanged since last read", self.path.display());
            return Ok(ReadOutcome::Unchanged);
        }

        let input: Vec<InputRecord> = serde_json::from_slice(&content)
            .map_err(|e| AdapterError::Parse(format!("{}: {}", self.path.display(), e)))?;
        let records = input
            .into_iter()
            .map(|r| r.into_record(&self.apex))
            .collect();
        self.last_digest = Some(digest);
        Ok(ReadOutcome::Changed(records))
    }

    fn reset(&mut self) {
        self.last_digest = None;
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Signed zone file, replaced atomically.
pub struct FileOutput {
    path: PathBuf,
}

impl FileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Write `content` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), AdapterError> {
    let display = path.display().to_string();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| AdapterError::io(&display, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).map_err(|e| AdapterError::io(&display, e))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| AdapterError::io(&display, e))?;
    fs::rename(&tmp, path).map_err(|e| AdapterError::io(&display, e))
}

impl OutputAdapter for FileOutput {
    fn write(&mut self, zone_text: &str) -> Result<(), AdapterError> {
        write_atomic(&self.path, zone_text.as_bytes())
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::records::RecordType;
    use tempfile::TempDir;

    fn input_json() -> String {
        let records = vec![
            InputRecord::soa("ns1.example.com", "hostmaster.example.com", 1, 3600),
            InputRecord::a("www", "192.0.2.1".parse().unwrap(), 300),
        ];
        serde_json::to_string(&records).unwrap()
    }

    #[test]
    fn test_missing_input_not_ready() {
        let dir = TempDir::new().unwrap();
        let mut input = FileInput::new(dir.path().join("zone.json"), "example.com");
        let err = input.read().unwrap_err();
        assert!(err.is_soft());
    }

    #[test]
    fn test_read_detects_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zone.json");
        fs::write(&path, input_json()).unwrap();

        let mut input = FileInput::new(&path, "example.com");
        match input.read().unwrap() {
            ReadOutcome::Changed(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].record_type(), RecordType::SOA);
                assert_eq!(records[1].name, "www.example.com");
            }
            ReadOutcome::Unchanged => panic!("first read must import"),
        }
        assert_eq!(input.read().unwrap(), ReadOutcome::Unchanged);

        input.reset();
        assert!(matches!(input.read().unwrap(), ReadOutcome::Changed(_)));
    }

    #[test]
    fn test_malformed_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zone.json");
        fs::write(&path, "not json").unwrap();
        let mut input = FileInput::new(&path, "example.com");
        assert!(matches!(input.read(), Err(AdapterError::Parse(_))));
    }

    #[test]
    fn test_atomic_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("example.com.zone");
        let mut output = FileOutput::new(&path);
        output.write("first\n").unwrap();
        output.write("second\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");
        assert!(!dir.path().join("out").join("example.com.zone.tmp").exists());
        assert_eq!(output.location(), Some(path.as_path()));
    }

    #[test]
    fn test_adapter_config_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            input: AdapterConfig,
        }
        let parsed: Wrapper =
            toml::from_str("input = { type = \"file\", path = \"/var/zones/example.json\" }").unwrap();
        assert_eq!(
            parsed.input,
            AdapterConfig::File {
                path: PathBuf::from("/var/zones/example.json")
            }
        );
    }
}
