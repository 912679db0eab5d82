//! Zonelist
//!
//! Zones live in an arena addressed by [`ZoneHandle`]: an index plus a
//! generation, so a task holding the handle of a removed zone cannot reach
//! whatever later reuses the slot. A name map resolves control commands.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lock_utils::lock_or_recover;
use crate::scheduler::Stage;
use crate::signer::adapter::AdapterConfig;
use crate::signer::wire::normalize_name;
use crate::signer::zone::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneHandle {
    index: u32,
    generation: u32,
}

impl ZoneHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// One `[[zone]]` entry of the zonelist file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub signconf: PathBuf,
    pub input: AdapterConfig,
    pub output: AdapterConfig,
}

impl ZoneConfig {
    pub fn build(&self) -> Zone {
        let name = normalize_name(&self.name);
        Zone::new(
            &name,
            &self.signconf,
            self.input.input(&name),
            self.output.output(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonelistConfig {
    #[serde(default, rename = "zone")]
    pub zones: Vec<ZoneConfig>,
}

impl ZonelistConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ZonelistConfig = toml::from_str(content).context("invalid zonelist")?;
        let mut seen = std::collections::HashSet::new();
        for zone in &config.zones {
            if !seen.insert(normalize_name(&zone.name)) {
                anyhow::bail!("zone {} listed twice", zone.name);
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read zonelist {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("in {}", path.display()))
    }
}

/// A zone plus the bookkeeping the engine keeps outside the zone lock.
#[derive(Debug)]
pub struct ZoneEntry {
    pub name: String,
    pub handle: ZoneHandle,
    config: Mutex<ZoneConfig>,
    zone: Mutex<Zone>,
    /// Interrupt requested while the zone's task was running. Read and
    /// written only under the scheduler lock.
    interrupt: Mutex<Option<Stage>>,
}

impl ZoneEntry {
    pub fn lock(&self) -> MutexGuard<'_, Zone> {
        lock_or_recover(&self.zone, "zone")
    }

    pub fn request_interrupt(&self, stage: Stage) {
        let mut pending = lock_or_recover(&self.interrupt, "zone interrupt");
        // Keep the earliest stage asked for.
        if pending.map_or(true, |p| stage.order() < p.order()) {
            *pending = Some(stage);
        }
    }

    pub fn take_interrupt(&self) -> Option<Stage> {
        lock_or_recover(&self.interrupt, "zone interrupt").take()
    }

    pub fn config(&self) -> ZoneConfig {
        lock_or_recover(&self.config, "zone config").clone()
    }

    /// Point the zone at `config`. Takes the zone lock, so callers must not
    /// hold the zonelist lock.
    pub fn reconfigure(&self, config: ZoneConfig) {
        let mut zone = self.lock();
        zone.reconfigure(
            &config.signconf,
            config.input.input(&self.name),
            config.output.output(),
        );
        drop(zone);
        *lock_or_recover(&self.config, "zone config") = config;
        info!("Zone {} reconfigured", self.name);
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<ZoneEntry>>,
}

/// What a zonelist refresh changed.
#[derive(Debug, Default)]
pub struct ZonelistDiff {
    pub added: Vec<Arc<ZoneEntry>>,
    pub removed: Vec<Arc<ZoneEntry>>,
    /// Zones whose configuration changed, with the new configuration.
    /// Not applied yet; see [`ZoneEntry::reconfigure`].
    pub updated: Vec<(Arc<ZoneEntry>, ZoneConfig)>,
}

#[derive(Default)]
pub struct Zonelist {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, ZoneHandle>,
}

impl Zonelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Add a zone. Returns `None` if the name is taken.
    pub fn insert(&mut self, config: ZoneConfig) -> Option<Arc<ZoneEntry>> {
        let zone = config.build();
        let name = zone.name.clone();
        if self.by_name.contains_key(&name) {
            return None;
        }
        let handle = match self.free.pop() {
            Some(index) => ZoneHandle::new(index, self.slots[index as usize].generation),
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                ZoneHandle::new((self.slots.len() - 1) as u32, 0)
            }
        };
        let entry = Arc::new(ZoneEntry {
            name: name.clone(),
            handle,
            config: Mutex::new(config),
            zone: Mutex::new(zone),
            interrupt: Mutex::new(None),
        });
        self.slots[handle.index as usize].entry = Some(entry.clone());
        self.by_name.insert(name, handle);
        Some(entry)
    }

    pub fn get(&self, handle: ZoneHandle) -> Option<Arc<ZoneEntry>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.clone()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ZoneEntry>> {
        self.get(*self.by_name.get(&normalize_name(name))?)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<ZoneEntry>> {
        let handle = self.by_name.remove(&normalize_name(name))?;
        let slot = self.slots.get_mut(handle.index as usize)?;
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        entry
    }

    /// Sorted zone names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entries(&self) -> Vec<Arc<ZoneEntry>> {
        self.names()
            .iter()
            .filter_map(|name| self.lookup(name))
            .collect()
    }

    /// Bring the zonelist in line with `config`: add new zones, drop
    /// vanished ones and re-point zones whose entry changed.
    pub fn apply(&mut self, config: &ZonelistConfig) -> ZonelistDiff {
        let mut diff = ZonelistDiff::default();
        let wanted: HashMap<String, &ZoneConfig> = config
            .zones
            .iter()
            .map(|z| (normalize_name(&z.name), z))
            .collect();

        for name in self.names() {
            if !wanted.contains_key(&name) {
                if let Some(entry) = self.remove(&name) {
                    info!("Zone {} removed from zonelist", name);
                    diff.removed.push(entry);
                }
            }
        }

        for zone_config in &config.zones {
            let name = normalize_name(&zone_config.name);
            match self.lookup(&name) {
                Some(entry) => {
                    if entry.config() != *zone_config {
                        diff.updated.push((entry, zone_config.clone()));
                    }
                }
                None => {
                    if let Some(entry) = self.insert(zone_config.clone()) {
                        info!("Zone {} added to zonelist", name);
                        diff.added.push(entry);
                    }
                }
            }
        }
        diff
    }
}
