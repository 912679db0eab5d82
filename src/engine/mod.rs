//! # Signing engine
//!
//! Owns the scheduler, the FifoQ, the zonelist and the two thread pools.
//! Workers run zone stages; drudgers only sign. The engine thread itself
//! sits in [`Engine::run`] waiting for a reload or stop signal.
//!
//! Lock order, where more than one is held: zone, then scheduler. The
//! zonelist lock is never held across either; a zonelist refresh applies
//! zone reconfigurations only after releasing it.

pub mod command;
pub mod drudger;
pub mod notify;
pub mod stages;
pub mod worker;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::SignerConfig;
use crate::current_timestamp;
use crate::error::{Result, SignerError};
use crate::fifoq::FifoQ;
use crate::lock_utils::{lock_or_recover, read_lock_or_recover, wait_or_recover, write_lock_or_recover};
use crate::scheduler::{BackoffPolicy, Schedule, Stage, Task};
use crate::signer::hsm::Hsm;
use crate::signer::zonelist::{ZoneEntry, ZoneHandle, Zonelist, ZonelistConfig};

pub use command::Command;
pub use drudger::{Drudger, SignUnit, UnitReport};
pub use notify::Notifier;
pub use worker::Worker;

/// Applies a new log verbosity; installed by the binary.
pub type VerbosityHook = Box<dyn Fn(u8) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Signals {
    pub reload: bool,
    pub stop: bool,
}

/// State shared by the engine thread, workers, drudgers and the command
/// surface.
pub struct EngineShared {
    pub schedule: Schedule,
    pub fifoq: FifoQ<SignUnit>,
    pub hsm: Arc<dyn Hsm>,
    /// Raised to make every worker and drudger return.
    pub exit: Arc<AtomicBool>,
    pub poll: Duration,
    pub backoff: BackoffPolicy,
    pub notifier: Option<Notifier>,
    zonelist: RwLock<Zonelist>,
    workers: usize,
    drudgers: usize,
    signals: Mutex<Signals>,
    signal_cond: Condvar,
    verbosity: Mutex<Option<VerbosityHook>>,
}

impl EngineShared {
    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// With no drudgers, workers sign their own zones.
    pub fn has_drudgers(&self) -> bool {
        self.drudgers > 0
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn drudger_count(&self) -> usize {
        self.drudgers
    }

    pub fn request_reload(&self) {
        let mut signals = lock_or_recover(&self.signals, "engine signals");
        if !signals.reload {
            info!("Engine reload requested");
        }
        signals.reload = true;
        self.signal_cond.notify_all();
    }

    pub fn request_stop(&self) {
        let mut signals = lock_or_recover(&self.signals, "engine signals");
        signals.stop = true;
        self.signal_cond.notify_all();
    }

    pub fn reload_requested(&self) -> bool {
        lock_or_recover(&self.signals, "engine signals").reload
    }

    pub fn stop_requested(&self) -> bool {
        lock_or_recover(&self.signals, "engine signals").stop
    }

    /// Block until a signal is raised. Clears the reload flag it returns.
    pub fn wait_signal(&self) -> Signals {
        let mut signals = lock_or_recover(&self.signals, "engine signals");
        while !signals.reload && !signals.stop {
            signals = wait_or_recover(&self.signal_cond, signals, "engine signals");
        }
        let raised = *signals;
        signals.reload = false;
        raised
    }

    pub fn zone_entry(&self, handle: ZoneHandle) -> Option<Arc<ZoneEntry>> {
        read_lock_or_recover(&self.zonelist, "zonelist").get(handle)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ZoneEntry>> {
        read_lock_or_recover(&self.zonelist, "zonelist")
            .lookup(name)
            .ok_or_else(|| SignerError::ZoneNotFound(name.to_string()))
    }

    pub fn zone_names(&self) -> Vec<String> {
        read_lock_or_recover(&self.zonelist, "zonelist").names()
    }

    /// Move a zone's task to `stage`, due now.
    ///
    /// A pending task is interrupted in place. A task that is running right
    /// now is not in the queue; the request is parked on the zone and the
    /// worker applies it when it reschedules.
    pub fn enqueue_task(&self, entry: &ZoneEntry, stage: Stage) -> Result<()> {
        let now = current_timestamp();
        let mut queue = self.schedule.lock();
        match queue.remove(&entry.name, None) {
            Some(mut task) => {
                task.due_date = task.stage.interrupt(stage, task.due_date, now);
                debug!("{}: task moved to {}", entry.name, task.current());
                queue.insert(task)?;
            }
            None => {
                debug!("{}: task is running, parking {}", entry.name, stage);
                entry.request_interrupt(stage);
            }
        }
        drop(queue);
        self.schedule.notify();
        Ok(())
    }

    pub fn enqueue_zone(&self, name: &str, stage: Stage) -> Result<()> {
        let entry = self.lookup(name)?;
        self.enqueue_task(&entry, stage)
    }

    /// Returns the number of zones touched.
    pub fn enqueue_all(&self, stage: Stage) -> usize {
        let entries = read_lock_or_recover(&self.zonelist, "zonelist").entries();
        let mut count = 0;
        for entry in entries {
            match self.enqueue_task(&entry, stage) {
                Ok(()) => count += 1,
                Err(e) => warn!("{}: cannot schedule {}: {}", entry.name, stage, e),
            }
        }
        count
    }

    /// Re-read and re-sign now, optionally with a forced outbound serial.
    pub fn sign_zone(&self, name: &str, serial: Option<u32>) -> Result<()> {
        let entry = self.lookup(name)?;
        if let Some(serial) = serial {
            entry.lock().serial.forced = Some(serial);
            info!("{}: serial {} will be used on the next signing", name, serial);
        }
        self.enqueue_task(&entry, Stage::Read)
    }

    /// Forget the input's change marker so the next read fetches it in full.
    pub fn retransfer(&self, name: &str) -> Result<()> {
        let entry = self.lookup(name)?;
        entry.lock().reset_input();
        self.enqueue_task(&entry, Stage::Read)
    }

    pub fn flush_all(&self) -> usize {
        let count = self.schedule.flush_all(current_timestamp());
        info!("Flushed {} tasks", count);
        count
    }

    pub fn set_verbosity_hook(&self, hook: VerbosityHook) {
        *lock_or_recover(&self.verbosity, "verbosity hook") = Some(hook);
    }

    pub fn set_verbosity(&self, level: u8) -> anyhow::Result<()> {
        match lock_or_recover(&self.verbosity, "verbosity hook").as_ref() {
            Some(hook) => hook(level),
            None => anyhow::bail!("log verbosity cannot be changed at runtime"),
        }
    }

    /// Human-readable dump of the scheduler.
    pub fn describe_queue(&self) -> String {
        let now = current_timestamp();
        let tasks = self.schedule.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "It is now {}", format_time(now));
        let _ = writeln!(
            out,
            "Workers: {}, drudgers: {}, signing queue: {}/{}",
            self.workers,
            self.drudgers,
            self.fifoq.len(),
            self.fifoq.capacity()
        );
        let _ = writeln!(out, "There are {} tasks scheduled.", tasks.len());
        for task in tasks {
            let _ = write!(
                out,
                "On {} I will {} zone {}",
                format_time(task.due_date),
                task.current(),
                task.owner
            );
            if let Some(halted) = task.stage.halted {
                let _ = write!(
                    out,
                    ", then {} (was due {})",
                    halted.stage,
                    format_time(halted.due_date)
                );
            }
            if task.backoff > 0 {
                let _ = write!(out, " [backoff {}s]", task.backoff);
            }
            out.push('\n');
        }
        out
    }

    /// One line per zone with its signing statistics.
    pub fn describe_zones(&self) -> String {
        let entries = read_lock_or_recover(&self.zonelist, "zonelist").entries();
        let mut out = format!("There are {} zones configured.\n", entries.len());
        for entry in entries {
            let zone = entry.lock();
            let stats = &zone.stats;
            let _ = writeln!(
                out,
                "{}: serial {}, {} signatures ({} reused), last signed {}, output {}",
                entry.name,
                zone.serial
                    .outbound
                    .map_or_else(|| "-".to_string(), |s| s.to_string()),
                stats.sig_count,
                stats.sig_reuse,
                stats.last_signed.map_or_else(|| "never".to_string(), format_time),
                zone.output_description()
            );
        }
        out
    }
}

pub fn format_time(secs: u64) -> String {
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// The signer engine and its threads.
pub struct Engine {
    config: SignerConfig,
    shared: Arc<EngineShared>,
    workers: Vec<JoinHandle<()>>,
    drudgers: Vec<JoinHandle<()>>,
    // Notify commands run here; kept alive for the engine's lifetime.
    _runtime: Option<tokio::runtime::Runtime>,
}

impl Engine {
    pub fn new(config: SignerConfig, hsm: Arc<dyn Hsm>) -> anyhow::Result<Self> {
        config.validate()?;
        let engine = &config.engine;

        let runtime = match &engine.notify_command {
            Some(_) => Some(
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("notify")
                    .enable_all()
                    .build()
                    .context("failed to build notify runtime")?,
            ),
            None => None,
        };
        let notifier = match (&runtime, &engine.notify_command) {
            (Some(runtime), Some(command)) => {
                Notifier::new(runtime.handle().clone(), command, engine.notify_timeout())
            }
            _ => None,
        };

        let exit = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(EngineShared {
            schedule: Schedule::new(),
            fifoq: FifoQ::new(engine.queue_capacity, exit.clone()),
            hsm,
            exit,
            poll: engine.poll_interval(),
            backoff: config.backoff,
            notifier,
            zonelist: RwLock::new(Zonelist::new()),
            workers: engine.workers,
            drudgers: engine.drudgers,
            signals: Mutex::new(Signals::default()),
            signal_cond: Condvar::new(),
            verbosity: Mutex::new(None),
        });

        Ok(Self {
            config,
            shared,
            workers: Vec::new(),
            drudgers: Vec::new(),
            _runtime: runtime,
        })
    }

    pub fn handle(&self) -> Arc<EngineShared> {
        self.shared.clone()
    }

    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    pub fn open_hsm(&self) -> anyhow::Result<()> {
        self.shared.hsm.open().context("failed to open HSM")
    }

    /// Apply a zonelist: new zones start at SIGNCONF, changed zones are
    /// interrupted back to SIGNCONF, removed zones lose their task.
    pub fn load_zonelist(&self, config: &ZonelistConfig) {
        let diff = write_lock_or_recover(&self.shared.zonelist, "zonelist").apply(config);
        let schedule = &self.shared.schedule;
        let now = current_timestamp();

        schedule.set_loading(true);
        for entry in &diff.removed {
            schedule.unschedule(&entry.name, None);
        }
        for entry in &diff.added {
            let task = Task::new(entry.name.clone(), entry.handle, Stage::Signconf, now);
            if let Err(e) = schedule.schedule(task) {
                warn!("{}: {}", entry.name, e);
            }
        }
        schedule.set_loading(false);

        // The write guard is gone; a worker may hold the zone lock.
        for (entry, zone_config) in &diff.updated {
            entry.reconfigure(zone_config.clone());
            if let Err(e) = self.shared.enqueue_task(entry, Stage::Signconf) {
                warn!("{}: {}", entry.name, e);
            }
        }
        info!(
            "Zonelist loaded: {} added, {} removed, {} updated",
            diff.added.len(),
            diff.removed.len(),
            diff.updated.len()
        );
    }

    pub fn load_zonelist_file(&self) -> anyhow::Result<()> {
        let zonelist = ZonelistConfig::load(&self.config.engine.zonelist)?;
        self.load_zonelist(&zonelist);
        Ok(())
    }

    /// Open the HSM, load the zonelist and start both pools.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.open_hsm()?;
        self.load_zonelist_file()?;
        self.start_threads();
        Ok(())
    }

    pub fn start_threads(&mut self) {
        self.start_workers();
        self.start_drudgers();
    }

    pub fn start_workers(&mut self) {
        for id in 0..self.shared.workers {
            let worker = self.worker(id);
            match thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker.run())
            {
                Ok(handle) => self.workers.push(handle),
                Err(e) => error!("Failed to spawn worker {}: {}", id, e),
            }
        }
        info!("Started {} workers", self.workers.len());
    }

    pub fn start_drudgers(&mut self) {
        for id in 0..self.shared.drudgers {
            let drudger = Drudger::new(id, self.shared.clone());
            match thread::Builder::new()
                .name(format!("drudger-{}", id))
                .spawn(move || drudger.run())
            {
                Ok(handle) => self.drudgers.push(handle),
                Err(e) => error!("Failed to spawn drudger {}: {}", id, e),
            }
        }
        if !self.drudgers.is_empty() {
            info!("Started {} drudgers", self.drudgers.len());
        }
    }

    /// A worker bound to this engine, for driving stages by hand.
    pub fn worker(&self, id: usize) -> Worker {
        Worker::new(id, self.shared.clone())
    }

    /// Serve reload and stop signals until told to stop.
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let signals = self.shared.wait_signal();
            if signals.stop {
                break;
            }
            if signals.reload {
                if let Err(e) = self.reload() {
                    error!("Reload failed: {:#}", e);
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Stop both pools, reopen the HSM, re-read the zonelist and start
    /// again. Scheduled tasks survive.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        info!("Reloading engine");
        self.stop_threads();

        let reopened = self.shared.hsm.reopen();
        if let Err(e) = &reopened {
            error!("Failed to reopen HSM: {}", e);
            // Give the HSM time before contexts start failing again.
            thread::sleep(self.shared.poll);
        }
        let loaded = self.load_zonelist_file();
        if let Err(e) = &loaded {
            warn!("Keeping current zonelist: {:#}", e);
        }

        self.start_threads();
        reopened.context("HSM reopen failed")?;
        Ok(())
    }

    fn stop_threads(&mut self) {
        if self.workers.is_empty() && self.drudgers.is_empty() {
            return;
        }
        debug!("Stopping engine threads");
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.schedule.wake_all();
        self.shared.fifoq.wake_all();

        for handle in self.workers.drain(..).chain(self.drudgers.drain(..)) {
            if handle.join().is_err() {
                error!("Engine thread panicked");
            }
        }

        // Whatever is still queued belongs to aborted batches.
        for unit in self.shared.fifoq.drain() {
            let batch = unit.batch.clone();
            self.shared.fifoq.report(
                &batch,
                false,
                UnitReport {
                    domain: unit.domain,
                    tally: Default::default(),
                    error: None,
                },
            );
        }
        self.shared.exit.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&mut self) {
        if self.workers.is_empty() && self.drudgers.is_empty() {
            return;
        }
        info!("Shutting down signer engine");
        self.stop_threads();
        self.shared.hsm.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::hsm::SoftHsm;
    use std::path::PathBuf;
    use std::time::Instant;

    use crate::signer::adapter::AdapterConfig;
    use crate::signer::zone::tests::{write_input, write_signconf};
    use crate::signer::zonelist::ZoneConfig;

    fn engine(workers: usize, drudgers: usize) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SignerConfig::default();
        config.engine.workers = workers;
        config.engine.drudgers = drudgers;
        config.engine.zonelist = dir.path().join("zonelist.toml");
        let hsm = Arc::new(SoftHsm::new(dir.path()));
        (Engine::new(config, hsm).unwrap(), dir)
    }

    fn zonelist(names: &[&str]) -> ZonelistConfig {
        ZonelistConfig {
            zones: names
                .iter()
                .map(|name| ZoneConfig {
                    name: name.to_string(),
                    signconf: PathBuf::from(format!("/nonexistent/{}.toml", name)),
                    input: AdapterConfig::File {
                        path: PathBuf::from(format!("/nonexistent/{}.json", name)),
                    },
                    output: AdapterConfig::File {
                        path: PathBuf::from(format!("/nonexistent/{}.signed", name)),
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn test_load_zonelist_schedules_signconf() {
        let (engine, _dir) = engine(1, 0);
        engine.load_zonelist(&zonelist(&["b.example", "a.example"]));

        let tasks = engine.handle().schedule.snapshot();
        assert_eq!(tasks.len(), 2);
        // Same due second: lexical order.
        assert_eq!(tasks[0].owner, "a.example");
        assert_eq!(tasks[1].owner, "b.example");
        assert!(tasks.iter().all(|t| t.current() == Stage::Signconf));
    }

    #[test]
    fn test_removed_zone_is_unscheduled() {
        let (engine, _dir) = engine(1, 0);
        engine.load_zonelist(&zonelist(&["a.example", "b.example"]));
        engine.load_zonelist(&zonelist(&["a.example"]));

        let shared = engine.handle();
        let owners: Vec<String> = shared.schedule.snapshot().into_iter().map(|t| t.owner).collect();
        assert_eq!(owners, vec!["a.example".to_string()]);
        assert!(shared.lookup("b.example").is_err());
    }

    #[test]
    fn test_enqueue_interrupts_pending_task() {
        let (engine, _dir) = engine(1, 0);
        engine.load_zonelist(&zonelist(&["a.example"]));
        let shared = engine.handle();

        // Push the task into the future at WRITE.
        let mut task = shared.schedule.unschedule("a.example", None).unwrap();
        task.stage.current = Stage::Write;
        task.due_date = current_timestamp() + 3600;
        shared.schedule.schedule(task).unwrap();

        shared.enqueue_zone("a.example", Stage::Read).unwrap();
        let task = shared.schedule.peek_first().unwrap();
        assert_eq!(task.current(), Stage::Read);
        assert!(task.due_date <= current_timestamp());
        assert_eq!(task.stage.halted.unwrap().stage, Stage::Write);
    }

    #[test]
    fn test_enqueue_running_task_parks_interrupt() {
        let (engine, _dir) = engine(1, 0);
        engine.load_zonelist(&zonelist(&["a.example"]));
        let shared = engine.handle();

        let task = shared.schedule.pop_ready(current_timestamp()).unwrap();
        shared.enqueue_zone("a.example", Stage::Read).unwrap();
        assert!(shared.schedule.is_empty());

        let entry = shared.zone_entry(task.zone).unwrap();
        assert_eq!(entry.take_interrupt(), Some(Stage::Read));
    }

    /// A signable example.com in the engine's directory.
    fn signable_zonelist(engine: &Engine, dir: &std::path::Path) -> ZonelistConfig {
        let hsm = SoftHsm::new(dir);
        let signconf = write_signconf(dir, &hsm, "");
        let input = dir.join("example.com.json");
        write_input(&input, &[]);
        engine.open_hsm().unwrap();
        ZonelistConfig {
            zones: vec![ZoneConfig {
                name: "example.com".to_string(),
                signconf,
                input: AdapterConfig::File { path: input },
                output: AdapterConfig::File {
                    path: dir.join("example.com.signed"),
                },
            }],
        }
    }

    fn wait_until_empty(schedule: &crate::scheduler::Schedule) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !schedule.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_worker_applies_parked_interrupt_and_resumes() {
        let (engine, dir) = engine(1, 0);
        engine.load_zonelist(&signable_zonelist(&engine, dir.path()));
        let shared = engine.handle();
        let mut worker = engine.worker(0);
        for _ in 0..4 {
            assert!(worker.run_once());
        }
        assert_eq!(shared.flush_all(), 1);

        // The worker pops SIGN, then waits for the zone.
        let entry = shared.lookup("example.com").unwrap();
        let zone = entry.lock();
        let running = thread::spawn(move || {
            let ran = worker.run_once();
            (worker, ran)
        });
        wait_until_empty(&shared.schedule);
        shared.enqueue_zone("example.com", Stage::Read).unwrap();
        assert!(shared.schedule.is_empty());
        drop(zone);
        let (mut worker, ran) = running.join().unwrap();
        assert!(ran);

        // SIGN led to WRITE; the parked READ displaced it.
        let task = shared.schedule.peek_first().unwrap();
        assert_eq!(task.current(), Stage::Read);
        assert_eq!(task.stage.halted.unwrap().stage, Stage::Write);
        assert!(task.due_date <= current_timestamp());
        assert_eq!(entry.take_interrupt(), None);

        assert!(worker.run_once()); // READ
        let task = shared.schedule.peek_first().unwrap();
        assert_eq!(task.current(), Stage::Sign);
        assert!(task.stage.halted.is_some());

        assert!(worker.run_once()); // SIGN
        let task = shared.schedule.peek_first().unwrap();
        assert_eq!(task.current(), Stage::Write);
        assert!(task.stage.halted.is_none());

        assert!(worker.run_once()); // WRITE
        let task = shared.schedule.peek_first().unwrap();
        assert_eq!(task.current(), Stage::Sign);
        assert!(task.due_date > current_timestamp());
        assert!(!worker.run_once());
    }

    #[test]
    fn test_zonelist_refresh_does_not_wait_for_busy_zone() {
        let (engine, dir) = engine(1, 0);
        let mut config = signable_zonelist(&engine, dir.path());
        engine.load_zonelist(&config);
        let shared = engine.handle();

        let other = dir.path().join("other.signed");
        config.zones[0].output = AdapterConfig::File { path: other.clone() };
        let entry = shared.lookup("example.com").unwrap();
        let zone = entry.lock();

        thread::scope(|scope| {
            let loader = scope.spawn(|| engine.load_zonelist(&config));
            // The loader is stuck on the zone, but the zonelist stays readable.
            thread::sleep(Duration::from_millis(100));
            assert!(shared.zonelist.try_read().is_ok());
            assert!(shared.lookup("example.com").is_ok());

            drop(zone);
            loader.join().unwrap();
        });
        assert_eq!(
            entry.config().output,
            AdapterConfig::File { path: other }
        );
    }

    #[test]
    fn test_unknown_zone() {
        let (engine, _dir) = engine(1, 0);
        let err = engine.handle().sign_zone("missing.example", None).unwrap_err();
        assert!(matches!(err, SignerError::ZoneNotFound(_)));
    }

    #[test]
    fn test_describe_queue_lists_tasks() {
        let (engine, _dir) = engine(2, 1);
        engine.load_zonelist(&zonelist(&["a.example"]));
        let text = engine.handle().describe_queue();
        assert!(text.contains("There are 1 tasks scheduled."));
        assert!(text.contains("signconf zone a.example"));
        assert!(text.contains("Workers: 2, drudgers: 1"));
    }

    #[test]
    fn test_stop_signal_ends_run() {
        let (mut engine, _dir) = engine(1, 1);
        engine.open_hsm().unwrap();
        engine.start_threads();
        let shared = engine.handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shared.request_stop();
        });
        let started = Instant::now();
        engine.run().unwrap();
        stopper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(engine.workers.is_empty());
        assert!(engine.drudgers.is_empty());
    }

    #[test]
    fn test_wait_signal_clears_reload() {
        let (engine, _dir) = engine(1, 0);
        let shared = engine.handle();
        shared.request_reload();
        assert!(shared.reload_requested());
        let signals = shared.wait_signal();
        assert!(signals.reload);
        assert!(!shared.reload_requested());
    }
}
