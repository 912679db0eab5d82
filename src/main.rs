//! AEGIS DNSSEC Signer Entry Point
//!
//! Runs the signing engine: zones from the zonelist are configured, read,
//! signed through the soft HSM and written out, then re-signed on schedule.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file
//! aegis-signer --config /etc/aegis-signer/signer.toml
//!
//! # Accept control commands (queue, flush, sign <zone>, ...) on stdin
//! aegis-signer --config signer.toml --foreground-console
//!
//! # Create a new key in the configured key directory
//! aegis-signer --config signer.toml keygen --algorithm 13
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use aegis_signer::engine::command::{self, Command};
use aegis_signer::signer::hsm::SoftHsm;
use aegis_signer::signer::keys::Algorithm;
use aegis_signer::{Engine, EngineShared, SignerConfig};

/// AEGIS DNSSEC Signer
#[derive(Parser, Debug)]
#[command(name = "aegis-signer")]
#[command(author = "AEGIS Team")]
#[command(version = "0.1.0")]
#[command(about = "AEGIS DNSSEC zone signer", long_about = None)]
struct Args {
    /// Path to configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Read control commands from stdin
    #[arg(long)]
    foreground_console: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a signing key in the key directory
    Keygen {
        /// DNSSEC algorithm number (13 = ECDSAP256SHA256, 15 = ED25519)
        #[arg(short, long, default_value = "15")]
        algorithm: u8,
    },
}

fn level_filter(verbosity: u8) -> EnvFilter {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    EnvFilter::new(level)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging behind a reload handle for the `verbosity` command
    let (filter, filter_handle) = reload::Layer::new(level_filter(if args.verbose { 3 } else { 2 }));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    let config = match &args.config {
        Some(path) => SignerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SignerConfig::default(),
    };

    let hsm = Arc::new(SoftHsm::new(&config.hsm.key_dir));

    if let Some(Commands::Keygen { algorithm }) = args.command {
        let algorithm = Algorithm::from_number(algorithm)
            .with_context(|| format!("unsupported algorithm {}", algorithm))?;
        std::fs::create_dir_all(&config.hsm.key_dir)
            .with_context(|| format!("failed to create {}", config.hsm.key_dir.display()))?;
        let locator = hsm.generate_key(algorithm)?;
        println!("{}", locator);
        return Ok(());
    }

    info!("Starting AEGIS signer v{}", env!("CARGO_PKG_VERSION"));

    let mut engine = Engine::new(config, hsm)?;
    let shared = engine.handle();
    shared.set_verbosity_hook(Box::new(move |level| {
        filter_handle
            .modify(|filter| *filter = level_filter(level))
            .context("failed to change log filter")
    }));

    #[cfg(target_os = "linux")]
    {
        let shared = shared.clone();
        ctrlc::set_handler(move || {
            info!("Interrupt received, stopping");
            shared.request_stop();
        })?;
    }

    engine.start()?;

    if args.foreground_console {
        spawn_console(shared.clone());
    }

    engine.run()?;
    info!("Signer stopped");
    Ok(())
}

fn spawn_console(shared: Arc<EngineShared>) {
    let spawned = thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Console read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Stop) => {
                        println!("{}", command::execute(&shared, Command::Stop));
                        break;
                    }
                    Ok(cmd) => print!("{}", with_newline(command::execute(&shared, cmd))),
                    Err(e) => println!("Error: {}\n{}", e, command::HELP),
                }
            }
        });
    if let Err(e) = spawned {
        error!("Failed to start console: {}", e);
    }
}

fn with_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
