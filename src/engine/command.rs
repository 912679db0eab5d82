//! Control commands: parsed from one line of text, answered with text.

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::engine::EngineShared;
use crate::scheduler::Stage;

/// Which zones a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Zone(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Re-read and re-sign now.
    Sign { target: Target, serial: Option<u32> },
    /// Reload signing configuration.
    Update(Target),
    Flush,
    Queue,
    Zones,
    Reload,
    Stop,
    Retransfer(String),
    Verbosity(u8),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

pub const HELP: &str = "\
Commands:
  sign --all                 re-read and re-sign every zone now
  sign <zone> [--serial N]   re-read and re-sign one zone, optionally forcing the serial
  update --all               reload signing configuration of every zone
  update <zone>              reload signing configuration of one zone
  flush                      run every scheduled task now
  queue                      show the scheduler
  zones                      list configured zones
  reload                     reopen the HSM and re-read the zonelist
  retransfer <zone>          fetch the zone input in full on the next read
  verbosity <n>              set log verbosity (0=error .. 4=trace)
  stop                       shut the signer down
";

fn target(args: &[&str], command: &str) -> Result<Target, ParseError> {
    match args.first() {
        Some(&"--all") => Ok(Target::All),
        Some(zone) => Ok(Target::Zone(zone.to_string())),
        None => Err(ParseError(format!("{} needs a zone name or --all", command))),
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Err(ParseError("empty command".to_string()));
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "sign" => {
                let target = target(args, "sign")?;
                let serial = match args.get(1..) {
                    Some(["--serial", value]) => Some(value.parse().map_err(|_| {
                        ParseError(format!("invalid serial: {}", value))
                    })?),
                    Some([]) | None => None,
                    Some(_) => return Err(ParseError("usage: sign <zone> [--serial N]".to_string())),
                };
                if serial.is_some() && target == Target::All {
                    return Err(ParseError("--serial needs a single zone".to_string()));
                }
                Command::Sign { target, serial }
            }
            "update" => Command::Update(target(args, "update")?),
            "flush" => Command::Flush,
            "queue" => Command::Queue,
            "zones" => Command::Zones,
            "reload" => Command::Reload,
            "stop" => Command::Stop,
            "retransfer" => match args {
                [zone] => Command::Retransfer(zone.to_string()),
                _ => return Err(ParseError("usage: retransfer <zone>".to_string())),
            },
            "verbosity" => match args {
                [level] => Command::Verbosity(
                    level
                        .parse()
                        .map_err(|_| ParseError(format!("invalid verbosity: {}", level)))?,
                ),
                _ => return Err(ParseError("usage: verbosity <n>".to_string())),
            },
            "help" => Command::Help,
            other => return Err(ParseError(format!("unknown command: {}", other))),
        };
        Ok(command)
    }
}

/// Run a command against the engine and describe the result.
pub fn execute(shared: &EngineShared, command: Command) -> String {
    info!("Control command: {:?}", command);
    match command {
        Command::Sign { target: Target::All, .. } => {
            let count = shared.enqueue_all(Stage::Read);
            format!("All zones scheduled for immediate re-sign ({}).", count)
        }
        Command::Sign {
            target: Target::Zone(zone),
            serial,
        } => match shared.sign_zone(&zone, serial) {
            Ok(()) => format!("Zone {} scheduled for immediate re-sign.", zone),
            Err(e) => format!("Error: {}", e),
        },
        Command::Update(Target::All) => {
            let count = shared.enqueue_all(Stage::Signconf);
            format!("Signing configuration of all zones will be reloaded ({}).", count)
        }
        Command::Update(Target::Zone(zone)) => match shared.enqueue_zone(&zone, Stage::Signconf) {
            Ok(()) => format!("Signing configuration of zone {} will be reloaded.", zone),
            Err(e) => format!("Error: {}", e),
        },
        Command::Flush => {
            let count = shared.flush_all();
            format!("All {} tasks scheduled immediately.", count)
        }
        Command::Queue => shared.describe_queue(),
        Command::Zones => shared.describe_zones(),
        Command::Reload => {
            shared.request_reload();
            "Reloading engine.".to_string()
        }
        Command::Stop => {
            shared.request_stop();
            "Engine shutting down.".to_string()
        }
        Command::Retransfer(zone) => match shared.retransfer(&zone) {
            Ok(()) => format!("Zone {} will be transferred in full.", zone),
            Err(e) => format!("Error: {}", e),
        },
        Command::Verbosity(level) => match shared.set_verbosity(level) {
            Ok(()) => format!("Verbosity set to {}.", level),
            Err(e) => format!("Error: {}", e),
        },
        Command::Help => HELP.to_string(),
    }
}
