//! Post-write notification: runs the configured command on the engine's
//! tokio runtime so workers never wait on it.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Notifier {
    handle: Handle,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Notifier {
    /// `command` is split on whitespace; the zone name and output path are
    /// appended as the last two arguments.
    pub fn new(handle: Handle, command: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            handle,
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn notify(&self, zone: &str, output: &Path) {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(zone).arg(output).kill_on_drop(true);
        let zone = zone.to_string();
        let program = self.program.clone();
        let timeout = self.timeout;

        self.handle.spawn(async move {
            match tokio::time::timeout(timeout, command.status()).await {
                Ok(Ok(status)) if status.success() => {
                    debug!("Notify {} for {} succeeded", program, zone);
                }
                Ok(Ok(status)) => warn!("Notify {} for {} exited with {}", program, zone, status),
                Ok(Err(e)) => warn!("Notify {} for {} failed to start: {}", program, zone, e),
                Err(_) => warn!("Notify {} for {} timed out after {:?}", program, zone, timeout),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_split() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let notifier = Notifier::new(
            runtime.handle().clone(),
            "/usr/sbin/rndc reload",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(notifier.program, "/usr/sbin/rndc");
        assert_eq!(notifier.args, vec!["reload".to_string()]);

        assert!(Notifier::new(runtime.handle().clone(), "   ", Duration::from_secs(5)).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_notify_runs_command() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("notified");
        let script = format!("touch {}", marker.display());
        let notifier = Notifier::new(
            runtime.handle().clone(),
            "sh -c",
            Duration::from_secs(5),
        )
        .unwrap();
        // `sh -c <script> <zone> <path>`: zone and path become $0 and $1.
        let mut with_script = notifier.clone();
        with_script.args.push(script);
        with_script.notify("example.com", Path::new("/tmp/example.com.signed"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(marker.exists());
    }
}
