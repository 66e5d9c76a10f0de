//! Native daemon boundary
//!
//! State machines drive strongSwan, xl2tpd and openvpn with fire-and-forget
//! [`StageCommand`]s. Progress comes back separately as stage notifications.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

use super::common::{run_command, write_secure_config};
use crate::error::VpnResult;

/// IKE connection name used in generated configs
pub const IPSEC_CONNECTION: &str = "home";
/// xl2tpd LAC name used in generated configs
pub const L2TP_CONNECTION: &str = "myVPN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageCommand {
    /// Start (or restart) the IKE daemon
    Restart,
    SwanctlLoad { config: PathBuf },
    UpHome { connection: String },
    DownHome { connection: String },
    /// Stop the IKE daemon
    Stop,
    L2tpLoad { config: PathBuf },
    L2tpCtl { connection: String },
    L2tpStop,
    OpenvpnRestart { config: PathBuf },
    OpenvpnStop,
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageCommand::Restart => write!(f, "restart"),
            StageCommand::SwanctlLoad { config } => write!(f, "swanctl-load {:?}", config),
            StageCommand::UpHome { connection } => write!(f, "up {}", connection),
            StageCommand::DownHome { connection } => write!(f, "down {}", connection),
            StageCommand::Stop => write!(f, "stop"),
            StageCommand::L2tpLoad { config } => write!(f, "l2tp-load {:?}", config),
            StageCommand::L2tpCtl { connection } => write!(f, "l2tp-ctl {}", connection),
            StageCommand::L2tpStop => write!(f, "l2tp-stop"),
            StageCommand::OpenvpnRestart { config } => write!(f, "openvpn-restart {:?}", config),
            StageCommand::OpenvpnStop => write!(f, "openvpn-stop"),
        }
    }
}

#[async_trait]
pub trait DaemonBridge: Send + Sync {
    /// Deliver a command; completion is reported later as a stage notification
    async fn send(&self, command: StageCommand) -> VpnResult<()>;
}

/// Drives the daemons through their command line tools
pub struct ProcessDaemonBridge {
    l2tp_control: PathBuf,
}

impl Default for ProcessDaemonBridge {
    fn default() -> Self {
        Self::new(PathBuf::from("/var/run/xl2tpd/l2tp-control"))
    }
}

impl ProcessDaemonBridge {
    pub fn new(l2tp_control: PathBuf) -> Self {
        Self { l2tp_control }
    }
}

#[async_trait]
impl DaemonBridge for ProcessDaemonBridge {
    async fn send(&self, command: StageCommand) -> VpnResult<()> {
        info!("Daemon command: {}", command);
        match command {
            StageCommand::Restart => run_command("ipsec", &["restart"]).await,
            StageCommand::SwanctlLoad { config } => {
                let file = config.to_string_lossy();
                run_command("swanctl", &["--load-all", "--file", &file]).await
            }
            StageCommand::UpHome { connection } => {
                run_command("swanctl", &["--initiate", "--child", &connection]).await
            }
            StageCommand::DownHome { connection } => {
                run_command("swanctl", &["--terminate", "--ike", &connection]).await
            }
            StageCommand::Stop => run_command("ipsec", &["stop"]).await,
            StageCommand::L2tpLoad { config } => {
                let file = config.to_string_lossy();
                let control = self.l2tp_control.to_string_lossy();
                run_command("xl2tpd", &["-c", &file, "-C", &control]).await
            }
            StageCommand::L2tpCtl { connection } => {
                let line = format!("c {}\n", connection);
                write_secure_config(&self.l2tp_control, line.as_bytes(), 0o600).await
            }
            StageCommand::L2tpStop => run_command("pkill", &["-TERM", "xl2tpd"]).await,
            StageCommand::OpenvpnRestart { config } => {
                let file = config.to_string_lossy();
                run_command("openvpn", &["--daemon", "--config", &file]).await
            }
            StageCommand::OpenvpnStop => run_command("pkill", &["-TERM", "openvpn"]).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_command_display() {
        assert_eq!(StageCommand::UpHome { connection: IPSEC_CONNECTION.into() }.to_string(), "up home");
        assert_eq!(StageCommand::L2tpStop.to_string(), "l2tp-stop");
    }

    #[tokio::test]
    async fn test_l2tp_ctl_writes_control_line() {
        let dir = TempDir::new().unwrap();
        let control = dir.path().join("l2tp-control");
        let bridge = ProcessDaemonBridge::new(control.clone());
        bridge
            .send(StageCommand::L2tpCtl { connection: L2TP_CONNECTION.into() })
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(control).unwrap(), "c myVPN\n");
    }
}
