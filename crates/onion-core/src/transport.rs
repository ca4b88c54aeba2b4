//! Transport Selection
//!
//! Maps a [`BridgeStrategy`] to the daemon options it needs and keeps the
//! matching pluggable-transport helper running.
//!
//! # Helpers
//!
//! ```text
//! BuiltInObfs4 / CustomObfs4 ─▶ obfs4 helper     (snowflake stopped)
//! Snowflake                  ─▶ snowflake helper (obfs4 stopped)
//! None                       ─▶ both stopped
//! ```
//!
//! At most one helper runs at a time. Helpers are started in managed mode
//! and report their SOCKS port on stdout (`CMETHOD <name> socks5 <addr>`).

use crate::bridges::{BridgeStrategy, SNOWFLAKE_BRIDGE_LINE};
use crate::entry::{ConfigEntry, keys};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// obfs4 transport name
pub const OBFS4: &str = "obfs4";

/// Snowflake transport name
pub const SNOWFLAKE: &str = "snowflake";

/// Transport helper errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum HelperError {
    #[error("Failed to spawn {transport} helper: {reason}")]
    SpawnFailed { transport: String, reason: String },

    #[error("{transport} helper reported an error: {message}")]
    MethodError { transport: String, message: String },

    #[error("{transport} helper did not report a port in time")]
    Timeout { transport: String },

    #[error("{transport} helper exited before reporting a port")]
    Exited { transport: String },
}

/// A pluggable-transport helper process
#[async_trait]
pub trait TransportHelper: Send {
    /// Transport name (`obfs4`, `snowflake`)
    fn transport(&self) -> &str;

    /// Is the helper running?
    fn is_running(&self) -> bool;

    /// Start the helper if needed and return its local SOCKS port
    async fn start(&mut self) -> Result<u16, HelperError>;

    /// Stop the helper; no-op if not running
    fn stop(&mut self);
}

/// Line printed by a managed-mode helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtMessage {
    Version(String),
    VersionError(String),
    Method { transport: String, addr: SocketAddr },
    MethodError { transport: String, message: String },
    MethodsDone,
    Log(String),
    Other(String),
}

/// Parse one stdout line of a managed-mode helper
pub fn parse_pt_line(line: &str) -> PtMessage {
    let line = line.trim();
    let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));

    match keyword {
        "VERSION" => PtMessage::Version(rest.to_string()),
        "VERSION-ERROR" => PtMessage::VersionError(rest.to_string()),
        "CMETHODS" if rest == "DONE" => PtMessage::MethodsDone,
        "CMETHOD" => {
            let mut parts = rest.split_whitespace();
            let transport = parts.next().unwrap_or_default().to_string();
            let _protocol = parts.next();
            match parts.next().and_then(|a| a.parse().ok()) {
                Some(addr) => PtMessage::Method { transport, addr },
                None => PtMessage::Other(line.to_string()),
            }
        }
        "CMETHOD-ERROR" => {
            let (transport, message) = rest.split_once(' ').unwrap_or((rest, ""));
            PtMessage::MethodError {
                transport: transport.to_string(),
                message: message.to_string(),
            }
        }
        "LOG" => PtMessage::Log(rest.to_string()),
        _ => PtMessage::Other(line.to_string()),
    }
}

/// Helper binary run in managed mode
pub struct ManagedTransport {
    transport: String,
    binary: PathBuf,
    arguments: Vec<String>,
    state_dir: PathBuf,
    startup_timeout: Duration,
    child: Option<Child>,
    port: Option<u16>,
    output: Option<JoinHandle<()>>,
}

impl ManagedTransport {
    /// Create a helper for `transport` backed by `binary`
    pub fn new(
        transport: impl Into<String>,
        binary: impl Into<PathBuf>,
        arguments: Vec<String>,
        state_dir: impl Into<PathBuf>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            transport: transport.into(),
            binary: binary.into(),
            arguments,
            state_dir: state_dir.into(),
            startup_timeout,
            child: None,
            port: None,
            output: None,
        }
    }

    async fn wait_for_port(
        transport: &str,
        lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    ) -> Result<u16, HelperError> {
        let mut port = None;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => {
                    return Err(HelperError::Exited {
                        transport: transport.to_string(),
                    });
                }
            };

            match parse_pt_line(&line) {
                PtMessage::Method { transport: name, addr } if name == transport => {
                    port = Some(addr.port());
                }
                PtMessage::MethodError { message, .. } => {
                    return Err(HelperError::MethodError {
                        transport: transport.to_string(),
                        message,
                    });
                }
                PtMessage::VersionError(message) => {
                    return Err(HelperError::MethodError {
                        transport: transport.to_string(),
                        message,
                    });
                }
                PtMessage::MethodsDone => {
                    return port.ok_or_else(|| HelperError::MethodError {
                        transport: transport.to_string(),
                        message: "no CMETHOD reported".to_string(),
                    });
                }
                other => debug!(target: "pt", "{}: {:?}", transport, other),
            }
        }
    }
}

#[async_trait]
impl TransportHelper for ManagedTransport {
    fn transport(&self) -> &str {
        &self.transport
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }

    async fn start(&mut self) -> Result<u16, HelperError> {
        if let (Some(_), Some(port)) = (&self.child, self.port) {
            return Ok(port);
        }

        info!("Starting {} helper", self.transport);

        let mut child = Command::new(&self.binary)
            .args(&self.arguments)
            .env("TOR_PT_MANAGED_TRANSPORT_VER", "1")
            .env("TOR_PT_CLIENT_TRANSPORTS", &self.transport)
            .env("TOR_PT_STATE_LOCATION", &self.state_dir)
            .env("TOR_PT_EXIT_ON_STDIN_CLOSE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HelperError::SpawnFailed {
                transport: self.transport.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| HelperError::Exited {
            transport: self.transport.clone(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let port = match tokio::time::timeout(
            self.startup_timeout,
            Self::wait_for_port(&self.transport, &mut lines),
        )
        .await
        {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(e);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(HelperError::Timeout {
                    transport: self.transport.clone(),
                });
            }
        };

        let transport = self.transport.clone();
        self.output = Some(tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "pt", "{}: {}", transport, line);
            }
        }));

        info!("{} helper listening on port {}", self.transport, port);
        self.child = Some(child);
        self.port = Some(port);
        Ok(port)
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping {} helper", self.transport);
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop {} helper: {}", self.transport, e);
            }
        }
        if let Some(output) = self.output.take() {
            output.abort();
        }
        self.port = None;
    }
}

impl Drop for ManagedTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Chooses and drives transport helpers for a bridge strategy
pub struct TransportSelector {
    obfs4: Box<dyn TransportHelper>,
    snowflake: Box<dyn TransportHelper>,
    builtin_bridges: Vec<String>,
}

impl TransportSelector {
    /// Create a selector over the two helpers
    pub fn new(
        obfs4: Box<dyn TransportHelper>,
        snowflake: Box<dyn TransportHelper>,
        builtin_bridges: Vec<String>,
    ) -> Self {
        Self {
            obfs4,
            snowflake,
            builtin_bridges,
        }
    }

    /// Built-in obfs4 bridge lines
    pub fn builtin_bridges(&self) -> &[String] {
        &self.builtin_bridges
    }

    /// Options for `strategy`, starting and stopping helpers as a side effect
    ///
    /// The competing helper is always stopped before the selected one starts.
    pub async fn select(
        &mut self,
        strategy: &BridgeStrategy,
    ) -> Result<Vec<ConfigEntry>, HelperError> {
        let mut entries = Vec::new();

        match strategy {
            BridgeStrategy::BuiltInObfs4 | BridgeStrategy::CustomObfs4(_) => {
                self.snowflake.stop();
                let port = self.obfs4.start().await?;

                entries.push(plugin_entry(OBFS4, port));

                let bridges = match strategy {
                    BridgeStrategy::CustomObfs4(lines) => lines,
                    _ => &self.builtin_bridges,
                };
                entries.extend(bridges.iter().map(|line| ConfigEntry::new(keys::BRIDGE, line)));

                entries.push(ConfigEntry::new(keys::USE_BRIDGES, "1"));
            }
            BridgeStrategy::Snowflake => {
                self.obfs4.stop();
                let port = self.snowflake.start().await?;

                entries.push(plugin_entry(SNOWFLAKE, port));
                entries.push(ConfigEntry::new(keys::BRIDGE, SNOWFLAKE_BRIDGE_LINE));
                entries.push(ConfigEntry::new(keys::USE_BRIDGES, "1"));
            }
            BridgeStrategy::None => {
                self.stop_all();
                entries.push(ConfigEntry::new(keys::USE_BRIDGES, "0"));
            }
        }

        Ok(entries)
    }

    /// Stop both helpers
    pub fn stop_all(&mut self) {
        self.obfs4.stop();
        self.snowflake.stop();
    }
}

fn plugin_entry(transport: &str, port: u16) -> ConfigEntry {
    ConfigEntry::new(
        keys::CLIENT_TRANSPORT_PLUGIN,
        format!("{transport} socks5 127.0.0.1:{port}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHelper;

    fn selector() -> (TransportSelector, MockHelper, MockHelper) {
        let obfs4 = MockHelper::new(OBFS4, 47351);
        let snowflake = MockHelper::new(SNOWFLAKE, 52610);
        let selector = TransportSelector::new(
            Box::new(obfs4.clone()),
            Box::new(snowflake.clone()),
            vec!["obfs4 1.1.1.1:443 AA cert=a iat-mode=0".into(), "obfs4 2.2.2.2:443 BB cert=b iat-mode=0".into()],
        );
        (selector, obfs4, snowflake)
    }

    #[tokio::test]
    async fn test_none() {
        let (mut selector, obfs4, snowflake) = selector();
        obfs4.set_running(true);
        snowflake.set_running(true);

        let entries = selector.select(&BridgeStrategy::None).await.unwrap();

        assert_eq!(entries, vec![ConfigEntry::new(keys::USE_BRIDGES, "0")]);
        assert!(!obfs4.is_running());
        assert!(!snowflake.is_running());
    }

    #[tokio::test]
    async fn test_builtin_obfs4() {
        let (mut selector, obfs4, snowflake) = selector();
        snowflake.set_running(true);

        let entries = selector.select(&BridgeStrategy::BuiltInObfs4).await.unwrap();

        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            ConfigEntry::new(keys::CLIENT_TRANSPORT_PLUGIN, "obfs4 socks5 127.0.0.1:47351")
        );
        assert_eq!(entries[1].value(), "obfs4 1.1.1.1:443 AA cert=a iat-mode=0");
        assert_eq!(entries[2].value(), "obfs4 2.2.2.2:443 BB cert=b iat-mode=0");
        assert_eq!(entries[3], ConfigEntry::new(keys::USE_BRIDGES, "1"));
        assert!(obfs4.is_running());
        assert!(!snowflake.is_running());
    }

    #[tokio::test]
    async fn test_custom_obfs4() {
        let (mut selector, _, _) = selector();
        let custom = vec!["obfs4 9.9.9.9:9001 CC cert=c iat-mode=2".to_string()];

        let entries = selector
            .select(&BridgeStrategy::CustomObfs4(custom.clone()))
            .await
            .unwrap();

        let bridges: Vec<_> = entries
            .iter()
            .filter(|e| e.key() == keys::BRIDGE)
            .map(|e| e.value().to_string())
            .collect();
        assert_eq!(bridges, custom);
    }

    #[tokio::test]
    async fn test_snowflake() {
        let (mut selector, obfs4, snowflake) = selector();
        obfs4.set_running(true);

        let entries = selector.select(&BridgeStrategy::Snowflake).await.unwrap();

        assert_eq!(
            entries[0],
            ConfigEntry::new(keys::CLIENT_TRANSPORT_PLUGIN, "snowflake socks5 127.0.0.1:52610")
        );
        let bridges: Vec<_> = entries.iter().filter(|e| e.key() == keys::BRIDGE).collect();
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].value(), SNOWFLAKE_BRIDGE_LINE);
        let use_bridges: Vec<_> = entries.iter().filter(|e| e.key() == keys::USE_BRIDGES).collect();
        assert_eq!(use_bridges.len(), 1);
        assert_eq!(use_bridges[0].value(), "1");

        assert!(!obfs4.is_running());
        assert!(snowflake.is_running());
    }

    #[tokio::test]
    async fn test_helper_failure() {
        let (mut selector, obfs4, _) = selector();
        obfs4.fail_start(true);

        let result = selector.select(&BridgeStrategy::BuiltInObfs4).await;
        assert!(matches!(result, Err(HelperError::SpawnFailed { .. })));
    }

    #[test]
    fn test_parse_pt_lines() {
        assert_eq!(parse_pt_line("VERSION 1"), PtMessage::Version("1".into()));
        assert_eq!(
            parse_pt_line("CMETHOD obfs4 socks5 127.0.0.1:46281"),
            PtMessage::Method {
                transport: "obfs4".into(),
                addr: "127.0.0.1:46281".parse().unwrap(),
            }
        );
        assert_eq!(
            parse_pt_line("CMETHOD-ERROR snowflake no broker"),
            PtMessage::MethodError {
                transport: "snowflake".into(),
                message: "no broker".into(),
            }
        );
        assert_eq!(parse_pt_line("CMETHODS DONE"), PtMessage::MethodsDone);
        assert_eq!(parse_pt_line("LOG SEVERITY=notice"), PtMessage::Log("SEVERITY=notice".into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_managed_transport_reports_port() {
        let script = "echo 'VERSION 1'; echo \"CMETHOD $TOR_PT_CLIENT_TRANSPORTS socks5 127.0.0.1:40404\"; echo 'CMETHODS DONE'; sleep 30";
        let dir = tempfile::tempdir().unwrap();
        let mut helper = ManagedTransport::new(
            OBFS4,
            "sh",
            vec!["-c".into(), script.into()],
            dir.path(),
            Duration::from_secs(5),
        );

        assert_eq!(helper.start().await.unwrap(), 40404);
        assert!(helper.is_running());
        assert_eq!(helper.start().await.unwrap(), 40404);

        helper.stop();
        assert!(!helper.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_managed_transport_method_error() {
        let script = "echo 'VERSION 1'; echo 'CMETHOD-ERROR obfs4 bad config'; sleep 30";
        let dir = tempfile::tempdir().unwrap();
        let mut helper = ManagedTransport::new(
            OBFS4,
            "sh",
            vec!["-c".into(), script.into()],
            dir.path(),
            Duration::from_secs(5),
        );

        let err = helper.start().await.unwrap_err();
        assert!(matches!(err, HelperError::MethodError { .. }));
        assert!(!helper.is_running());
    }
}
