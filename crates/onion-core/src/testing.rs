//! In-memory collaborators for unit tests

use crate::control::{Circuit, ControlChannel, ControlError, ControlEvent, ControlFactory};
use crate::daemon::{DaemonError, DaemonLauncher, DaemonProcess};
use crate::entry::ConfigEntry;
use crate::manager::ConnectionDelegate;
use crate::transport::{HelperError, TransportHelper};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Default)]
struct ControlLog {
    calls: Vec<String>,
    applied: Vec<Vec<ConfigEntry>>,
    failing_keys: HashSet<String>,
    connected: bool,
    refuse_connect: bool,
    cookie: Option<Vec<u8>>,
    established: bool,
    circuits: Vec<Circuit>,
}

/// Control channel recording every call in a shared log
#[derive(Clone)]
pub struct MockControl {
    log: Arc<Mutex<ControlLog>>,
    events: broadcast::Sender<ControlEvent>,
}

impl MockControl {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            log: Arc::new(Mutex::new(ControlLog::default())),
            events,
        }
    }

    /// Calls made so far, e.g. `reset_conf UseBridges`
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.log.lock().unwrap().calls.clear();
    }

    /// Entry lists passed to `set_confs`
    pub fn applied(&self) -> Vec<Vec<ConfigEntry>> {
        self.log.lock().unwrap().applied.clone()
    }

    /// Reject `set_conf`/`reset_conf` for `key`
    pub fn fail_on(&self, key: &str) {
        self.log.lock().unwrap().failing_keys.insert(key.to_string());
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.log.lock().unwrap().refuse_connect = refuse;
    }

    pub fn set_established(&self, established: bool) {
        self.log.lock().unwrap().established = established;
    }

    pub fn set_circuits(&self, circuits: Vec<Circuit>) {
        self.log.lock().unwrap().circuits = circuits;
    }

    pub fn cookie(&self) -> Option<Vec<u8>> {
        self.log.lock().unwrap().cookie.clone()
    }

    /// Deliver an event to subscribers
    pub fn emit(&self, event: ControlEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_progress(&self, progress: u8) {
        let line = format!(
            "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS={progress} TAG=x SUMMARY=\"x\""
        );
        if let Some(event) = crate::control_port::parse_event(&line) {
            self.emit(event);
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().unwrap().calls.push(call.into());
    }

    fn check_key(&self, key: &str) -> Result<(), ControlError> {
        if self.log.lock().unwrap().failing_keys.contains(key) {
            return Err(ControlError::Rejected {
                status: 552,
                message: format!("Unrecognized option \"{key}\""),
            });
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<(), ControlError> {
        if self.log.lock().unwrap().connected {
            Ok(())
        } else {
            Err(ControlError::NotConnected)
        }
    }
}

#[async_trait]
impl ControlChannel for MockControl {
    fn is_connected(&self) -> bool {
        self.log.lock().unwrap().connected
    }

    async fn connect(&mut self) -> Result<(), ControlError> {
        self.record("connect");
        let mut log = self.log.lock().unwrap();
        if log.refuse_connect {
            return Err(ControlError::ConnectionFailed("refused".into()));
        }
        log.connected = true;
        Ok(())
    }

    async fn authenticate(&mut self, cookie: &[u8]) -> Result<(), ControlError> {
        self.record("authenticate");
        self.check_connected()?;
        self.log.lock().unwrap().cookie = Some(cookie.to_vec());
        Ok(())
    }

    async fn subscribe_events(&mut self) -> Result<broadcast::Receiver<ControlEvent>, ControlError> {
        self.record("subscribe");
        self.check_connected()?;
        Ok(self.events.subscribe())
    }

    async fn set_conf(&mut self, entry: &ConfigEntry) -> Result<(), ControlError> {
        self.record(format!("set_conf {}={}", entry.key(), entry.value()));
        self.check_connected()?;
        self.check_key(entry.key())
    }

    async fn set_confs(&mut self, entries: &[ConfigEntry]) -> Result<(), ControlError> {
        self.record("set_confs");
        self.check_connected()?;
        for entry in entries {
            self.check_key(entry.key())?;
        }
        self.log.lock().unwrap().applied.push(entries.to_vec());
        Ok(())
    }

    async fn reset_conf(&mut self, key: &str) -> Result<(), ControlError> {
        self.record(format!("reset_conf {key}"));
        self.check_connected()?;
        self.check_key(key)
    }

    async fn reset_connection(&mut self) -> Result<(), ControlError> {
        self.record("reset_connection");
        self.check_connected()
    }

    async fn circuit_established(&mut self) -> Result<bool, ControlError> {
        self.record("circuit_established");
        self.check_connected()?;
        Ok(self.log.lock().unwrap().established)
    }

    async fn circuits(&mut self) -> Result<Vec<Circuit>, ControlError> {
        self.record("circuits");
        self.check_connected()?;
        Ok(self.log.lock().unwrap().circuits.clone())
    }

    async fn close_circuits(&mut self, ids: &[String]) -> Result<(), ControlError> {
        self.record(format!("close_circuits {}", ids.join(",")));
        self.check_connected()
    }

    async fn disconnect(&mut self) {
        self.record("disconnect");
        self.log.lock().unwrap().connected = false;
    }
}

/// Factory handing out clones of one [`MockControl`]
pub struct MockFactory {
    control: MockControl,
}

impl MockFactory {
    pub fn new(control: &MockControl) -> Self {
        Self {
            control: control.clone(),
        }
    }
}

impl ControlFactory for MockFactory {
    fn create(&self, _port_file: &Path) -> Box<dyn ControlChannel> {
        Box::new(self.control.clone())
    }
}

/// Launcher recording argument lists; processes share one running flag
#[derive(Clone, Default)]
pub struct MockLauncher {
    launches: Arc<Mutex<Vec<Vec<String>>>>,
    running: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<Vec<String>> {
        self.launches.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Simulate the daemon exiting on its own
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DaemonLauncher for MockLauncher {
    fn launch(&mut self, arguments: Vec<String>) -> Result<Box<dyn DaemonProcess>, DaemonError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DaemonError::SpawnFailed {
                binary: "tor".into(),
                reason: "not found".into(),
            });
        }

        self.launches.lock().unwrap().push(arguments);
        self.running.store(true, Ordering::SeqCst);
        Ok(Box::new(MockProcess {
            running: self.running.clone(),
        }))
    }
}

struct MockProcess {
    running: Arc<AtomicBool>,
}

impl DaemonProcess for MockProcess {
    fn is_running(&mut self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn cancel(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct HelperState {
    running: bool,
    fail: bool,
    starts: u32,
}

/// Transport helper answering with a fixed port
#[derive(Clone)]
pub struct MockHelper {
    transport: String,
    port: u16,
    state: Arc<Mutex<HelperState>>,
}

impl MockHelper {
    pub fn new(transport: &str, port: u16) -> Self {
        Self {
            transport: transport.to_string(),
            port,
            state: Arc::new(Mutex::new(HelperState::default())),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn starts(&self) -> u32 {
        self.state.lock().unwrap().starts
    }
}

#[async_trait]
impl TransportHelper for MockHelper {
    fn transport(&self) -> &str {
        &self.transport
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    async fn start(&mut self) -> Result<u16, HelperError> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(HelperError::SpawnFailed {
                transport: self.transport.clone(),
                reason: "not found".into(),
            });
        }
        if !state.running {
            state.starts += 1;
            state.running = true;
        }
        Ok(self.port)
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().running = false;
    }
}

/// Delegate notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Progress(u8),
    Finished,
    Difficulties,
}

/// Delegate recording every notification in order
#[derive(Default)]
pub struct RecordingDelegate {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count(&self, kind: Notification) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| **n == kind)
            .count()
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                Notification::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }
}

impl ConnectionDelegate for RecordingDelegate {
    fn progress(&self, percent: u8) {
        self.notifications.lock().unwrap().push(Notification::Progress(percent));
    }

    fn finished(&self) {
        self.notifications.lock().unwrap().push(Notification::Finished);
    }

    fn difficulties(&self) {
        self.notifications.lock().unwrap().push(Notification::Difficulties);
    }
}
