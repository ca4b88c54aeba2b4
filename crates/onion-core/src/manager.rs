//! Connection Manager
//!
//! Owns the daemon lifecycle: launches the process, talks to it over the
//! control channel, switches bridges on a running instance and reports
//! bootstrap progress to a delegate.
//!
//! # Architecture
//!
//! ```text
//!  ConnectionManager (handle, Clone)
//!          │ Command
//!          ▼
//!  ┌──────────────── actor task ────────────────┐
//!  │ state · bridges · capability · session     │
//!  │                                            │
//!  │ DaemonLauncher   ControlChannel            │
//!  │ TransportSelector   RetryGuard             │
//!  └────────▲──────────────▲──────────▲─────────┘
//!           │ GraceElapsed │ Event    │ RetryFired / CapabilityChanged
//!      grace timer     forwarder    retry guard / probe
//! ```
//!
//! Every mutation happens on the actor task. Timers, event forwarders and
//! capability watchers only send commands back to it, tagged with the
//! session that created them; commands from a superseded session are
//! dropped.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::spawn(config.clone(), Collaborators::system(&config));
//! manager.set_bridge_configuration(BridgeSettings::new(BridgeType::Snowflake, None)).await;
//! manager.start(None, delegate.clone()).await;
//!
//! // later
//! manager.stop().await;
//! ```

use crate::bridges::{BridgeSettings, BridgeStrategy};
use crate::config::OnionConfig;
use crate::control::{Circuit, ControlChannel, ControlError, ControlEvent, ControlFactory};
use crate::control_port::TorControlFactory;
use crate::daemon::{DaemonError, DaemonLauncher, DaemonProcess, TorLauncher};
use crate::entry::{self, ConfigEntry, keys};
use crate::network::{self, CapabilityProbe, NetworkCapability};
use crate::retry::RetryGuard;
use crate::transport::{HelperError, ManagedTransport, OBFS4, SNOWFLAKE, TransportHelper, TransportSelector};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never started
    #[default]
    Idle,
    /// Daemon launched or reconfigured, waiting for bootstrap events
    Starting,
    /// Bootstrap in progress (percent)
    Bootstrapping(u8),
    /// Circuit established
    Connected,
    /// Tearing down
    Stopping,
    /// Stopped; can be started again
    Stopped,
}

impl ConnectionState {
    /// Is `next` a legal successor of this state?
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (*self, next) {
            (_, Stopping) => !matches!(self, Stopping),
            (Stopping, Stopped) => true,
            (_, Stopped) => false,
            (Stopping, _) => false,
            (_, Starting) => true,
            (Starting, Bootstrapping(_)) => true,
            (Bootstrapping(from), Bootstrapping(to)) => to >= from,
            (Starting | Bootstrapping(_), Connected) => true,
            _ => false,
        }
    }

    /// Is the daemon usable?
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Receives session notifications
///
/// Calls for one session never overlap. The manager only keeps a weak
/// reference; dropping the delegate silences it.
pub trait ConnectionDelegate: Send + Sync {
    /// Bootstrap progress, 0..=100, non-decreasing within a session
    fn progress(&self, percent: u8);

    /// A circuit is established; called once per session
    fn finished(&self);

    /// Bootstrap did not finish in time
    fn difficulties(&self);
}

/// Connection manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Authentication cookie unreadable: {0}")]
    CookieUnreadable(String),

    #[error("Control channel error: {0}")]
    Channel(#[from] ControlError),

    #[error("Resetting {key} failed: {source}")]
    ResetFailed {
        key: &'static str,
        source: ControlError,
    },

    #[error("Transport helper error: {0}")]
    Helper(#[from] HelperError),

    #[error("Launch failed: {0}")]
    Launch(#[from] DaemonError),

    #[error("Daemon not running")]
    NotConnected,

    #[error("Manager shut down")]
    Closed,
}

/// External pieces the manager drives
pub struct Collaborators {
    pub launcher: Box<dyn DaemonLauncher>,
    pub control: Box<dyn ControlFactory>,
    pub obfs4: Box<dyn TransportHelper>,
    pub snowflake: Box<dyn TransportHelper>,
}

impl Collaborators {
    /// Real daemon, TCP control port and managed-mode helpers
    pub fn system(config: &OnionConfig) -> Self {
        let transports = &config.transports;
        let state_dir = config.transport_state_dir();

        Self {
            launcher: Box::new(TorLauncher::new(
                config.daemon.binary.clone(),
                config.daemon.forward_output,
            )),
            control: Box::new(TorControlFactory::new(config.timing.control_timeout())),
            obfs4: Box::new(ManagedTransport::new(
                OBFS4,
                transports.obfs4.binary.clone(),
                transports.obfs4.arguments(),
                state_dir.clone(),
                Duration::from_millis(transports.obfs4.startup_timeout_ms),
            )),
            snowflake: Box::new(ManagedTransport::new(
                SNOWFLAKE,
                transports.snowflake.binary.clone(),
                transports.snowflake.arguments(),
                state_dir,
                Duration::from_millis(transports.snowflake.startup_timeout_ms),
            )),
        }
    }
}

enum Command {
    Start {
        arguments: Option<Vec<String>>,
        delegate: Weak<dyn ConnectionDelegate>,
        force_reconfigure: bool,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<bool>,
    },
    SetBridges {
        settings: BridgeSettings,
        done: oneshot::Sender<()>,
    },
    ReconfigurePending {
        reply: oneshot::Sender<bool>,
    },
    Circuits {
        reply: oneshot::Sender<Result<Vec<Circuit>, ManagerError>>,
    },
    CloseCircuits {
        ids: Vec<String>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    CapabilityChanged(NetworkCapability),
    GraceElapsed {
        session: u64,
    },
    Event {
        session: u64,
        event: ControlEvent,
    },
    RetryFired {
        session: u64,
    },
}

/// Handle to the connection manager
///
/// Cheap to clone. Dropping the last handle tears the session down the way
/// [`ConnectionManager::stop`] does.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawn the manager task; must be called inside a tokio runtime
    pub fn spawn(config: OnionConfig, collaborators: Collaborators) -> Self {
        config.ensure_directories();

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let selector = TransportSelector::new(
            collaborators.obfs4,
            collaborators.snowflake,
            config.builtin_bridges(),
        );

        let actor = Actor {
            bridges: config.bridges.clone(),
            arguments: config.extra_arguments.clone(),
            launcher: collaborators.launcher,
            control_factory: collaborators.control,
            selector,
            daemon: None,
            control: None,
            authenticated: false,
            retry: RetryGuard::new(),
            session: None,
            next_session: 0,
            reconfigure: false,
            capability: NetworkCapability::Unknown,
            state: state_tx,
            commands: tx.downgrade(),
            config,
        };
        tokio::spawn(actor.run(rx));

        Self {
            commands: tx,
            state: state_rx,
        }
    }

    /// Start the daemon, or apply a changed bridge configuration to the
    /// running one
    ///
    /// `arguments` replaces the stored raw daemon arguments when given.
    /// Returns once the launch or reconfiguration was issued; bootstrap is
    /// reported to `delegate`, of which only a weak reference is kept.
    pub async fn start(&self, arguments: Option<Vec<String>>, delegate: Arc<dyn ConnectionDelegate>) {
        self.send_start(arguments, delegate, false).await;
    }

    /// Reapply the bridge configuration and start
    ///
    /// Removed client authorization keys stay loaded until a full
    /// `stop()` + `start()`.
    pub async fn reload(&self, delegate: Arc<dyn ConnectionDelegate>) {
        self.send_start(None, delegate, true).await;
    }

    async fn send_start(
        &self,
        arguments: Option<Vec<String>>,
        delegate: Arc<dyn ConnectionDelegate>,
        force_reconfigure: bool,
    ) {
        let (done, wait) = oneshot::channel();
        let command = Command::Start {
            arguments,
            delegate: Arc::downgrade(&delegate),
            force_reconfigure,
            done,
        };
        if self.commands.send(command).is_ok() {
            let _ = wait.await;
        }
    }

    /// Tear everything down; always ends in [`ConnectionState::Stopped`]
    pub async fn stop(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Make the daemon re-establish its network attachment
    pub async fn reconnect(&self) -> bool {
        let (reply, wait) = oneshot::channel();
        if self.commands.send(Command::Reconnect { reply }).is_err() {
            return false;
        }
        wait.await.unwrap_or(false)
    }

    /// Store the requested bridge configuration
    ///
    /// The next `start()` reconfigures a running daemon if it differs from
    /// the previous request.
    pub async fn set_bridge_configuration(&self, settings: BridgeSettings) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::SetBridges { settings, done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Will the next `start()` reconfigure bridges?
    pub async fn reconfigure_pending(&self) -> bool {
        let (reply, wait) = oneshot::channel();
        if self.commands.send(Command::ReconfigurePending { reply }).is_err() {
            return false;
        }
        wait.await.unwrap_or(false)
    }

    /// Built circuits of the running daemon
    pub async fn circuits(&self) -> Result<Vec<Circuit>, ManagerError> {
        let (reply, wait) = oneshot::channel();
        self.commands
            .send(Command::Circuits { reply })
            .map_err(|_| ManagerError::Closed)?;
        wait.await.map_err(|_| ManagerError::Closed)?
    }

    /// Close circuits by id
    pub async fn close_circuits(&self, ids: Vec<String>) -> Result<(), ManagerError> {
        let (reply, wait) = oneshot::channel();
        self.commands
            .send(Command::CloseCircuits { ids, reply })
            .map_err(|_| ManagerError::Closed)?;
        wait.await.map_err(|_| ManagerError::Closed)?
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Feed capability transitions from `probe` into the manager
    pub fn watch_capability(&self, probe: &dyn CapabilityProbe) {
        let mut changes = probe.subscribe();
        let commands = self.commands.downgrade();

        tokio::spawn(async move {
            loop {
                let capability = *changes.borrow_and_update();
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::CapabilityChanged(capability)).is_err() {
                    break;
                }
                drop(tx);

                if changes.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Observers and timers belonging to one `start()`
struct Session {
    id: u64,
    delegate: Weak<dyn ConnectionDelegate>,
    grace: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    watch_circuit: bool,
    watch_progress: bool,
    progress: Option<u8>,
}

impl Session {
    fn delegate(&self) -> Option<Arc<dyn ConnectionDelegate>> {
        self.delegate.upgrade()
    }

    /// Stop forwarding events once no observer is left
    fn expire_observers(&mut self) {
        if !self.watch_circuit && !self.watch_progress {
            if let Some(forwarder) = self.forwarder.take() {
                forwarder.abort();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

struct Actor {
    config: OnionConfig,
    launcher: Box<dyn DaemonLauncher>,
    control_factory: Box<dyn ControlFactory>,
    selector: TransportSelector,
    daemon: Option<Box<dyn DaemonProcess>>,
    control: Option<Box<dyn ControlChannel>>,
    authenticated: bool,
    retry: RetryGuard,
    session: Option<Session>,
    next_session: u64,
    bridges: BridgeSettings,
    reconfigure: bool,
    capability: NetworkCapability,
    arguments: Vec<String>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }

        debug!("All manager handles dropped");
        self.shutdown().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                arguments,
                delegate,
                force_reconfigure,
                done,
            } => {
                self.start(arguments, delegate, force_reconfigure).await;
                let _ = done.send(());
            }
            Command::Stop { done } => {
                self.shutdown().await;
                let _ = done.send(());
            }
            Command::Reconnect { reply } => {
                let result = self.reconnect().await;
                if let Err(e) = &result {
                    warn!("Reconnect failed: {}", e);
                }
                let _ = reply.send(result.is_ok());
            }
            Command::SetBridges { settings, done } => {
                self.set_bridges(settings);
                let _ = done.send(());
            }
            Command::ReconfigurePending { reply } => {
                let _ = reply.send(self.reconfigure);
            }
            Command::Circuits { reply } => {
                let _ = reply.send(self.circuits().await);
            }
            Command::CloseCircuits { ids, reply } => {
                let result = match self.control().await {
                    Ok(control) => control.close_circuits(&ids).await.map_err(ManagerError::from),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::CapabilityChanged(capability) => self.capability_changed(capability).await,
            Command::GraceElapsed { session } => self.grace_elapsed(session).await,
            Command::Event { session, event } => self.event(session, event),
            Command::RetryFired { session } => self.retry_fired(session).await,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current != next && current.can_transition_to(next) {
                debug!("State {:?} -> {:?}", current, next);
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn is_current(&self, session: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session)
    }

    fn daemon_running(&mut self) -> bool {
        self.daemon.as_mut().is_some_and(|d| d.is_running())
    }

    async fn start(
        &mut self,
        arguments: Option<Vec<String>>,
        delegate: Weak<dyn ConnectionDelegate>,
        force_reconfigure: bool,
    ) {
        if let Some(arguments) = arguments {
            self.arguments = arguments;
        }
        if force_reconfigure {
            self.reconfigure = true;
        }

        self.retry.cancel();
        let reached = self.session.take().and_then(|s| s.progress);
        self.set_state(ConnectionState::Starting);

        let strategy = self.bridges.strategy();
        let mut floor = None;

        if !self.daemon_running() {
            self.reconfigure = false;
            self.release_control().await;
            self.daemon = None;

            if let Err(e) = self.launch(&strategy).await {
                error!("Daemon launch failed: {}", e);
            }
        } else if self.reconfigure {
            self.reconfigure = false;
            info!("Applying bridge configuration: {:?}", self.bridges.bridge_type);

            if let Err(e) = self.apply_bridges(&strategy).await {
                warn!("Bridge reconfiguration aborted: {}", e);
            }
        } else {
            debug!("Daemon already running, nothing to reconfigure");
            // Same bootstrap run, so progress must not go backwards
            floor = reached;
        }

        self.begin_session(delegate, floor);
    }

    async fn launch(&mut self, strategy: &BridgeStrategy) -> Result<(), ManagerError> {
        let transport = self.selector.select(strategy).await?;
        let ip = network::ip_entries(self.capability, strategy);

        let mut arguments = vec!["--ignore-missing-torrc".to_string()];
        arguments.extend(entry::to_arguments(&self.config.base_entries()));
        arguments.extend(self.arguments.iter().cloned());
        arguments.extend(entry::to_arguments(&transport));
        arguments.extend(entry::to_arguments(&ip));

        debug!("Daemon arguments: {:?}", arguments);

        self.daemon = Some(self.launcher.launch(arguments)?);
        Ok(())
    }

    /// Reset the bridge options one at a time, then set the new ones
    ///
    /// Stops at the first failure; earlier steps are not undone. Helpers
    /// are only switched once every reset has succeeded, so a failed reset
    /// leaves the running helper alone.
    async fn apply_bridges(&mut self, strategy: &BridgeStrategy) -> Result<(), ManagerError> {
        {
            let control = self.control().await?;
            for key in [keys::USE_BRIDGES, keys::CLIENT_TRANSPORT_PLUGIN, keys::BRIDGE] {
                control
                    .reset_conf(key)
                    .await
                    .map_err(|source| ManagerError::ResetFailed { key, source })?;
            }
        }

        let entries = self.selector.select(strategy).await?;
        self.control().await?.set_confs(&entries).await?;
        Ok(())
    }

    fn begin_session(&mut self, delegate: Weak<dyn ConnectionDelegate>, progress: Option<u8>) {
        self.next_session += 1;
        let id = self.next_session;

        let commands = self.commands.clone();
        let delay = self.config.timing.grace_delay();
        let grace = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::GraceElapsed { session: id });
            }
        });

        let commands = self.commands.clone();
        self.retry.arm(self.config.timing.retry_delay(), async move {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::RetryFired { session: id });
            }
        });

        self.session = Some(Session {
            id,
            delegate,
            grace: Some(grace),
            forwarder: None,
            watch_circuit: false,
            watch_progress: false,
            progress,
        });
    }

    /// Control channel to the running daemon, connected and authenticated
    async fn control(&mut self) -> Result<&mut Box<dyn ControlChannel>, ManagerError> {
        if self.daemon.is_none() {
            return Err(ManagerError::NotConnected);
        }

        if self.control.is_none() {
            let port_file = self.config.control_port_file();
            self.control = Some(self.control_factory.create(&port_file));
        }
        let Some(control) = self.control.as_mut() else {
            return Err(ManagerError::NotConnected);
        };

        if !control.is_connected() {
            self.authenticated = false;
            control.connect().await?;
        }

        if !self.authenticated {
            let cookie_file = self.config.cookie_file();
            let cookie = tokio::fs::read(&cookie_file).await.map_err(|e| {
                ManagerError::CookieUnreadable(format!("{}: {}", cookie_file.display(), e))
            })?;

            control.authenticate(&cookie).await?;
            self.authenticated = true;
            debug!("Control channel authenticated");
        }

        Ok(control)
    }

    async fn release_control(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.disconnect().await;
        }
        self.authenticated = false;
    }

    async fn grace_elapsed(&mut self, session: u64) {
        if !self.is_current(session) {
            return;
        }

        if let Err(e) = self.observe(session).await {
            warn!("Control channel not ready: {}", e);
        }
    }

    /// Subscribe the session's circuit and bootstrap observers
    async fn observe(&mut self, session: u64) -> Result<(), ManagerError> {
        let mut events = self.control().await?.subscribe_events().await?;

        let commands = self.commands.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(tx) = commands.upgrade() else {
                            break;
                        };
                        if tx.send(Command::Event { session, event }).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Dropped {} control events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(current) = self.session.as_mut() {
            if let Some(old) = current.forwarder.replace(forwarder) {
                old.abort();
            }
            current.watch_circuit = true;
            current.watch_progress = true;
        }

        // An already bootstrapped daemon sends no further events
        match self.control().await?.circuit_established().await {
            Ok(true) => self.circuit_established(),
            Ok(false) => {}
            Err(e) => debug!("Circuit status query failed: {}", e),
        }

        Ok(())
    }

    fn event(&mut self, session: u64, event: ControlEvent) {
        if !self.is_current(session) {
            return;
        }

        match event {
            ControlEvent::CircuitEstablished(true) => self.circuit_established(),
            ControlEvent::CircuitEstablished(false) => {}
            ControlEvent::Status(status) => {
                if let Some(progress) = status.bootstrap_progress() {
                    self.bootstrap_progress(progress);
                }
            }
        }
    }

    fn bootstrap_progress(&mut self, progress: u8) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.watch_progress || session.progress.is_some_and(|last| progress < last) {
            return;
        }

        session.progress = Some(progress);
        if progress >= 100 {
            session.watch_progress = false;
            session.expire_observers();
        }
        let delegate = session.delegate();

        if matches!(
            *self.state.borrow(),
            ConnectionState::Starting | ConnectionState::Bootstrapping(_)
        ) {
            self.set_state(ConnectionState::Bootstrapping(progress));
        }

        if let Some(delegate) = delegate {
            delegate.progress(progress);
        }
    }

    fn circuit_established(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.watch_circuit {
            return;
        }

        session.watch_circuit = false;
        session.watch_progress = false;
        session.expire_observers();
        let delegate = session.delegate();

        self.retry.cancel();
        self.set_state(ConnectionState::Connected);
        info!("Circuit established");

        if let Some(delegate) = delegate {
            delegate.finished();
        }
    }

    async fn retry_fired(&mut self, session: u64) {
        if !self.is_current(session) {
            return;
        }

        warn!("Bootstrap did not finish in time");

        // Toggling the network would tear down a working bridge client
        if self.bridges.strategy() == BridgeStrategy::None {
            if let Err(e) = self.toggle_network().await {
                warn!("Network toggle failed: {}", e);
            }
        }

        if let Some(delegate) = self.session.as_ref().and_then(Session::delegate) {
            delegate.difficulties();
        }
    }

    async fn toggle_network(&mut self) -> Result<(), ManagerError> {
        let control = self.control().await?;
        control.set_conf(&ConfigEntry::new(keys::DISABLE_NETWORK, "1")).await?;
        control.set_conf(&ConfigEntry::new(keys::DISABLE_NETWORK, "0")).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), ManagerError> {
        self.control().await?.reset_connection().await?;
        Ok(())
    }

    fn set_bridges(&mut self, settings: BridgeSettings) {
        self.reconfigure = self.bridges.differs_from(&settings);
        debug!(
            "Bridge configuration {:?} (reconfigure: {})",
            settings.bridge_type, self.reconfigure
        );
        self.bridges = settings;
    }

    async fn circuits(&mut self) -> Result<Vec<Circuit>, ManagerError> {
        let circuits = self.control().await?.circuits().await?;
        Ok(circuits.into_iter().filter(Circuit::is_built).collect())
    }

    async fn capability_changed(&mut self, capability: NetworkCapability) {
        if capability == self.capability {
            return;
        }

        info!("Network capability changed: {:?} -> {:?}", self.capability, capability);
        self.capability = capability;

        if !self.daemon_running() {
            return;
        }

        let entries = network::ip_entries(capability, &self.bridges.strategy());
        let result = async {
            let control = self.control().await?;
            control.set_confs(&entries).await?;
            control.reset_connection().await?;
            Ok::<_, ManagerError>(())
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to apply IP preferences: {}", e);
        }
    }

    /// Observers first, then channel, process, helpers and the retry timer
    async fn shutdown(&mut self) {
        self.set_state(ConnectionState::Stopping);
        self.session = None;

        self.release_control().await;
        if let Some(mut daemon) = self.daemon.take() {
            info!("Stopping daemon");
            daemon.cancel();
        }
        self.selector.stop_all();
        self.retry.cancel();

        self.set_state(ConnectionState::Stopped);
    }
}
