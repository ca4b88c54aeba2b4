//! Control Port Client
//!
//! [`ControlChannel`] over the daemon's TCP control port.
//!
//! # Protocol
//!
//! ```text
//! C: AUTHENTICATE 3f1a...                 S: 250 OK
//! C: SETEVENTS STATUS_CLIENT              S: 250 OK
//! C: GETINFO circuit-status               S: 250+circuit-status=
//!                                         S: 4 BUILT $AB~relay,$CD~relay PURPOSE=GENERAL
//!                                         S: .
//!                                         S: 250 OK
//!                                         S: 650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=85 ...
//! ```
//!
//! Replies arrive in command order. `650` lines are asynchronous events and
//! may be interleaved anywhere; a reader task splits them off.

use crate::control::{
    Circuit, ControlChannel, ControlError, ControlEvent, ControlFactory, STATUS_CLIENT,
    StatusEvent,
};
use crate::entry::{ConfigEntry, keys};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status code of asynchronous events
const EVENT_STATUS: u16 = 650;

/// Status code of a successful reply
const OK_STATUS: u16 = 250;

/// Event buffer per subscriber
const EVENT_CAPACITY: usize = 64;

/// Default bound on connecting and on each command round-trip
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of a reply, with its data block if it was a `+` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    pub text: String,
    pub data: Vec<String>,
}

/// Complete reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status of the final line
    pub status: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    fn message(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Read one reply; `None` on a clean EOF between replies
pub async fn read_reply<R>(reader: &mut R) -> Result<Option<Reply>, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let Some(line) = read_line(reader).await? else {
            return if lines.is_empty() {
                Ok(None)
            } else {
                Err(ControlError::Closed)
            };
        };

        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(ControlError::Protocol(format!("malformed reply line: {line}")));
        }

        let status = line[..3]
            .parse::<u16>()
            .map_err(|_| ControlError::Protocol(format!("bad status code: {line}")))?;
        let text = line[4..].to_string();

        match line.as_bytes()[3] {
            b' ' => {
                lines.push(ReplyLine { status, text, data: Vec::new() });
                return Ok(Some(Reply { status, lines }));
            }
            b'-' => lines.push(ReplyLine { status, text, data: Vec::new() }),
            b'+' => {
                let data = read_data(reader).await?;
                lines.push(ReplyLine { status, text, data });
            }
            _ => return Err(ControlError::Protocol(format!("bad separator: {line}"))),
        }
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = String::new();
    if reader.read_line(&mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(buf.trim_end_matches(['\r', '\n']).to_string()))
}

/// Data block of a `+` line, up to the terminating `.`
async fn read_data<R>(reader: &mut R) -> Result<Vec<String>, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = Vec::new();
    loop {
        let line = read_line(reader).await?.ok_or(ControlError::Closed)?;
        if line == "." {
            return Ok(data);
        }
        match line.strip_prefix("..") {
            Some(rest) => data.push(format!(".{rest}")),
            None => data.push(line),
        }
    }
}

/// Parse the `PORT=host:port` line the daemon writes to its control port file
pub fn parse_port_file(content: &str) -> Result<SocketAddr, ControlError> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .ok_or_else(|| ControlError::PortFile("no PORT= line".to_string()))?
        .parse()
        .map_err(|e| ControlError::PortFile(format!("bad address: {e}")))
}

/// Parse `KEY=value KEY="quoted \"value\""` arguments; positional words are skipped
pub fn parse_keywords(input: &str) -> HashMap<String, String> {
    let mut arguments = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != '=') {
            key.push(c);
        }

        if chars.next_if_eq(&'=').is_none() {
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('r') => value.push('\r'),
                        Some('t') => value.push('\t'),
                        Some(other) => value.push(other),
                        None => break,
                    },
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }

        arguments.insert(key, value);
    }

    arguments
}

/// Parse the text of a `650` line
pub fn parse_event(text: &str) -> Option<ControlEvent> {
    let mut parts = text.splitn(4, ' ');
    let category = parts.next()?;
    if !category.starts_with("STATUS_") {
        return None;
    }
    let severity = parts.next()?;
    let action = parts.next()?;
    let rest = parts.next().unwrap_or("");

    if category == STATUS_CLIENT {
        match action {
            "CIRCUIT_ESTABLISHED" => return Some(ControlEvent::CircuitEstablished(true)),
            "CIRCUIT_NOT_ESTABLISHED" => return Some(ControlEvent::CircuitEstablished(false)),
            _ => {}
        }
    }

    Some(ControlEvent::Status(StatusEvent {
        category: category.to_string(),
        severity: severity.to_string(),
        action: action.to_string(),
        arguments: parse_keywords(rest),
    }))
}

/// Parse one `circuit-status` line: `<id> <status> [<path>] [KEY=value ...]`
pub fn parse_circuit(line: &str) -> Option<Circuit> {
    let mut parts = line.splitn(3, ' ');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let status = parts.next().filter(|s| !s.is_empty())?;
    let rest = parts.next().unwrap_or("");

    let (path, keywords) = match rest.split_once(' ').unwrap_or((rest, "")) {
        (first, tail) if !first.is_empty() && !is_keyword(first) => {
            (first.split(',').map(str::to_string).collect(), tail)
        }
        _ => (Vec::new(), rest),
    };

    Some(Circuit {
        id: id.to_string(),
        status: status.to_string(),
        path,
        purpose: parse_keywords(keywords).remove("PURPOSE"),
    })
}

/// `KEY=...` with an upper-case key; path entries like `$FP=name` are not keywords
fn is_keyword(token: &str) -> bool {
    token.split_once('=').is_some_and(|(key, _)| {
        !key.is_empty() && key.chars().all(|c| c.is_ascii_uppercase() || c == '_')
    })
}

struct Connection {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Reply>,
    events: broadcast::Sender<ControlEvent>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Control port client
pub struct TorControlPort {
    port_file: PathBuf,
    timeout: Duration,
    conn: Option<Connection>,
}

impl TorControlPort {
    /// Create a client for the daemon announcing itself in `port_file`
    pub fn new(port_file: impl Into<PathBuf>) -> Self {
        Self {
            port_file: port_file.into(),
            timeout: DEFAULT_CONTROL_TIMEOUT,
            conn: None,
        }
    }

    /// Bound connecting and every command round-trip by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send_command(&mut self, command: &str) -> Result<Reply, ControlError> {
        let conn = self.conn.as_mut().ok_or(ControlError::NotConnected)?;

        if !command.starts_with("AUTHENTICATE") {
            debug!("control> {}", command);
        }

        let round_trip = async {
            conn.writer.write_all(command.as_bytes()).await?;
            conn.writer.write_all(b"\r\n").await?;
            conn.replies.recv().await.ok_or(ControlError::Closed)
        };

        let result = tokio::time::timeout(self.timeout, round_trip).await;
        let reply = match result {
            Ok(reply) => reply?,
            Err(_) => {
                // A late reply would be matched to the next command
                warn!("Control port silent for {:?}, dropping connection", self.timeout);
                self.drop_connection();
                return Err(ControlError::Timeout(self.timeout));
            }
        };

        if reply.status != OK_STATUS {
            return Err(ControlError::Rejected {
                status: reply.status,
                message: reply.message(),
            });
        }

        Ok(reply)
    }

    async fn get_info(&mut self, key: &str) -> Result<Vec<String>, ControlError> {
        let reply = self.send_command(&format!("GETINFO {key}")).await?;
        let prefix = format!("{key}=");

        let line = reply
            .lines
            .iter()
            .find(|l| l.text.starts_with(&prefix))
            .ok_or_else(|| ControlError::Protocol(format!("missing {key} in reply")))?;

        let mut values = Vec::new();
        let inline = &line.text[prefix.len()..];
        if !inline.is_empty() {
            values.push(inline.to_string());
        }
        values.extend(line.data.iter().cloned());
        Ok(values)
    }

    fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
        }
    }
}

async fn run_reader(
    read: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Reply>,
    events: broadcast::Sender<ControlEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read);

    loop {
        match read_reply(&mut reader).await {
            Ok(Some(reply)) if reply.status == EVENT_STATUS => {
                if let Some(event) = reply.lines.first().and_then(|l| parse_event(&l.text)) {
                    // No subscribers yet is fine
                    let _ = events.send(event);
                }
            }
            Ok(Some(reply)) => {
                if replies.send(reply).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Control connection closed by daemon");
                break;
            }
            Err(e) => {
                warn!("Control connection error: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
}

#[async_trait]
impl ControlChannel for TorControlPort {
    fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|c| c.connected.load(Ordering::Relaxed))
    }

    async fn connect(&mut self) -> Result<(), ControlError> {
        if self.is_connected() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.port_file)
            .await
            .map_err(|e| ControlError::PortFile(format!("{}: {}", self.port_file.display(), e)))?;
        let addr = parse_port_file(&content)?;

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ControlError::Timeout(self.timeout))?
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;
        let (read, writer) = stream.into_split();

        let (replies_tx, replies) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(run_reader(read, replies_tx, events.clone(), connected.clone()));

        self.conn = Some(Connection {
            writer,
            replies,
            events,
            connected,
            reader,
        });

        info!("Connected to control port {}", addr);
        Ok(())
    }

    async fn authenticate(&mut self, cookie: &[u8]) -> Result<(), ControlError> {
        self.send_command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
            .await
            .map(|_| ())
    }

    async fn subscribe_events(&mut self) -> Result<broadcast::Receiver<ControlEvent>, ControlError> {
        let receiver = self
            .conn
            .as_ref()
            .ok_or(ControlError::NotConnected)?
            .events
            .subscribe();

        self.send_command(&format!("SETEVENTS {STATUS_CLIENT}")).await?;
        Ok(receiver)
    }

    async fn set_conf(&mut self, entry: &ConfigEntry) -> Result<(), ControlError> {
        self.send_command(&format!("SETCONF {}", entry.to_setconf()))
            .await
            .map(|_| ())
    }

    async fn set_confs(&mut self, entries: &[ConfigEntry]) -> Result<(), ControlError> {
        if entries.is_empty() {
            return Ok(());
        }

        let fragments: Vec<String> = entries.iter().map(ConfigEntry::to_setconf).collect();
        self.send_command(&format!("SETCONF {}", fragments.join(" ")))
            .await
            .map(|_| ())
    }

    async fn reset_conf(&mut self, key: &str) -> Result<(), ControlError> {
        self.send_command(&format!("RESETCONF {key}")).await.map(|_| ())
    }

    async fn reset_connection(&mut self) -> Result<(), ControlError> {
        self.set_conf(&ConfigEntry::new(keys::DISABLE_NETWORK, "1")).await?;
        self.set_conf(&ConfigEntry::new(keys::DISABLE_NETWORK, "0")).await
    }

    async fn circuit_established(&mut self) -> Result<bool, ControlError> {
        let values = self.get_info("status/circuit-established").await?;
        Ok(values.first().is_some_and(|v| v == "1"))
    }

    async fn circuits(&mut self) -> Result<Vec<Circuit>, ControlError> {
        let values = self.get_info("circuit-status").await?;
        Ok(values.iter().filter_map(|line| parse_circuit(line)).collect())
    }

    async fn close_circuits(&mut self, ids: &[String]) -> Result<(), ControlError> {
        for id in ids {
            self.send_command(&format!("CLOSECIRCUIT {id}")).await?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.reader.abort();
            let _ = conn.writer.shutdown().await;
            info!("Disconnected from control port");
        }
    }
}

impl Drop for TorControlPort {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

/// Creates [`TorControlPort`] clients
#[derive(Debug, Clone, Copy)]
pub struct TorControlFactory {
    timeout: Duration,
}

impl TorControlFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TorControlFactory {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_TIMEOUT)
    }
}

impl ControlFactory for TorControlFactory {
    fn create(&self, port_file: &Path) -> Box<dyn ControlChannel> {
        Box::new(TorControlPort::new(port_file).with_timeout(self.timeout))
    }
}
