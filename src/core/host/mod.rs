//! Host connections
//!
//! A [`Host`] owns at most one connection at a time. `open` parses a
//! connection string and starts a reader thread that connects, pumps
//! received bytes into the terminal and returns the host to idle when the
//! connection ends. Writes from callers go straight to the transport.

mod process;
mod serial;
pub mod spec;
mod ssh;
mod telnet;

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::process::ChildStdin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::script::ScriptBridge;
use crate::core::session::SessionEvent;
use crate::core::ssh::tunnel::TunnelList;
use crate::core::ssh::{SshError, SshSession};
use crate::core::term::telnet::escape_iac;
use crate::core::term::SharedTerminal;

pub use spec::{ConnectSpec, Parity, SerialSpec, SshTarget};
pub use ssh::NETCONF_EOM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    None,
    LocalProcess,
    Serial,
    Telnet,
    Ssh,
    Sftp,
    Netconf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Idle,
    Connecting,
    Authenticating,
    Connected,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostStatus::Idle => "idle",
            HostStatus::Connecting => "connecting",
            HostStatus::Authenticating => "authenticating",
            HostStatus::Connected => "connected",
        })
    }
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("{0}")]
    InvalidSpec(String),
    #[error("already {0}; disconnect first")]
    Busy(HostStatus),
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot open {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("cannot run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error("cannot start reader thread: {0}")]
    Thread(#[source] io::Error),
}

/// Writer half of the live connection. Writers clone it out of the host
/// and write without holding the host's transport lock.
#[derive(Clone)]
pub(crate) enum Transport {
    Serial(Arc<Mutex<Box<dyn serialport::SerialPort>>>),
    Telnet(Arc<TcpStream>),
    Process(Arc<Mutex<ChildStdin>>),
    Ssh(Arc<SshSession>),
}

struct HostState {
    kind: HostKind,
    status: HostStatus,
    hostname: String,
}

pub(crate) struct HostInner {
    pub(crate) term: SharedTerminal,
    pub(crate) bridge: Arc<ScriptBridge>,
    pub(crate) config: Arc<Config>,
    pub(crate) tunnels: TunnelList,
    state: Mutex<HostState>,
    transport: Mutex<Option<Transport>>,
    exit: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<Sender<SessionEvent>>>,
    tap: Mutex<Option<Sender<Vec<u8>>>>,
}

#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(
        term: SharedTerminal,
        bridge: Arc<ScriptBridge>,
        config: Arc<Config>,
        events: Option<Sender<SessionEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                term,
                bridge,
                config,
                tunnels: TunnelList::default(),
                state: Mutex::new(HostState {
                    kind: HostKind::None,
                    status: HostStatus::Idle,
                    hostname: String::new(),
                }),
                transport: Mutex::new(None),
                exit: AtomicBool::new(false),
                reader: Mutex::new(None),
                events: Mutex::new(events),
                tap: Mutex::new(None),
            }),
        }
    }

    /// Start connecting. Returns once the reader thread is running; the
    /// connection itself completes (or fails) in the background.
    pub fn open(&self, spec: &str) -> Result<(), HostError> {
        let target = ConnectSpec::parse(spec)?;
        {
            let mut state = self.inner.state.lock();
            if state.status != HostStatus::Idle {
                if target == ConnectSpec::Disconnect {
                    drop(state);
                    self.close();
                    return Ok(());
                }
                return Err(HostError::Busy(state.status));
            }
            if target == ConnectSpec::Disconnect {
                return Ok(());
            }
            state.status = HostStatus::Connecting;
            state.kind = target.kind();
            state.hostname = target.hostname();
        }

        if let Some(previous) = self.inner.reader.lock().take() {
            let _ = previous.join();
        }
        self.inner.exit.store(false, Ordering::SeqCst);
        self.inner.bridge.reset();

        info!("opening {}", target);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("tterm-reader".into())
            .spawn(move || inner.run(target));
        match spawned {
            Ok(handle) => {
                *self.inner.reader.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.set_idle();
                Err(HostError::Thread(e))
            }
        }
    }

    /// Send bytes to the remote end. Does nothing while idle.
    pub fn send(&self, data: &[u8]) -> Result<(), HostError> {
        self.inner.write(data, false)
    }

    pub fn resize(&self, cols: usize, rows: usize) {
        self.inner.term.lock().resize(cols, rows);
        if self.kind() == HostKind::Ssh {
            if let Some(ssh) = self.ssh() {
                if let Err(e) = ssh.resize(cols as u32, rows as u32) {
                    warn!("pty resize failed: {}", e);
                }
            }
        }
    }

    /// Ask the connection to end. The reader thread finishes the teardown.
    pub fn close(&self) {
        if self.status() == HostStatus::Idle {
            return;
        }
        info!("closing {}", self.hostname());
        self.inner.exit.store(true, Ordering::SeqCst);
        self.inner.bridge.cancel();

        let guard = self.inner.transport.lock();
        let ssh = match guard.as_ref() {
            Some(Transport::Telnet(sock)) => {
                let _ = sock.shutdown(Shutdown::Both);
                None
            }
            Some(Transport::Ssh(ssh)) => Some(ssh.clone()),
            // serial and process readers notice the exit flag on their next tick
            _ => None,
        };
        drop(guard);
        if let Some(ssh) = ssh {
            ssh.disconnect();
        }
    }

    /// Block until the reader thread has finished, up to `timeout`
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.status() != HostStatus::Idle {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.inner.reader.lock().take() {
            let _ = handle.join();
        }
        true
    }

    pub fn status(&self) -> HostStatus {
        self.inner.state.lock().status
    }

    pub fn kind(&self) -> HostKind {
        self.inner.state.lock().kind
    }

    pub fn hostname(&self) -> String {
        self.inner.state.lock().hostname.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.status() == HostStatus::Idle
    }

    pub fn is_connected(&self) -> bool {
        self.status() == HostStatus::Connected
    }

    pub fn status_line(&self) -> String {
        let state = self.inner.state.lock();
        if state.status == HostStatus::Idle {
            "not connected".to_string()
        } else {
            format!("{} ({})", state.hostname, state.status)
        }
    }

    /// The SSH session behind the current connection, if any
    pub fn ssh(&self) -> Option<Arc<SshSession>> {
        match self.inner.transport.lock().as_ref() {
            Some(Transport::Ssh(ssh)) => Some(ssh.clone()),
            _ => None,
        }
    }

    pub fn tunnels(&self) -> &TunnelList {
        &self.inner.tunnels
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Divert received bytes to `tap` instead of the terminal
    pub fn set_tap(&self, tap: Option<Sender<Vec<u8>>>) {
        *self.inner.tap.lock() = tap;
    }

    pub fn set_events(&self, events: Option<Sender<SessionEvent>>) {
        *self.inner.events.lock() = events;
    }
}

impl HostInner {
    fn run(&self, target: ConnectSpec) {
        let hostname = target.hostname();
        let result = match target {
            ConnectSpec::Serial(spec) => serial::run(self, spec),
            ConnectSpec::Telnet { host, port } => telnet::run(self, &host, port),
            ConnectSpec::Process(command) => process::run(self, &command),
            ConnectSpec::Ssh(t) => ssh::run_shell(self, &t),
            ConnectSpec::Sftp(t) => ssh::run_sftp(self, &t),
            ConnectSpec::Netconf(t) => ssh::run_netconf(self, &t),
            ConnectSpec::Disconnect => Ok(()),
        };
        if let Err(e) = result {
            if !self.exiting() {
                error!("{}: {}", hostname, e);
                self.term.lock().disp_error(&e.to_string());
            }
        }

        self.tunnels.close_all();
        *self.transport.lock() = None;
        {
            let mut term = self.term.lock();
            term.set_telnet(None);
            term.set_xml_mode(false);
            term.set_local_echo(false);
        }
        self.set_idle();
        info!("{} disconnected", hostname);
        self.emit(SessionEvent::Disconnected(hostname));
        self.emit(SessionEvent::Redraw);
    }

    fn set_idle(&self) {
        let mut state = self.state.lock();
        state.status = HostStatus::Idle;
        state.kind = HostKind::None;
    }

    pub(crate) fn set_status(&self, status: HostStatus) {
        self.state.lock().status = status;
    }

    /// Install the writer and mark the host connected
    pub(crate) fn connected(&self, transport: Transport, label: &str) {
        *self.transport.lock() = Some(transport);
        self.set_status(HostStatus::Connected);
        self.term.lock().reset_mark();
        info!("connected to {}", label);
        self.emit(SessionEvent::Connected(label.to_string()));
    }

    pub(crate) fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Hand received bytes to the tap or the terminal
    pub(crate) fn deliver(&self, data: &[u8]) {
        if let Some(tap) = self.tap.lock().as_ref() {
            if tap.send(data.to_vec()).is_ok() {
                return;
            }
        }
        let (replies, bell, title) = {
            let mut term = self.term.lock();
            term.parse(data);
            (term.take_replies(), term.take_bell(), term.take_title())
        };
        if !replies.is_empty() {
            if let Err(e) = self.write(&replies, true) {
                warn!("reply not sent: {}", e);
            }
        }
        if bell {
            self.emit(SessionEvent::Bell);
        }
        if let Some(title) = title {
            self.emit(SessionEvent::TitleChanged(title));
        }
        self.emit(SessionEvent::Redraw);
    }

    /// Write to the transport; `raw` skips telnet IAC doubling
    fn write(&self, data: &[u8], raw: bool) -> Result<(), HostError> {
        let Some(transport) = self.transport.lock().clone() else {
            return Ok(());
        };
        match transport {
            Transport::Serial(port) => port.lock().write_all(data).map_err(HostError::Write),
            Transport::Telnet(sock) => {
                let data = if raw { data.into() } else { escape_iac(data) };
                (&*sock).write_all(&data).map_err(HostError::Write)
            }
            Transport::Process(stdin) => {
                let data = platform_newlines(data);
                let mut stdin = stdin.lock();
                stdin
                    .write_all(&data)
                    .and_then(|_| stdin.flush())
                    .map_err(HostError::Write)
            }
            Transport::Ssh(ssh) => ssh.write_all(data).map_err(HostError::from),
        }
    }
}

/// Local processes expect the platform line ending where the terminal sends CR
fn platform_newlines(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let newline: &[u8] = if cfg!(windows) { b"\r\n" } else { b"\n" };
    if !data.contains(&b'\r') {
        return data.into();
    }
    let mut out = Vec::with_capacity(data.len() + 4);
    for &b in data {
        if b == b'\r' {
            out.extend_from_slice(newline);
        } else {
            out.push(b);
        }
    }
    out.into()
}

pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, HostError> {
    let resolve_err = |source| HostError::Resolve {
        host: host.to_string(),
        source,
    };
    let mut addrs = (host, port).to_socket_addrs().map_err(resolve_err)?;
    let addr = addrs.next().ok_or_else(|| {
        resolve_err(io::Error::new(io::ErrorKind::NotFound, "no addresses"))
    })?;
    debug!("{} resolved to {}", host, addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::Terminal;
    use pretty_assertions::assert_eq;
    use std::io::{BufRead, BufReader, Read};
    use std::net::TcpListener;

    fn host() -> (SharedTerminal, Host) {
        let term = Terminal::new(80, 24).shared();
        let bridge = Arc::new(ScriptBridge::new(term.clone(), 1));
        let host = Host::new(term.clone(), bridge, Arc::new(Config::default()), None);
        (term, host)
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_send_while_idle_is_noop() {
        let (_term, host) = host();
        assert!(host.send(b"hello\r").is_ok());
        assert_eq!(host.status(), HostStatus::Idle);
        assert_eq!(host.kind(), HostKind::None);
    }

    #[test]
    fn test_disconnect_while_idle() {
        let (_term, host) = host();
        assert!(host.open("disconnect").is_ok());
        assert!(host.is_idle());
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let (term, host) = host();
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        host.open(&format!("telnet 127.0.0.1:{}", port)).unwrap();
        assert!(host.wait_idle(Duration::from_secs(5)));
        assert_eq!(host.kind(), HostKind::None);
        assert!(term.lock().buf.line_text(0).contains("connect to 127.0.0.1"));
    }

    #[test]
    fn test_telnet_open_is_exclusive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"welcome\r\n").unwrap();
            let mut line = String::new();
            BufReader::new(sock.try_clone().unwrap()).read_line(&mut line).unwrap();
            line
        });

        let (term, host) = host();
        host.open(&format!("telnet 127.0.0.1:{}", port)).unwrap();
        assert!(wait_until(|| host.is_connected()));
        assert!(matches!(
            host.open("telnet 127.0.0.1:1"),
            Err(HostError::Busy(HostStatus::Connected))
        ));
        assert!(wait_until(|| term.lock().buf.line_text(0) == "welcome"));

        host.send(b"ping\n").unwrap();
        assert_eq!(server.join().unwrap(), "ping\n");
        host.open("disconnect").unwrap();
        assert!(host.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_telnet_replies_are_sent_raw() {
        use crate::core::term::telnet::{DO, IAC, OPT_ECHO, WILL};
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&[IAC, DO, OPT_ECHO]).unwrap();
            let mut reply = [0u8; 3];
            sock.read_exact(&mut reply).unwrap();
            reply
        });

        let (_term, host) = host();
        host.open(&format!("telnet 127.0.0.1:{}", port)).unwrap();
        assert_eq!(server.join().unwrap(), [IAC, WILL, OPT_ECHO]);
        host.close();
        assert!(host.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_close_is_not_blocked_by_stalled_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        // accepts and never reads
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let _ = done_rx.recv();
            drop(sock);
        });

        let (_term, host) = host();
        host.open(&format!("telnet 127.0.0.1:{}", port)).unwrap();
        assert!(wait_until(|| host.is_connected()));

        let writer = {
            let host = host.clone();
            thread::spawn(move || host.send(&vec![b'x'; 64 * 1024 * 1024]))
        };
        // let the socket buffers fill
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        host.close();
        assert!(host.wait_idle(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(writer.join().unwrap().is_err());

        drop(done_tx);
        server.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_local_process_output() {
        let (term, host) = host();
        host.open("!echo tterm-process").unwrap();
        assert!(host.wait_idle(Duration::from_secs(5)));
        let text = term.lock().buf.screen_lines().join("\n");
        assert!(text.contains("tterm-process"));
    }

    #[cfg(unix)]
    #[test]
    fn test_local_process_is_killed_on_close() {
        let (_term, host) = host();
        host.open("sleep 30").unwrap();
        assert!(wait_until(|| host.is_connected()));
        host.close();
        assert!(host.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_platform_newlines() {
        let expected: &[u8] = if cfg!(windows) { b"ls\r\n" } else { b"ls\n" };
        assert_eq!(&*platform_newlines(b"ls\r"), expected);
    }
}
