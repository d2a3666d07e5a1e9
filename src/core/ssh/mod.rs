//! SSH sessions
//!
//! libssh2 is not reentrant, so every call into a session or one of its
//! channels goes through [`SshSession::exclusive`], which holds the session
//! lock for the duration of a single library call. In non-blocking mode a
//! call that would block releases the lock, waits for the socket and is
//! retried, so the reader thread, tunnel workers and file transfers can
//! share one connection.

pub mod auth;
pub mod scp;
pub mod sftp;
pub mod tunnel;

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ssh2::{Channel, ErrorCode, Session};
use thiserror::Error;

use super::host::SshTarget;

/// libssh2's LIBSSH2_ERROR_EAGAIN
const EAGAIN: i32 = -37;

/// Longest single wait on the socket before retrying a call
const POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum SshError {
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
    #[error("{context}: {source}")]
    Lib {
        context: &'static str,
        #[source]
        source: ssh2::Error,
    },
    #[error("server sent no host key")]
    NoHostKey,
    #[error("host key for {0} not accepted")]
    HostKeyRejected(String),
    #[error("no user name given")]
    NoUser,
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("no channel is open")]
    NoChannel,
    #[error("{path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ssh2::Error> for SshError {
    fn from(source: ssh2::Error) -> Self {
        SshError::Lib {
            context: "ssh",
            source,
        }
    }
}

/// Errors that can mean "try again once the socket is ready"
pub trait WouldBlock {
    fn would_block(&self) -> bool;
}

impl WouldBlock for ssh2::Error {
    fn would_block(&self) -> bool {
        matches!(self.code(), ErrorCode::Session(EAGAIN))
    }
}

impl WouldBlock for io::Error {
    fn would_block(&self) -> bool {
        self.kind() == io::ErrorKind::WouldBlock
    }
}

pub struct SshSession {
    session: Mutex<Session>,
    /// Interactive shell or subsystem channel
    channel: Mutex<Option<Channel>>,
    socket: TcpStream,
    host: String,
    port: u16,
}

impl SshSession {
    /// TCP connect and SSH handshake, in blocking mode
    pub fn connect(target: &SshTarget, timeout: Duration) -> Result<Self, SshError> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"))
            })
            .map_err(|source| SshError::Resolve {
                host: target.host.clone(),
                source,
            })?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|source| SshError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let _ = tcp.set_nodelay(true);
        let socket = tcp.try_clone()?;

        let mut session = Session::new().map_err(|source| SshError::Lib {
            context: "session init",
            source,
        })?;
        session.set_tcp_stream(tcp);
        session.set_blocking(true);
        session.handshake().map_err(|source| SshError::Lib {
            context: "ssh handshake",
            source,
        })?;
        tracing::info!("ssh handshake with {} complete", addr);

        Ok(Self {
            session: Mutex::new(session),
            channel: Mutex::new(None),
            socket,
            host: target.host.clone(),
            port: target.port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run `op` with the session lock held, without retrying
    pub fn locked<T>(&self, op: impl FnOnce(&Session) -> T) -> T {
        let session = self.session.lock();
        op(&session)
    }

    /// Run `op` under the session lock, retrying while it would block.
    /// The lock is released while waiting for the socket.
    pub fn exclusive<T, E>(&self, mut op: impl FnMut(&Session) -> Result<T, E>) -> Result<T, SshError>
    where
        E: WouldBlock + Into<SshError>,
    {
        loop {
            let result = {
                let session = self.session.lock();
                op(&session)
            };
            match result {
                Err(e) if e.would_block() => self.wait_socket(POLL),
                other => return other.map_err(Into::into),
            }
        }
    }

    /// Wait until the socket has something to read, or `timeout` passes
    pub fn wait_socket(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut probe = [0u8; 1];
        while Instant::now() < deadline {
            match self.socket.peek(&mut probe) {
                Ok(_) => return,
                Err(e) if e.would_block() => thread::sleep(Duration::from_millis(2)),
                Err(_) => return,
            }
        }
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.locked(|s| s.set_blocking(blocking));
    }

    /// Request a pty and start a shell on the main channel
    pub fn open_shell(&self, term_type: &str, cols: u32, rows: u32) -> Result<(), SshError> {
        let mut channel = self.exclusive(|s| s.channel_session())?;
        self.exclusive(|_| channel.request_pty(term_type, None, Some((cols, rows, 0, 0))))?;
        self.exclusive(|_| channel.shell())?;
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    pub fn open_subsystem(&self, name: &str) -> Result<(), SshError> {
        let mut channel = self.exclusive(|s| s.channel_session())?;
        self.exclusive(|_| channel.subsystem(name))?;
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    /// One read from the main channel. `Ok(None)` means nothing is
    /// available yet, `Ok(Some(0))` means the remote end closed.
    pub fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, SshError> {
        let _session = self.session.lock();
        let mut guard = self.channel.lock();
        let channel = guard.as_mut().ok_or(SshError::NoChannel)?;
        match channel.read(buf) {
            Ok(0) if !channel.eof() => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.would_block() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_all(&self, data: &[u8]) -> Result<(), SshError> {
        let mut written = 0;
        while written < data.len() {
            let n = self.exclusive(|_| {
                let mut guard = self.channel.lock();
                match guard.as_mut() {
                    Some(channel) => channel.write(&data[written..]),
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "no channel")),
                }
            })?;
            written += n;
        }
        Ok(())
    }

    pub fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.exclusive(|_| {
            let mut guard = self.channel.lock();
            match guard.as_mut() {
                Some(channel) => channel.request_pty_size(cols, rows, None, None),
                None => Ok(()),
            }
        })
    }

    /// Read from a secondary channel (tunnel, scp)
    pub fn channel_read(&self, channel: &mut Channel, buf: &mut [u8]) -> Result<Option<usize>, SshError> {
        let _session = self.session.lock();
        match channel.read(buf) {
            Ok(0) if !channel.eof() => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.would_block() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn channel_write_all(&self, channel: &mut Channel, data: &[u8]) -> Result<(), SshError> {
        let mut written = 0;
        while written < data.len() {
            let n = self.exclusive(|_| channel.write(&data[written..]))?;
            written += n;
        }
        Ok(())
    }

    /// Send EOF and close a secondary channel, ignoring errors
    pub fn close_channel(&self, channel: &mut Channel) {
        let _ = self.exclusive(|_| channel.send_eof());
        let _ = self.exclusive(|_| channel.close());
    }

    /// Close the main channel and end the session
    pub fn disconnect(&self) {
        let channel = self.channel.lock().take();
        if let Some(mut channel) = channel {
            self.close_channel(&mut channel);
        }
        let _ = self.exclusive(|s| s.disconnect(None, "closed by user", None));
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_would_block() {
        assert!(io::Error::from(io::ErrorKind::WouldBlock).would_block());
        assert!(!io::Error::from(io::ErrorKind::TimedOut).would_block());
    }

    #[test]
    fn test_connect_refused() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let target = SshTarget {
            host: "127.0.0.1".into(),
            port,
            user: None,
            password: None,
            passphrase: None,
            subsystem: None,
        };
        let err = SshSession::connect(&target, Duration::from_secs(2)).err().unwrap();
        assert!(matches!(err, SshError::Connect { .. }));
    }
}
