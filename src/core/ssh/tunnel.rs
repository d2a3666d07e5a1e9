//! Local port forwarding over the SSH session
//!
//! Each tunnel owns a listening socket. Every accepted connection gets its
//! own direct-tcpip channel and a worker thread pumping bytes both ways.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use ssh2::Channel;
use tracing::{debug, info, warn};

use super::{SshError, SshSession};

const ACCEPT_TICK: Duration = Duration::from_millis(100);
const PUMP_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: usize,
    pub local: String,
    pub remote: String,
    pub connections: usize,
}

struct Tunnel {
    id: usize,
    local: String,
    remote: String,
    stop: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

#[derive(Default)]
struct TunnelTable {
    next_id: usize,
    tunnels: Vec<Tunnel>,
}

/// Tunnels belonging to one host
#[derive(Clone, Default)]
pub struct TunnelList {
    table: Arc<Mutex<TunnelTable>>,
}

impl TunnelList {
    fn add(&self, local: String, remote: String, stop: Arc<AtomicBool>, connections: Arc<AtomicUsize>) -> usize {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.tunnels.push(Tunnel {
            id,
            local,
            remote,
            stop,
            connections,
        });
        id
    }

    fn remove(&self, id: usize) -> bool {
        let mut table = self.table.lock();
        let before = table.tunnels.len();
        table.tunnels.retain(|t| t.id != id);
        table.tunnels.len() != before
    }

    /// Stop one tunnel. Open connections finish on their next tick.
    pub fn close(&self, id: usize) -> bool {
        let stop = {
            let table = self.table.lock();
            table.tunnels.iter().find(|t| t.id == id).map(|t| t.stop.clone())
        };
        match stop {
            Some(stop) => {
                stop.store(true, Ordering::SeqCst);
                self.remove(id);
                info!("tunnel {} closed", id);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let stopped: Vec<_> = self.table.lock().tunnels.drain(..).map(|t| t.stop).collect();
        for stop in &stopped {
            stop.store(true, Ordering::SeqCst);
        }
        if !stopped.is_empty() {
            info!("closed {} tunnel(s)", stopped.len());
        }
    }

    pub fn list(&self) -> Vec<TunnelInfo> {
        self.table
            .lock()
            .tunnels
            .iter()
            .map(|t| TunnelInfo {
                id: t.id,
                local: t.local.clone(),
                remote: t.remote.clone(),
                connections: t.connections.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().tunnels.is_empty()
    }
}

/// Parse `[lhost:]lport` and `rhost:rport` into a bind address and target
pub fn parse_forward(local: &str, remote: &str) -> Result<(String, String, u16), String> {
    let bind = if local.contains(':') {
        local.to_string()
    } else {
        format!("127.0.0.1:{}", local)
    };
    let port_ok = bind
        .rsplit_once(':')
        .map_or(false, |(_, p)| p.parse::<u16>().is_ok());
    if !port_ok {
        return Err(format!("bad local port in '{}'", local));
    }
    let (rhost, rport) = remote
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' should be host:port", remote))?;
    let rport = rport
        .parse::<u16>()
        .map_err(|_| format!("bad remote port in '{}'", remote))?;
    if rhost.is_empty() {
        return Err(format!("'{}' should be host:port", remote));
    }
    Ok((bind, rhost.to_string(), rport))
}

/// Listen on `local_addr` and forward each connection to
/// `remote_host:remote_port` through `ssh`. Returns the tunnel id.
pub fn tun_local(
    ssh: Arc<SshSession>,
    list: &TunnelList,
    local_addr: &str,
    remote_host: &str,
    remote_port: u16,
) -> Result<usize, SshError> {
    let listener = TcpListener::bind(local_addr)?;
    listener.set_nonblocking(true)?;
    let bound = listener.local_addr()?.to_string();
    let remote = format!("{}:{}", remote_host, remote_port);

    let stop = Arc::new(AtomicBool::new(false));
    let connections = Arc::new(AtomicUsize::new(0));
    let id = list.add(bound.clone(), remote.clone(), stop.clone(), connections.clone());
    info!("tunnel {}: {} -> {}", id, bound, remote);

    let owner = list.clone();
    let remote_host = remote_host.to_string();
    let spawned = thread::Builder::new()
        .name(format!("tterm-tunnel-{}", id))
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((sock, peer)) => {
                        debug!("tunnel {}: connection from {}", id, peer);
                        let ssh = ssh.clone();
                        let stop = stop.clone();
                        let connections = connections.clone();
                        let remote_host = remote_host.clone();
                        thread::spawn(move || {
                            let opened =
                                ssh.exclusive(|s| s.channel_direct_tcpip(&remote_host, remote_port, None));
                            match opened {
                                Ok(channel) => {
                                    connections.fetch_add(1, Ordering::SeqCst);
                                    tun_worker(&ssh, channel, sock, &stop);
                                    connections.fetch_sub(1, Ordering::SeqCst);
                                }
                                Err(e) => {
                                    warn!(
                                        "tunnel {}: channel to {}:{} refused: {}",
                                        id, remote_host, remote_port, e
                                    );
                                    let _ = sock.shutdown(Shutdown::Both);
                                }
                            }
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_TICK),
                    Err(e) => {
                        warn!("tunnel {}: accept failed: {}", id, e);
                        break;
                    }
                }
            }
            owner.remove(id);
            debug!("tunnel {} listener stopped", id);
        });
    if let Err(e) = spawned {
        list.remove(id);
        return Err(e.into());
    }
    Ok(id)
}

/// Pump bytes between `sock` and `channel` until either side closes
pub fn tun_worker(ssh: &SshSession, mut channel: Channel, mut sock: TcpStream, stop: &AtomicBool) {
    // accepted sockets may inherit the listener's non-blocking flag
    let setup = sock
        .set_nonblocking(false)
        .and_then(|_| sock.set_read_timeout(Some(PUMP_TICK)));
    if let Err(e) = setup {
        warn!("tunnel socket setup failed: {}", e);
        return;
    }
    let mut up = [0u8; 16384];
    let mut down = [0u8; 16384];
    while !stop.load(Ordering::SeqCst) {
        match sock.read(&mut up) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = ssh.channel_write_all(&mut channel, &up[..n]) {
                    debug!("tunnel channel write failed: {}", e);
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                debug!("tunnel socket read failed: {}", e);
                break;
            }
        }
        match ssh.channel_read(&mut channel, &mut down) {
            Ok(Some(0)) => break,
            Ok(Some(n)) => {
                if sock.write_all(&down[..n]).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("tunnel channel read failed: {}", e);
                break;
            }
        }
    }
    ssh.close_channel(&mut channel);
    let _ = sock.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn add(list: &TunnelList, local: &str) -> (usize, Arc<AtomicBool>) {
        let stop = Arc::new(AtomicBool::new(false));
        let id = list.add(
            local.to_string(),
            "db:5432".to_string(),
            stop.clone(),
            Arc::new(AtomicUsize::new(0)),
        );
        (id, stop)
    }

    #[test]
    fn test_list_and_close() {
        let list = TunnelList::default();
        let (first, first_stop) = add(&list, "127.0.0.1:15432");
        let (second, _) = add(&list, "127.0.0.1:15433");
        assert_eq!(list.list().len(), 2);
        assert_ne!(first, second);

        assert!(list.close(first));
        assert!(first_stop.load(Ordering::SeqCst));
        assert!(!list.close(first));
        let left = list.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, second);
        assert_eq!(left[0].remote, "db:5432");
    }

    #[test]
    fn test_close_all_stops_everything() {
        let list = TunnelList::default();
        let (_, a) = add(&list, "127.0.0.1:1");
        let (_, b) = add(&list, "127.0.0.1:2");
        list.clone().close_all();
        assert!(list.is_empty());
        assert!(a.load(Ordering::SeqCst));
        assert!(b.load(Ordering::SeqCst));
    }

    #[test]
    fn test_parse_forward() {
        assert_eq!(
            parse_forward("8080", "web:80").unwrap(),
            ("127.0.0.1:8080".to_string(), "web".to_string(), 80)
        );
        assert_eq!(
            parse_forward("0.0.0.0:2222", "10.0.0.5:22").unwrap(),
            ("0.0.0.0:2222".to_string(), "10.0.0.5".to_string(), 22)
        );
        assert!(parse_forward("http", "web:80").is_err());
        assert!(parse_forward("8080", "web").is_err());
        assert!(parse_forward("8080", ":80").is_err());
    }
}
