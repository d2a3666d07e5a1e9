//! Telnet reader. Negotiation itself happens inline in the terminal.

use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use super::{resolve, HostError, HostInner, Transport};

const READ_TICK: Duration = Duration::from_millis(100);

pub(super) fn run(host: &HostInner, hostname: &str, port: u16) -> Result<(), HostError> {
    let addr = resolve(hostname, port)?;
    let timeout = Duration::from_secs(host.config.telnet.connect_timeout);
    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|source| HostError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_read_timeout(Some(READ_TICK)).map_err(HostError::Read)?;
    let _ = stream.set_nodelay(true);
    let writer = stream.try_clone().map_err(HostError::Read)?;

    if host.exiting() {
        return Ok(());
    }
    host.term
        .lock()
        .set_telnet(Some(&host.config.telnet.term_type));
    host.connected(Transport::Telnet(Arc::new(writer)), &format!("{}:{}", hostname, port));

    let mut buf = [0u8; 4096];
    while !host.exiting() {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => host.deliver(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(HostError::Read(e)),
        }
    }
    Ok(())
}
