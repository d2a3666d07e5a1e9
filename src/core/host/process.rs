//! Local command with piped stdio

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{HostError, HostInner, Transport};

const READ_TICK: Duration = Duration::from_millis(100);

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

pub(super) fn run(host: &HostInner, command: &str) -> Result<(), HostError> {
    let mut child = shell_command(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| HostError::Spawn {
            command: command.to_string(),
            source,
        })?;
    info!("started '{}' (pid {})", command, child.id());

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        forward(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, tx);
    }
    // no stdin is unusual but the output is still worth showing
    if let Some(stdin) = child.stdin.take() {
        host.term.lock().set_local_echo(true);
        host.connected(Transport::Process(Arc::new(Mutex::new(stdin))), command);
    }

    while !host.exiting() {
        match rx.recv_timeout(READ_TICK) {
            Ok(data) => host.deliver(&data),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // closing stdin is the polite request to exit
    *host.transport.lock() = None;
    let grace = Duration::from_millis(host.config.process.kill_grace_ms);
    terminate(&mut child, grace);
    Ok(())
}

fn forward(mut pipe: impl Read + Send + 'static, tx: Sender<Vec<u8>>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Wait up to `grace` for the child to exit, then kill it
fn terminate(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("process exited: {}", status);
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Ok(None) => break,
            Err(e) => {
                warn!("cannot poll process: {}", e);
                break;
            }
        }
    }
    info!("killing process {}", child.id());
    let _ = child.kill();
    let _ = child.wait();
}
