//! SSH, SFTP and netconf readers

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{HostError, HostInner, HostStatus, SshTarget, Transport};
use crate::config::expand_home;
use crate::core::session::SessionEvent;
use crate::core::ssh::auth::AuthOptions;
use crate::core::ssh::sftp::{sftp_cmd, RemoteFs, SftpFlow, SftpFs, SftpState};
use crate::core::ssh::{SshError, SshSession};

const READ_TICK: Duration = Duration::from_millis(100);

/// End-of-message marker of netconf 1.0 framing
pub const NETCONF_EOM: &str = "]]>]]>";

const NETCONF_HELLO: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
<capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities>\
</hello>]]>]]>";

fn label(target: &SshTarget) -> String {
    match &target.user {
        Some(user) => format!("{}@{}:{}", user, target.host, target.port),
        None => format!("{}:{}", target.host, target.port),
    }
}

/// Connect, verify the host key and log in
fn establish(host: &HostInner, target: &SshTarget) -> Result<Arc<SshSession>, HostError> {
    let cfg = &host.config.ssh;
    let ssh = SshSession::connect(target, Duration::from_secs(cfg.connect_timeout))?;
    host.set_status(HostStatus::Authenticating);
    host.emit(SessionEvent::Redraw);

    ssh.verify_host_key(&expand_home(&cfg.known_hosts), &*host.bridge)?;

    let user = match &target.user {
        Some(user) => user.clone(),
        None => host
            .bridge
            .gets("login as: ", true)
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or(SshError::NoUser)?,
    };
    let opts = AuthOptions {
        password: target.password.clone(),
        passphrase: target.passphrase.clone(),
        identities: cfg.identity_files.iter().map(|p| expand_home(p)).collect(),
        attempts: cfg.auth_attempts,
    };
    ssh.authenticate(&user, &opts, &*host.bridge)?;
    Ok(Arc::new(ssh))
}

/// Move channel output into the terminal until EOF or close
fn pump(host: &HostInner, ssh: &SshSession) -> Result<(), HostError> {
    let mut buf = [0u8; 16384];
    while !host.exiting() {
        match ssh.read(&mut buf)? {
            Some(0) => break,
            Some(n) => host.deliver(&buf[..n]),
            None => ssh.wait_socket(READ_TICK),
        }
    }
    ssh.disconnect();
    Ok(())
}

pub(super) fn run_shell(host: &HostInner, target: &SshTarget) -> Result<(), HostError> {
    let ssh = establish(host, target)?;
    match &target.subsystem {
        Some(name) => ssh.open_subsystem(name)?,
        None => {
            let (cols, rows) = {
                let term = host.term.lock();
                (term.buf.cols as u32, term.buf.rows as u32)
            };
            ssh.open_shell(&host.config.ssh.term_type, cols, rows)?;
        }
    }
    ssh.set_blocking(false);
    host.connected(Transport::Ssh(ssh.clone()), &label(target));
    pump(host, &ssh)
}

pub(super) fn run_netconf(host: &HostInner, target: &SshTarget) -> Result<(), HostError> {
    let ssh = establish(host, target)?;
    ssh.open_subsystem("netconf")?;
    {
        let mut term = host.term.lock();
        term.set_xml_mode(true);
        term.set_prompt(NETCONF_EOM);
    }
    ssh.write_all(NETCONF_HELLO.as_bytes())?;
    ssh.set_blocking(false);
    host.connected(Transport::Ssh(ssh.clone()), &label(target));
    pump(host, &ssh)
}

/// Interactive sftp prompt. Runs blocking; the session has no shell channel.
pub(super) fn run_sftp(host: &HostInner, target: &SshTarget) -> Result<(), HostError> {
    let ssh = establish(host, target)?;
    let mut fs = SftpFs::open(&ssh, host.config.transfer.chunk_size)?.with_progress(|line| {
        host.term.lock().disp(line);
        host.emit(SessionEvent::Redraw);
    });
    let remote_cwd = fs.realpath(".")?;
    let local_cwd = env::current_dir().unwrap_or_default();
    let mut state = SftpState::new(remote_cwd, local_cwd);

    host.connected(Transport::Ssh(ssh.clone()), &label(target));
    host.term
        .lock()
        .disp(&format!("Remote working directory: {}\r\n", state.remote_cwd));
    info!("sftp session started in {}", state.remote_cwd);

    while !host.exiting() {
        host.emit(SessionEvent::Redraw);
        let Some(line) = host.bridge.gets("sftp> ", true) else {
            break;
        };
        let mut out = String::new();
        let flow = sftp_cmd(&mut fs, &mut state, &line, &mut out);
        if !out.is_empty() {
            host.term.lock().disp(&out);
        }
        if flow == SftpFlow::Bye {
            break;
        }
    }
    drop(fs);
    ssh.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hello_is_framed() {
        assert!(NETCONF_HELLO.starts_with("<?xml"));
        assert!(NETCONF_HELLO.ends_with(NETCONF_EOM));
        assert_eq!(NETCONF_HELLO.matches(NETCONF_EOM).count(), 1);
    }

    #[test]
    fn test_label() {
        let mut target = SshTarget {
            host: "r1".into(),
            port: 22,
            user: None,
            password: None,
            passphrase: None,
            subsystem: None,
        };
        assert_eq!(label(&target), "r1:22");
        target.user = Some("admin".into());
        assert_eq!(label(&target), "admin@r1:22");
    }
}
