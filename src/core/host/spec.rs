//! Connection strings
//!
//! ```text
//! com1:9600,n,8,1          serial port (defaults 9600,n,8,1)
//! telnet host[:port]
//! ssh [-l user] [-pw pass] [-pp passphrase] [-P port] [-s subsystem] [user@]host[:port]
//! sftp ...                 same options as ssh
//! netconf [user@]host[:port]
//! disconnect
//! anything else            run as a local command ("!cmd" also accepted)
//! ```

use std::fmt;

use super::{HostError, HostKind};

pub const TELNET_PORT: u16 = 23;
pub const SSH_PORT: u16 = 22;
pub const NETCONF_PORT: u16 = 830;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSpec {
    pub port: String,
    pub baud: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub passphrase: Option<String>,
    pub subsystem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectSpec {
    Serial(SerialSpec),
    Telnet { host: String, port: u16 },
    Ssh(SshTarget),
    Sftp(SshTarget),
    Netconf(SshTarget),
    Process(String),
    Disconnect,
}

impl ConnectSpec {
    pub fn parse(spec: &str) -> Result<Self, HostError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(HostError::InvalidSpec("empty connection string".into()));
        }
        if let Some(command) = spec.strip_prefix('!') {
            return Ok(ConnectSpec::Process(command.trim().to_string()));
        }
        if spec.eq_ignore_ascii_case("disconnect") {
            return Ok(ConnectSpec::Disconnect);
        }

        let (word, rest) = match spec.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (spec, ""),
        };
        match word.to_ascii_lowercase().as_str() {
            "telnet" => {
                let (host, port) = split_host_port(rest, TELNET_PORT)?;
                Ok(ConnectSpec::Telnet { host, port })
            }
            "ssh" => {
                let target = parse_ssh_args(rest, SSH_PORT)?;
                if target.subsystem.as_deref() == Some("netconf") {
                    Ok(ConnectSpec::Netconf(target))
                } else {
                    Ok(ConnectSpec::Ssh(target))
                }
            }
            "sftp" => Ok(ConnectSpec::Sftp(parse_ssh_args(rest, SSH_PORT)?)),
            "netconf" => {
                let mut target = parse_ssh_args(rest, NETCONF_PORT)?;
                target.subsystem = Some("netconf".into());
                Ok(ConnectSpec::Netconf(target))
            }
            w if is_serial_name(w) => Ok(ConnectSpec::Serial(parse_serial(spec)?)),
            _ => Ok(ConnectSpec::Process(spec.to_string())),
        }
    }

    pub fn kind(&self) -> HostKind {
        match self {
            ConnectSpec::Serial(_) => HostKind::Serial,
            ConnectSpec::Telnet { .. } => HostKind::Telnet,
            ConnectSpec::Ssh(_) => HostKind::Ssh,
            ConnectSpec::Sftp(_) => HostKind::Sftp,
            ConnectSpec::Netconf(_) => HostKind::Netconf,
            ConnectSpec::Process(_) => HostKind::LocalProcess,
            ConnectSpec::Disconnect => HostKind::None,
        }
    }

    /// Short name shown in the title and status line
    pub fn hostname(&self) -> String {
        match self {
            ConnectSpec::Serial(s) => s.port.clone(),
            ConnectSpec::Telnet { host, .. } => host.clone(),
            ConnectSpec::Ssh(t) | ConnectSpec::Sftp(t) | ConnectSpec::Netconf(t) => match &t.user {
                Some(user) => format!("{}@{}", user, t.host),
                None => t.host.clone(),
            },
            ConnectSpec::Process(cmd) => cmd.split_whitespace().next().unwrap_or("").to_string(),
            ConnectSpec::Disconnect => String::new(),
        }
    }
}

impl fmt::Display for ConnectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectSpec::Serial(s) => write!(
                f,
                "{}:{},{},{},{}",
                s.port,
                s.baud,
                match s.parity {
                    Parity::None => 'n',
                    Parity::Even => 'e',
                    Parity::Odd => 'o',
                },
                s.data_bits,
                s.stop_bits
            ),
            ConnectSpec::Telnet { host, port } => write!(f, "telnet {}:{}", host, port),
            ConnectSpec::Ssh(t) => write!(f, "ssh {}:{}", self.hostname(), t.port),
            ConnectSpec::Sftp(t) => write!(f, "sftp {}:{}", self.hostname(), t.port),
            ConnectSpec::Netconf(t) => write!(f, "netconf {}:{}", self.hostname(), t.port),
            ConnectSpec::Process(cmd) => write!(f, "!{}", cmd),
            ConnectSpec::Disconnect => f.write_str("disconnect"),
        }
    }
}

fn is_serial_name(word: &str) -> bool {
    let name = word.split(':').next().unwrap_or("");
    let com = name.len() > 3
        && name.starts_with("com")
        && name[3..].bytes().all(|b| b.is_ascii_digit());
    com || word.starts_with("/dev/tty")
}

fn parse_serial(spec: &str) -> Result<SerialSpec, HostError> {
    let (name, settings) = match spec.split_once(':') {
        Some((n, s)) => (n, s),
        None => (spec, ""),
    };
    let mut serial = SerialSpec {
        port: device_name(name),
        baud: 9600,
        parity: Parity::None,
        data_bits: 8,
        stop_bits: 1,
    };
    let invalid = |what: &str| HostError::InvalidSpec(format!("bad {} in '{}'", what, spec));
    for (i, field) in settings.split(',').map(str::trim).enumerate() {
        if field.is_empty() {
            continue;
        }
        match i {
            0 => serial.baud = field.parse().map_err(|_| invalid("baud rate"))?,
            1 => {
                serial.parity = match field.to_ascii_lowercase().as_str() {
                    "n" => Parity::None,
                    "e" => Parity::Even,
                    "o" => Parity::Odd,
                    _ => return Err(invalid("parity")),
                }
            }
            2 => {
                serial.data_bits = match field.parse() {
                    Ok(bits @ 5..=8) => bits,
                    _ => return Err(invalid("data bits")),
                }
            }
            3 => {
                serial.stop_bits = match field.parse() {
                    Ok(bits @ 1..=2) => bits,
                    _ => return Err(invalid("stop bits")),
                }
            }
            _ => return Err(invalid("serial setting")),
        }
    }
    Ok(serial)
}

/// Map "comN" to the platform device name
fn device_name(name: &str) -> String {
    if cfg!(windows) {
        return name.to_uppercase();
    }
    match name.strip_prefix("com").and_then(|n| n.parse::<u32>().ok()) {
        Some(n) if n > 0 => format!("/dev/ttyS{}", n - 1),
        _ => name.to_string(),
    }
}

fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16), HostError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(HostError::InvalidSpec("missing host name".into()));
    }
    // A bare IPv6 address has more than one colon and no port
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| HostError::InvalidSpec(format!("bad port '{}'", port)))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((s.to_string(), default_port)),
    }
}

fn parse_ssh_args(args: &str, default_port: u16) -> Result<SshTarget, HostError> {
    let mut target = SshTarget {
        host: String::new(),
        port: default_port,
        user: None,
        password: None,
        passphrase: None,
        subsystem: None,
    };
    let mut explicit_port = None;
    let mut tokens = args.split_whitespace();
    while let Some(token) = tokens.next() {
        let mut value = |flag: &str| {
            tokens
                .next()
                .map(str::to_string)
                .ok_or_else(|| HostError::InvalidSpec(format!("{} needs a value", flag)))
        };
        match token {
            "-l" => target.user = Some(value(token)?),
            "-pw" => target.password = Some(value(token)?),
            "-pp" => target.passphrase = Some(value(token)?),
            "-P" => {
                let port = value(token)?;
                explicit_port = Some(
                    port.parse()
                        .map_err(|_| HostError::InvalidSpec(format!("bad port '{}'", port)))?,
                );
            }
            "-s" => target.subsystem = Some(value(token)?),
            host => {
                let host = match host.split_once('@') {
                    Some((user, host)) => {
                        target.user = Some(user.to_string());
                        host
                    }
                    None => host,
                };
                let (host, port) = split_host_port(host, default_port)?;
                target.host = host;
                target.port = port;
            }
        }
    }
    if target.host.is_empty() {
        return Err(HostError::InvalidSpec("missing host name".into()));
    }
    if let Some(port) = explicit_port {
        target.port = port;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serial_defaults() {
        let ConnectSpec::Serial(s) = ConnectSpec::parse("com1").unwrap() else {
            panic!("not serial");
        };
        assert_eq!(s.baud, 9600);
        assert_eq!(s.parity, Parity::None);
        assert_eq!((s.data_bits, s.stop_bits), (8, 1));
        if cfg!(unix) {
            assert_eq!(s.port, "/dev/ttyS0");
        }
    }

    #[test]
    fn test_serial_settings() {
        let ConnectSpec::Serial(s) = ConnectSpec::parse("com3:115200,e,7,2").unwrap() else {
            panic!("not serial");
        };
        assert_eq!(s.baud, 115200);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!((s.data_bits, s.stop_bits), (7, 2));
        assert!(ConnectSpec::parse("com1:fast").is_err());
    }

    #[test]
    fn test_telnet_port() {
        assert_eq!(
            ConnectSpec::parse("telnet 10.0.0.1").unwrap(),
            ConnectSpec::Telnet {
                host: "10.0.0.1".into(),
                port: 23
            }
        );
        assert_eq!(
            ConnectSpec::parse("telnet switch:2323").unwrap(),
            ConnectSpec::Telnet {
                host: "switch".into(),
                port: 2323
            }
        );
    }

    #[test]
    fn test_ssh_flags() {
        let spec = ConnectSpec::parse("ssh -l admin -pw secret -P 2222 router").unwrap();
        let ConnectSpec::Ssh(t) = spec else {
            panic!("not ssh");
        };
        assert_eq!(t.host, "router");
        assert_eq!(t.port, 2222);
        assert_eq!(t.user.as_deref(), Some("admin"));
        assert_eq!(t.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_ssh_user_at_host() {
        let ConnectSpec::Sftp(t) = ConnectSpec::parse("sftp bob@files:2200").unwrap() else {
            panic!("not sftp");
        };
        assert_eq!(t.user.as_deref(), Some("bob"));
        assert_eq!((t.host.as_str(), t.port), ("files", 2200));
    }

    #[test]
    fn test_netconf_forms() {
        let ConnectSpec::Netconf(t) = ConnectSpec::parse("netconf r1").unwrap() else {
            panic!("not netconf");
        };
        assert_eq!(t.port, 830);
        assert!(matches!(
            ConnectSpec::parse("ssh -s netconf r1").unwrap(),
            ConnectSpec::Netconf(SshTarget { port: 22, .. })
        ));
    }

    #[test]
    fn test_process_and_disconnect() {
        assert_eq!(
            ConnectSpec::parse("!ping -c 1 localhost").unwrap(),
            ConnectSpec::Process("ping -c 1 localhost".into())
        );
        assert_eq!(
            ConnectSpec::parse("cat").unwrap(),
            ConnectSpec::Process("cat".into())
        );
        assert_eq!(ConnectSpec::parse("Disconnect").unwrap(), ConnectSpec::Disconnect);
        assert!(ConnectSpec::parse("ssh").is_err());
        assert!(ConnectSpec::parse("  ").is_err());
    }
}
