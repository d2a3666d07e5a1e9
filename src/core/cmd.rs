//! Command table
//!
//! Lines starting with `!` name a command (`!Waitfor login:`). Names are
//! case sensitive, so a lowercase `!ls` that matches nothing runs as a
//! local process when the host is idle. Other lines are sent to the host
//! as a command, or used as a connection string while idle.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::session::Session;
use super::ssh::scp::{
    has_wildcard, parse_listing, plan_download, plan_upload, run_downloads, run_uploads, split_remote,
    ScpTransfer,
};
use super::ssh::tunnel::{parse_forward, tun_local};
use crate::config::expand_home;

pub const PREFIX: char = '!';

type Handler = fn(&Session, &str) -> String;

const COMMANDS: &[(&str, Handler, &str)] = &[
    ("Clear", clear, "clear the screen and scrollback"),
    ("Log", log, "[file]  capture received bytes to file, or stop"),
    ("Find", find, "text  search backwards and select"),
    ("Disp", disp, "text  show text on the terminal"),
    ("Send", send, "text  send text and CR to the host"),
    ("Echo", echo, "[on|off]  local echo"),
    ("Timeout", timeout, "[secs]  how long waits last"),
    ("Prompt", prompt, "[text]  set the prompt, or learn it from the screen"),
    ("scp", scp, "get remote [local] | put local [remote]  (wildcards allowed)"),
    ("tun", tun, "[list] | [lhost:]lport rhost:rport | close id"),
    ("xmodem", xmodem, "file  upload with XMODEM"),
    ("Wait", wait, "secs  pause"),
    ("Waitfor", waitfor, "text  wait for text to arrive"),
    ("Hostname", hostname, "current connection"),
    ("Selection", selection, "selected text"),
    ("Recv", recv, "text received since the last mark"),
    ("Help", help, "this list"),
];

/// Run one command line and return its reply
pub fn run(session: &Session, text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let host = session.host();

    if let Some(rest) = text.strip_prefix(PREFIX) {
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        if let Some((_, handler, _)) = COMMANDS.iter().find(|(n, ..)| *n == name) {
            debug!("command {} {}", name, args);
            return handler(session, args);
        }
        if !host.is_idle() {
            return format!("unknown command '{}', try {}Help", name, PREFIX);
        }
    }

    if host.is_connected() && !text.eq_ignore_ascii_case("disconnect") {
        return session.command(text);
    }
    match host.open(text) {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

/// Expand `\r`, `\n`, `\t`, `\e`, `\\` and `\xHH`
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('e') => out.push('\x1b'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let hex: String = chars.clone().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(b) if hex.len() == 2 && b < 0x80 => {
                        out.push(b as char);
                        chars.next();
                        chars.next();
                    }
                    _ => out.push_str("\\x"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn clear(session: &Session, _args: &str) -> String {
    session.term().lock().clear();
    String::new()
}

fn log(session: &Session, args: &str) -> String {
    let mut term = session.term().lock();
    if args.is_empty() {
        return if term.stop_capture() {
            "log closed".to_string()
        } else {
            "not logging".to_string()
        };
    }
    let path = expand_home(args);
    match term.start_capture(&path) {
        Ok(()) => format!("logging to {}", path.display()),
        Err(e) => format!("{}: {}", path.display(), e),
    }
}

fn find(session: &Session, args: &str) -> String {
    if args.is_empty() {
        return String::new();
    }
    let mut term = session.term().lock();
    if term.find(args) {
        term.buf.selection_text().unwrap_or_default()
    } else {
        String::new()
    }
}

fn disp(session: &Session, args: &str) -> String {
    session.term().lock().disp(&format!("{}\r\n", unescape(args)));
    String::new()
}

fn send(session: &Session, args: &str) -> String {
    let data = format!("{}\r", unescape(args));
    match session.host().send(data.as_bytes()) {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

fn echo(session: &Session, args: &str) -> String {
    let mut term = session.term().lock();
    match args {
        "on" => term.set_local_echo(true),
        "off" => term.set_local_echo(false),
        "" => {}
        _ => return "usage: !Echo [on|off]".to_string(),
    }
    format!("echo {}", if term.local_echo() { "on" } else { "off" })
}

fn timeout(session: &Session, args: &str) -> String {
    if !args.is_empty() {
        match args.parse::<u64>() {
            Ok(secs) => session.bridge().set_timeout(secs),
            Err(_) => return format!("'{}' is not a number of seconds", args),
        }
    }
    format!("timeout {}s", session.bridge().timeout())
}

fn prompt(session: &Session, args: &str) -> String {
    let mut term = session.term().lock();
    if args.is_empty() {
        term.learn_prompt();
    } else {
        term.set_prompt(&unescape(args));
    }
    format!("prompt '{}'", String::from_utf8_lossy(term.prompt()))
}

fn wait(session: &Session, args: &str) -> String {
    match args.parse::<u64>() {
        Ok(secs) => {
            session.bridge().wait(secs);
            String::new()
        }
        Err(_) => "usage: !Wait secs".to_string(),
    }
}

fn waitfor(session: &Session, args: &str) -> String {
    let bridge = session.bridge();
    bridge.wait_for(&unescape(args), bridge.timeout()).unwrap_or_default()
}

fn hostname(session: &Session, _args: &str) -> String {
    let host = session.host();
    if host.is_idle() {
        String::new()
    } else {
        host.hostname()
    }
}

fn selection(session: &Session, _args: &str) -> String {
    session.copy().unwrap_or_default()
}

fn recv(session: &Session, _args: &str) -> String {
    let mut term = session.term().lock();
    let len = term.unread_len();
    term.consume_unread(len)
}

fn help(_session: &Session, _args: &str) -> String {
    COMMANDS
        .iter()
        .map(|(name, _, usage)| format!("{}{} {}", PREFIX, name, usage))
        .collect::<Vec<_>>()
        .join("\n")
}

fn xmodem(session: &Session, args: &str) -> String {
    if args.is_empty() {
        return "usage: !xmodem file".to_string();
    }
    match session.xmodem_send(&expand_home(args)) {
        Ok(n) => format!("{} bytes sent", n),
        Err(e) => format!("xmodem: {}", e),
    }
}

fn tun(session: &Session, args: &str) -> String {
    let host = session.host();
    let words: Vec<&str> = args.split_whitespace().collect();
    match words.as_slice() {
        [] | ["list"] => {
            let tunnels = host.tunnels().list();
            if tunnels.is_empty() {
                return "no tunnels".to_string();
            }
            tunnels
                .iter()
                .map(|t| format!("{}: {} -> {} ({} open)", t.id, t.local, t.remote, t.connections))
                .collect::<Vec<_>>()
                .join("\n")
        }
        ["close", id] => match id.parse::<usize>() {
            Ok(id) if host.tunnels().close(id) => format!("tunnel {} closed", id),
            _ => format!("no tunnel {}", id),
        },
        [local, remote] => {
            let Some(ssh) = host.ssh() else {
                return "tunnels need an ssh connection".to_string();
            };
            let (bind, rhost, rport) = match parse_forward(local, remote) {
                Ok(parts) => parts,
                Err(e) => return e,
            };
            match tun_local(ssh, host.tunnels(), &bind, &rhost, rport) {
                Ok(id) => format!("tunnel {}: {} -> {}:{}", id, bind, rhost, rport),
                Err(e) => format!("tunnel failed: {}", e),
            }
        }
        _ => "usage: !tun [list] | [lhost:]lport rhost:rport | close id".to_string(),
    }
}

fn local_target(local: Option<&str>, name: &str) -> PathBuf {
    match local.map(expand_home) {
        Some(path) if path.is_dir() => path.join(name),
        Some(path) => path,
        None => PathBuf::from(name),
    }
}

fn scp(session: &Session, args: &str) -> String {
    const USAGE: &str = "usage: !scp get remote [local] | put local [remote]";
    let host = session.host();
    let Some(ssh) = host.ssh() else {
        return "scp needs an ssh connection".to_string();
    };
    let chunk = session.config().transfer.chunk_size;
    let term = session.term().clone();
    let mut report = |line: &str| term.lock().disp(line);
    let mut errors = |line: &str| term.lock().disp_error(line);
    let words: Vec<&str> = args.split_whitespace().collect();

    match words.as_slice() {
        ["get", remote, rest @ ..] if rest.len() <= 1 => {
            let local = rest.first().copied();
            if has_wildcard(remote) {
                let (dir, pattern) = split_remote(remote);
                let listing = session.command(&format!("ls -1 {}", dir));
                let names = parse_listing(&listing);
                let local_dir = local.map_or_else(|| PathBuf::from("."), expand_home);
                let plan = plan_download(&names, dir, pattern, &local_dir);
                info!("scp get {}: {} of {} names match", remote, plan.len(), names.len());
                let mut xfer = ScpTransfer::new(&ssh, chunk, &mut report);
                let done = run_downloads(&mut xfer, &plan, &mut errors);
                format!("{} of {} file(s) copied", done, plan.len())
            } else {
                let (_, name) = split_remote(remote);
                let target = local_target(local, name);
                match ssh.scp_read_one(remote, &target, chunk, &mut report) {
                    Ok(n) => format!("{} bytes copied", n),
                    Err(e) => e.to_string(),
                }
            }
        }
        ["put", local, rest @ ..] if rest.len() <= 1 => {
            let remote = rest.first().copied();
            let source = expand_home(local);
            if has_wildcard(local) {
                let dir = source
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
                let pattern = source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let plan = match plan_upload(&dir, &pattern, remote.unwrap_or(".")) {
                    Ok(plan) => plan,
                    Err(e) => return format!("{}: {}", dir.display(), e),
                };
                let mut xfer = ScpTransfer::new(&ssh, chunk, &mut report);
                let done = run_uploads(&mut xfer, &plan, &mut errors);
                format!("{} of {} file(s) copied", done, plan.len())
            } else {
                let name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let target = remote.map_or(name, str::to_string);
                match ssh.scp_write_one(&source, &target, chunk, &mut report) {
                    Ok(n) => format!("{} bytes copied", n),
                    Err(e) => e.to_string(),
                }
            }
        }
        _ => USAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(Config {
            wait_timeout: 1,
            local_edit: false,
            ..Config::default()
        })
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\r\nb"), "a\r\nb");
        assert_eq!(unescape(r"\x03"), "\x03");
        assert_eq!(unescape(r"\e[0m"), "\x1b[0m");
        assert_eq!(unescape(r"c:\\dir"), r"c:\dir");
        assert_eq!(unescape(r"\xZZ\q"), r"\xZZ\q");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn test_disp_find_selection() {
        let s = session();
        assert_eq!(run(&s, "!Disp first line"), "");
        assert_eq!(run(&s, "!Disp second line"), "");
        assert_eq!(run(&s, "!Find first"), "first");
        assert_eq!(run(&s, "!Selection"), "first");
        assert_eq!(run(&s, "!Find missing"), "");
    }

    #[test]
    fn test_timeout_echo_prompt() {
        let s = session();
        assert_eq!(run(&s, "!Timeout 7"), "timeout 7s");
        assert_eq!(s.bridge().timeout(), 7);
        assert!(run(&s, "!Timeout soon").contains("not a number"));

        assert_eq!(run(&s, "!Echo on"), "echo on");
        assert!(s.term().lock().local_echo());
        assert_eq!(run(&s, "!Echo"), "echo on");
        assert_eq!(run(&s, "!Echo off"), "echo off");

        assert_eq!(run(&s, "!Prompt #"), "prompt '#'");
        s.term().lock().parse(b"router$ ");
        assert_eq!(run(&s, "!Prompt"), "prompt '$ '");
    }

    #[test]
    fn test_recv_advances_mark() {
        let s = session();
        s.term().lock().parse(b"abc\r\ndef");
        assert_eq!(run(&s, "!Recv"), "abc\ndef");
        assert_eq!(run(&s, "!Recv"), "");
    }

    #[test]
    fn test_clear_and_hostname_when_idle() {
        let s = session();
        s.term().lock().parse(b"junk");
        assert_eq!(run(&s, "!Clear"), "");
        assert_eq!(s.term().lock().buf.cursor_x(), 0);
        assert_eq!(run(&s, "!Hostname"), "");
    }

    #[test]
    fn test_log_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap.log");
        let s = session();
        assert!(run(&s, &format!("!Log {}", path.display())).starts_with("logging to"));
        s.term().lock().parse(b"captured");
        assert_eq!(run(&s, "!Log"), "log closed");
        assert_eq!(run(&s, "!Log"), "not logging");
        assert_eq!(fs::read(&path).unwrap(), b"captured");
    }

    #[test]
    fn test_ssh_commands_need_ssh() {
        let s = session();
        assert_eq!(run(&s, "!scp get a.txt"), "scp needs an ssh connection");
        assert_eq!(run(&s, "!tun 8080 web:80"), "tunnels need an ssh connection");
        assert_eq!(run(&s, "!tun"), "no tunnels");
        assert_eq!(run(&s, "!tun close 4"), "no tunnel 4");
        assert_eq!(run(&s, "!xmodem"), "usage: !xmodem file");
    }

    #[test]
    fn test_help_lists_every_command() {
        let s = session();
        let help = run(&s, "!Help");
        assert_eq!(help.lines().count(), COMMANDS.len());
        assert!(help.contains("!Waitfor text"));
    }

    #[test]
    fn test_bad_connection_string_is_reported() {
        let s = session();
        assert_eq!(run(&s, "telnet"), "missing host name");
        assert!(s.host().is_idle());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_command_runs_process_when_idle() {
        let s = session();
        assert_eq!(run(&s, "!printf cmd-table"), "");
        assert!(s.host().wait_idle(Duration::from_secs(5)));
        let text = s.term().lock().buf.screen_lines().join("\n");
        assert!(text.contains("cmd-table"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_command_while_busy() {
        let s = session();
        run(&s, "sleep 5");
        for _ in 0..200 {
            if s.host().is_connected() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(run(&s, "!bogus"), "unknown command 'bogus', try !Help");
        assert_eq!(run(&s, "disconnect"), "");
        assert!(s.host().wait_idle(Duration::from_secs(5)));
    }
}
