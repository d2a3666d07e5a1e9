//! Session management
//!
//! A [`Session`] ties one terminal to one host and the scripting bridge.
//! Keystrokes go to a pending line prompt first, then to the connection,
//! and while nothing is connected they are edited locally and run as
//! commands on Enter.

use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::cmd;
use super::host::{Host, HostError, HostKind};
use super::script::ScriptBridge;
use super::term::buffer::is_continuation;
use super::term::{ScreenBuffer, SharedTerminal, Terminal, TerminalModes};
use super::xmodem;
use crate::config::Config;

/// Prompt shown while editing a line locally
pub const LOCAL_PROMPT: &str = "> ";

const PASTE_START: &[u8] = b"\x1b[200~";
const PASTE_END: &[u8] = b"\x1b[201~";

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Screen contents changed
    Redraw,
    Bell,
    TitleChanged(String),
    Connected(String),
    Disconnected(String),
}

pub struct Session {
    term: SharedTerminal,
    host: Host,
    bridge: Arc<ScriptBridge>,
    config: Arc<Config>,
    /// Line being edited while no host is connected
    line: Vec<u8>,
    /// Next key typed on a connected host starts a new command line
    line_start: bool,
    events: Receiver<SessionEvent>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let buf = ScreenBuffer::with_limits(
            config.cols as usize,
            config.rows as usize,
            config.buffer.capacity,
            config.buffer.max_lines,
        );
        let mut terminal = Terminal::with_buffer(buf);
        terminal.set_prompt(&config.prompt);
        let term = terminal.shared();
        let bridge = Arc::new(ScriptBridge::new(term.clone(), config.wait_timeout));
        let config = Arc::new(config);
        let (tx, events) = mpsc::channel();
        let host = Host::new(term.clone(), bridge.clone(), config.clone(), Some(tx));
        Self {
            term,
            host,
            bridge,
            config,
            line: Vec::new(),
            line_start: true,
            events,
        }
    }

    pub fn term(&self) -> &SharedTerminal {
        &self.term
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn bridge(&self) -> &Arc<ScriptBridge> {
        &self.bridge
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn open(&self, spec: &str) -> Result<(), HostError> {
        self.host.open(spec)
    }

    /// Show the local prompt if keys are being edited locally
    pub fn show_local_prompt(&self) {
        if self.config.local_edit && self.host.is_idle() {
            let mut term = self.term.lock();
            if term.buf.cursor_col() > 0 {
                term.disp("\r\n");
            }
            term.disp(LOCAL_PROMPT);
        }
    }

    /// Handle keys typed at the terminal
    pub fn send_keys(&mut self, keys: &[u8]) {
        if self.bridge.feed_key(keys) {
            return;
        }
        if self.host.is_connected() {
            self.send_connected(keys);
        } else if self.host.is_idle() && self.config.local_edit {
            self.edit_local(keys);
        }
    }

    fn send_connected(&mut self, keys: &[u8]) {
        {
            let mut term = self.term.lock();
            if self.line_start && term.auto_learn() && keys.first().map_or(false, |&b| b >= 0x20) {
                term.learn_prompt();
            }
            if term.local_echo() {
                term.disp(&String::from_utf8_lossy(keys).replace('\r', "\r\n"));
            }
            term.buf.scroll_to_bottom();
        }
        self.line_start = keys.contains(&b'\r');
        if let Err(e) = self.host.send(keys) {
            // an sftp prompt has no channel to type into between lines
            if self.host.kind() == HostKind::Sftp {
                debug!("key dropped: {}", e);
            } else {
                warn!("send failed: {}", e);
                self.term.lock().disp_error(&e.to_string());
            }
        }
    }

    fn edit_local(&mut self, keys: &[u8]) {
        for &b in keys {
            match b {
                b'\r' | b'\n' => {
                    self.term.lock().disp("\r\n");
                    let line = String::from_utf8_lossy(&std::mem::take(&mut self.line)).into_owned();
                    let reply = self.cmd(line.trim());
                    if !reply.is_empty() {
                        let mut term = self.term.lock();
                        term.disp(&reply.replace('\n', "\r\n"));
                        term.disp("\r\n");
                    }
                    self.line_start = true;
                    self.show_local_prompt();
                    return;
                }
                0x08 | 0x7F => {
                    while let Some(last) = self.line.pop() {
                        if !is_continuation(last) {
                            self.term.lock().disp("\x08 \x08");
                            break;
                        }
                    }
                }
                // Ctrl-U drops the line
                0x15 => {
                    let mut term = self.term.lock();
                    for &c in &self.line {
                        if !is_continuation(c) {
                            term.disp("\x08 \x08");
                        }
                    }
                    self.line.clear();
                }
                0x1B => return,
                b if b >= 0x20 => {
                    self.line.push(b);
                    self.term.lock().disp_bytes(&[b]);
                }
                _ => {}
            }
        }
    }

    /// Paste text, bracketed when the remote asked for it
    pub fn paste(&mut self, text: &str) {
        let bracketed = self.host.is_connected()
            && self.term.lock().buf.modes.contains(TerminalModes::BRACKETED_PASTE);
        let body = text.replace("\r\n", "\r").replace('\n', "\r");
        if bracketed {
            let mut data = Vec::with_capacity(body.len() + 12);
            data.extend_from_slice(PASTE_START);
            data.extend_from_slice(body.as_bytes());
            data.extend_from_slice(PASTE_END);
            self.send_keys(&data);
        } else {
            self.send_keys(body.as_bytes());
        }
    }

    pub fn resize(&self, cols: usize, rows: usize) {
        self.host.resize(cols, rows);
    }

    /// Move the scrollback view; negative looks back into history
    pub fn scroll(&self, delta: isize) {
        self.term.lock().buf.scroll_view(delta);
    }

    pub fn copy(&self) -> Option<String> {
        self.term.lock().buf.selection_text()
    }

    /// Run a command line: `!`-prefixed commands go to the command table,
    /// anything else is sent to the host or opens one
    pub fn cmd(&self, text: &str) -> String {
        cmd::run(self, text)
    }

    /// Send one command and wait for the prompt to come back. Returns
    /// everything received in between, prompt included.
    pub fn command(&self, text: &str) -> String {
        self.term.lock().mark_prompt();
        let data = if self.host.kind() == HostKind::Netconf {
            format!("{}{}", text, super::host::NETCONF_EOM)
        } else {
            format!("{}\r", text)
        };
        if let Err(e) = self.host.send(data.as_bytes()) {
            self.term.lock().rearm_prompt();
            return format!("send failed: {}", e);
        }
        let len = self.bridge.wait_for_prompt();
        let mut term = self.term.lock();
        let reply = term.unread_text();
        term.rearm_prompt();
        debug!("'{}' returned {} bytes", text, len);
        reply
    }

    /// Next event from the host, if any
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        match self.events.try_recv() {
            Ok(event) => {
                match &event {
                    SessionEvent::Connected(_) => {
                        self.line.clear();
                        self.line_start = true;
                    }
                    SessionEvent::Disconnected(_) => self.show_local_prompt(),
                    _ => {}
                }
                Some(event)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Upload a file with XMODEM over the current connection
    pub fn xmodem_send(&self, path: &Path) -> Result<usize, String> {
        if !self.host.is_connected() {
            return Err("not connected".to_string());
        }
        let data = fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
        let (tx, rx) = mpsc::channel();
        self.host.set_tap(Some(tx));
        let total = data.len();
        let timeout = Duration::from_secs(self.bridge.timeout().max(1));
        let result = xmodem::send(
            &data,
            &mut |frame| self.host.send(frame).map_err(|e| e.to_string()),
            &rx,
            timeout,
            &mut |n| self.term.lock().disp(&format!("\rxmodem: {} of {} bytes", n, total)),
        );
        self.host.set_tap(None);
        self.term.lock().disp("\r\n");
        result.map_err(|e| e.to_string())
    }

    /// Close the connection and wait for the reader to finish
    pub fn close(&self) {
        self.host.close();
        if !self.host.wait_idle(Duration::from_secs(5)) {
            warn!("reader thread did not stop in time");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.host.set_events(None);
        self.close();
    }
}
