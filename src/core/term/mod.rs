//! Terminal emulation
//!
//! [`Terminal`] couples the screen buffer with the VT parser and keeps the
//! per-connection extras: inline telnet negotiation, netconf XML
//! formatting, prompt tracking for scripted commands and session capture.

pub mod buffer;
pub mod parser;
pub mod telnet;
pub mod xml;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

pub use buffer::{ScreenBuffer, Snapshot, TerminalModes, DEFAULT_ATTR};
use parser::VtParser;
use telnet::{Negotiation, TelnetOptions, IAC, MAX_PENDING};
use xml::XmlPrettyPrinter;

/// Terminal shared between the reader thread and callers
pub type SharedTerminal = Arc<Mutex<Terminal>>;

/// Red on black, for locally generated error lines
const ERROR_ATTR: u8 = 0x09;

pub struct Terminal {
    pub buf: ScreenBuffer,
    parser: VtParser,
    telnet: Option<TelnetOptions>,
    /// Tail of an IAC command cut off at the end of a read
    pending_iac: Vec<u8>,
    replies: Vec<u8>,
    xml: Option<XmlPrettyPrinter>,
    prompt: Vec<u8>,
    prompt_observed: bool,
    auto_learn: bool,
    local_echo: bool,
    capture: Option<File>,
    title: Option<String>,
}

impl Terminal {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self::with_buffer(ScreenBuffer::new(cols, rows))
    }

    pub fn with_buffer(buf: ScreenBuffer) -> Self {
        Self {
            buf,
            parser: VtParser::new(),
            telnet: None,
            pending_iac: Vec::new(),
            replies: Vec::new(),
            xml: None,
            prompt: Vec::new(),
            prompt_observed: false,
            auto_learn: true,
            local_echo: false,
            capture: None,
            title: None,
        }
    }

    pub fn shared(self) -> SharedTerminal {
        Arc::new(Mutex::new(self))
    }

    /// Interpret bytes received from the host
    pub fn parse(&mut self, data: &[u8]) {
        if let Some(file) = &mut self.capture {
            if let Err(e) = file.write_all(data) {
                tracing::warn!("capture write failed, closing log: {}", e);
                self.capture = None;
            }
        }

        let formatted;
        let data = match &mut self.xml {
            Some(pretty) => {
                formatted = pretty.feed(data);
                &formatted[..]
            }
            None => data,
        };

        if self.telnet.is_some() {
            self.parse_telnet(data);
        } else {
            self.feed(data);
        }

        self.buf.clamp_mark();
        self.detect_prompt();
    }

    fn feed(&mut self, data: &[u8]) {
        for &b in data {
            if let Some(reply) = self.parser.feed(b, &mut self.buf) {
                self.replies.extend_from_slice(&reply.to_bytes());
            }
        }
        if let Some(title) = self.parser.take_title() {
            self.title = Some(title);
        }
    }

    fn parse_telnet(&mut self, data: &[u8]) {
        let joined;
        let data = if self.pending_iac.is_empty() {
            data
        } else {
            let mut v = std::mem::take(&mut self.pending_iac);
            v.extend_from_slice(data);
            joined = v;
            &joined[..]
        };

        let Some(opts) = self.telnet.as_mut() else {
            return;
        };
        let mut replies = Vec::new();
        let mut text = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            if data[i] != IAC {
                text.push(data[i]);
                i += 1;
                continue;
            }
            match opts.negotiate(data, i, &mut replies) {
                Negotiation::Consumed(next) => i = next,
                Negotiation::Literal(next) => {
                    text.push(IAC);
                    i = next;
                }
                Negotiation::Incomplete if data.len() - i > MAX_PENDING => {
                    tracing::warn!("telnet: unterminated subnegotiation dropped");
                    // skip IAC SB <option> and show the rest as text
                    i += 3;
                }
                Negotiation::Incomplete => {
                    self.pending_iac = data[i..].to_vec();
                    break;
                }
            }
        }
        self.local_echo = opts.local_echo;
        self.replies.extend_from_slice(&replies);
        self.feed(&text);
    }

    fn detect_prompt(&mut self) {
        let plen = self.prompt.len();
        if self.prompt_observed || plen == 0 {
            return;
        }
        let x = self.buf.cursor_x();
        if x >= self.buf.mark() + plen && self.buf.cells()[x - plen..x] == self.prompt[..] {
            self.prompt_observed = true;
        }
    }

    /// Show locally generated text without touching prompt state
    pub fn disp(&mut self, text: &str) {
        self.disp_bytes(text.as_bytes());
    }

    pub fn disp_bytes(&mut self, bytes: &[u8]) {
        self.feed(bytes);
        self.buf.clamp_mark();
    }

    /// Show an error line in red
    pub fn disp_error(&mut self, text: &str) {
        let saved = (self.buf.attr, self.buf.reverse);
        if self.buf.cursor_col() > 0 {
            self.feed(b"\r\n");
        }
        self.buf.attr = ERROR_ATTR;
        self.buf.reverse = false;
        self.feed(text.as_bytes());
        (self.buf.attr, self.buf.reverse) = saved;
        self.feed(b"\r\n");
        self.buf.clamp_mark();
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.parser.reset();
        self.pending_iac.clear();
        if let Some(xml) = &mut self.xml {
            xml.reset();
        }
        self.prompt_observed = false;
    }

    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.buf.resize(cols, rows);
    }

    // ---- prompt tracking ----

    /// Take the two bytes before the cursor as the prompt
    pub fn learn_prompt(&mut self) {
        let x = self.buf.cursor_x();
        let start = self.buf.line_range(self.buf.cursor_y()).start;
        if x >= start + 2 {
            self.prompt = self.buf.cells()[x - 2..x].to_vec();
            tracing::debug!("learned prompt {:?}", String::from_utf8_lossy(&self.prompt));
        }
    }

    pub fn set_prompt(&mut self, prompt: &str) {
        self.prompt = prompt.as_bytes().to_vec();
        self.prompt_observed = false;
    }

    pub fn prompt(&self) -> &[u8] {
        &self.prompt
    }

    pub fn auto_learn(&self) -> bool {
        self.auto_learn
    }

    /// Start a scripted exchange: unread text begins at the cursor and the
    /// prompt is no longer relearned from keystrokes
    pub fn mark_prompt(&mut self) {
        self.buf.set_mark();
        self.prompt_observed = false;
        self.auto_learn = false;
    }

    /// Move the mark to the cursor without changing auto-learning
    pub fn reset_mark(&mut self) {
        self.buf.set_mark();
        self.prompt_observed = false;
    }

    pub fn rearm_prompt(&mut self) {
        self.auto_learn = true;
    }

    pub fn prompt_observed(&self) -> bool {
        self.prompt_observed
    }

    pub fn unread_len(&self) -> usize {
        self.buf.unread_len()
    }

    pub fn unread_text(&self) -> String {
        self.buf.unread_text()
    }

    /// Text from the mark up to `len` unread bytes, then advance the mark
    pub fn consume_unread(&mut self, len: usize) -> String {
        let start = self.buf.mark();
        let end = (start + len).min(self.buf.cursor_x());
        let text = self.buf.text_range(start, end);
        self.buf.set_mark_at(end);
        text
    }

    // ---- connection flags ----

    pub fn set_telnet(&mut self, term_type: Option<&str>) {
        self.telnet = term_type.map(TelnetOptions::new);
        self.pending_iac.clear();
    }

    pub fn is_telnet(&self) -> bool {
        self.telnet.is_some()
    }

    pub fn local_echo(&self) -> bool {
        self.local_echo
    }

    pub fn set_local_echo(&mut self, on: bool) {
        self.local_echo = on;
        if let Some(opts) = &mut self.telnet {
            opts.local_echo = on;
        }
    }

    pub fn set_xml_mode(&mut self, on: bool) {
        self.xml = on.then(XmlPrettyPrinter::new);
    }

    pub fn xml_mode(&self) -> bool {
        self.xml.is_some()
    }

    // ---- capture ----

    pub fn start_capture(&mut self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.capture = Some(file);
        tracing::info!("capturing session to {}", path.display());
        Ok(())
    }

    pub fn stop_capture(&mut self) -> bool {
        self.capture.take().is_some()
    }

    pub fn capturing(&self) -> bool {
        self.capture.is_some()
    }

    // ---- outputs drained by the host ----

    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replies)
    }

    pub fn take_bell(&mut self) -> bool {
        self.parser.take_bell()
    }

    pub fn take_title(&mut self) -> Option<String> {
        self.title.take()
    }

    pub fn find(&mut self, text: &str) -> bool {
        self.buf.find(text.as_bytes()).is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.buf.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use telnet::{DO, OPT_ECHO, OPT_TTYPE, SB, WILL};

    #[test]
    fn test_printable_round_trip() {
        let mut term = Terminal::new(80, 24);
        term.parse(b"abc");
        assert_eq!(term.buf.cells(), b"abc");
        assert_eq!(term.buf.cursor_x(), 3);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut term = Terminal::new(80, 24);
        term.parse(b"some text\r\nmore");
        term.clear();
        term.clear();
        term.parse(b"");
        assert_eq!(term.buf.cursor_row(), 0);
        assert_eq!(term.buf.cursor_col(), 0);
        assert_eq!(term.buf.line_count(), 1);
        assert!(term.buf.cells().is_empty());
    }

    #[test]
    fn test_telnet_do_echo_reply() {
        let mut term = Terminal::new(80, 24);
        term.set_telnet(Some("vt100"));
        term.parse(&[IAC, DO, OPT_ECHO, b'o', b'k']);
        assert_eq!(term.take_replies(), vec![IAC, WILL, OPT_ECHO]);
        assert!(!term.local_echo());
        assert_eq!(term.buf.cells(), b"ok");
    }

    #[test]
    fn test_telnet_command_split_across_reads() {
        let mut term = Terminal::new(80, 24);
        term.set_telnet(Some("vt100"));
        term.parse(&[b'a', IAC]);
        term.parse(&[WILL, OPT_ECHO, b'b']);
        assert_eq!(term.buf.cells(), b"ab");
        assert!(term.local_echo());
        assert_eq!(term.take_replies(), vec![IAC, DO, OPT_ECHO]);
    }

    #[test]
    fn test_unterminated_subnegotiation_is_dropped() {
        let mut term = Terminal::new(80, 24);
        term.set_telnet(Some("vt100"));
        term.parse(&[IAC, SB, OPT_TTYPE]);
        for _ in 0..100 {
            term.parse(b"hello\r\n");
            assert!(term.pending_iac.len() <= MAX_PENDING);
        }
        assert!(term.buf.screen_lines().iter().any(|line| line.contains("hello")));

        // negotiation still works afterwards
        term.parse(&[IAC, DO, OPT_ECHO]);
        assert_eq!(term.take_replies(), vec![IAC, WILL, OPT_ECHO]);
    }

    #[test]
    fn test_iac_is_text_without_telnet() {
        let mut term = Terminal::new(80, 24);
        term.parse(&[b'a', IAC, DO, b'b']);
        assert_eq!(term.buf.cells(), &[b'a', IAC, DO, b'b']);
        assert!(term.take_replies().is_empty());
    }

    #[test]
    fn test_prompt_count_includes_prompt() {
        let mut term = Terminal::new(80, 24);
        term.set_prompt("> ");
        term.mark_prompt();
        term.parse(b"output\r\n> ");
        assert!(term.prompt_observed());
        assert_eq!(term.unread_len(), 8);
        assert_eq!(term.unread_text(), "output\n> ");
    }

    #[test]
    fn test_prompt_before_mark_is_not_observed() {
        let mut term = Terminal::new(80, 24);
        term.set_prompt("> ");
        term.parse(b"> ");
        term.mark_prompt();
        term.parse(b"");
        assert!(!term.prompt_observed());
    }

    #[test]
    fn test_learn_prompt() {
        let mut term = Terminal::new(80, 24);
        term.parse(b"router# ");
        term.learn_prompt();
        assert_eq!(term.prompt(), b"# ");
    }

    #[test]
    fn test_device_attribute_reply_collected() {
        let mut term = Terminal::new(80, 24);
        term.parse(b"\x1b[c");
        assert_eq!(term.take_replies(), b"\x1b[?1;2c".to_vec());
    }

    #[test]
    fn test_error_line_is_red() {
        let mut term = Terminal::new(80, 24);
        term.disp_error("boom");
        assert_eq!(term.buf.attrs()[0], ERROR_ATTR);
        assert_eq!(term.buf.attr, DEFAULT_ATTR);
        assert_eq!(term.buf.cursor_row(), 1);
    }

    #[test]
    fn test_capture_appends_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut term = Terminal::new(80, 24);
        term.start_capture(&path).unwrap();
        term.parse(b"\x1b[31mred\x1b[0m\r\n");
        assert!(term.stop_capture());
        let logged = std::fs::read(&path).unwrap();
        assert_eq!(logged, b"\x1b[31mred\x1b[0m\r\n".to_vec());
    }

    #[test]
    fn test_xml_mode_indents() {
        let mut term = Terminal::new(80, 24);
        term.set_xml_mode(true);
        term.parse(b"<a><b>1</b></a>");
        assert_eq!(term.buf.screen_lines()[1], "<a>");
        assert_eq!(term.buf.screen_lines()[2], "  <b>1</b>");
    }
}
