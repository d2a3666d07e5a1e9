//! VT sequence parser
//!
//! Parses VT100/ANSI escape sequences and applies them to a [`ScreenBuffer`].

use super::buffer::{ScreenBuffer, TerminalModes, ATTR_BOLD, DEFAULT_ATTR};

/// Longest escape sequence accepted before it is abandoned
const MAX_SEQUENCE: usize = 64;

/// Reply that needs to be sent back to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(usize, usize),
    /// Status report: terminal OK
    StatusOk,
    /// Device attributes response
    DeviceAttributes,
    /// Secondary device attributes response
    SecondaryDeviceAttributes,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            Response::StatusOk => b"\x1b[0n".to_vec(),
            // VT100 with advanced video option
            Response::DeviceAttributes => b"\x1b[?1;2c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>0;95;0c".to_vec(),
        }
    }
}

/// Parser state machine
pub struct VtParser {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    current_param: Option<u16>,
    osc_string: Vec<u8>,
    seq_len: usize,
    g0_graphics: bool,
    g1_graphics: bool,
    shifted_out: bool,
    /// CR arrived while a wrap was pending; a following non-LF byte wraps
    soft_wrap: bool,
    bell: bool,
    title: Option<String>,
}

#[derive(Clone, Copy, Default, PartialEq, Debug)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    OscString,
    EscapeInOsc,
}

impl Default for VtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl VtParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: Vec::with_capacity(16),
            intermediates: Vec::with_capacity(4),
            current_param: None,
            osc_string: Vec::new(),
            seq_len: 0,
            g0_graphics: false,
            g1_graphics: false,
            shifted_out: false,
            soft_wrap: false,
            bell: false,
            title: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn in_escape(&self) -> bool {
        self.state != ParserState::Ground
    }

    pub fn take_bell(&mut self) -> bool {
        std::mem::take(&mut self.bell)
    }

    pub fn take_title(&mut self) -> Option<String> {
        self.title.take()
    }

    /// Feed a single byte to the parser
    pub fn feed(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if self.soft_wrap {
            self.soft_wrap = false;
            if byte != b'\n' {
                buf.line_feed();
            }
        }

        if self.state != ParserState::Ground {
            self.seq_len += 1;
            if self.seq_len > MAX_SEQUENCE {
                tracing::debug!("escape sequence too long, dropped");
                self.state = ParserState::Ground;
            }
        }

        // C0 controls act immediately, even in the middle of a sequence
        let in_osc = matches!(self.state, ParserState::OscString | ParserState::EscapeInOsc);
        if byte < 0x20 && !(in_osc && (byte == 0x07 || byte == 0x1B)) {
            match byte {
                0x1B => self.enter_escape(),
                0x07 => self.bell = true,
                0x08 => buf.backspace(),
                0x09 => buf.tab(),
                0x0A..=0x0C => buf.line_feed(),
                0x0D => {
                    if buf.wrap_pending() && buf.modes.contains(TerminalModes::AUTO_WRAP) {
                        self.soft_wrap = true;
                    }
                    buf.carriage_return();
                }
                0x0E => self.shifted_out = true,
                0x0F => self.shifted_out = false,
                0x18 | 0x1A => self.state = ParserState::Ground,
                _ => {}
            }
            return None;
        }

        match self.state {
            ParserState::Ground => {
                self.ground(byte, buf);
                None
            }
            ParserState::Escape => self.escape(byte, buf),
            ParserState::EscapeIntermediate => {
                self.escape_intermediate(byte, buf);
                None
            }
            ParserState::CsiEntry => self.csi_entry(byte, buf),
            ParserState::CsiParam => self.csi_param(byte, buf),
            ParserState::CsiIntermediate => self.csi_intermediate(byte, buf),
            ParserState::OscString => {
                self.osc_string_state(byte);
                None
            }
            ParserState::EscapeInOsc => self.escape_in_osc(byte, buf),
        }
    }

    fn escape_in_osc(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        self.execute_osc();
        if byte == b'\\' {
            self.state = ParserState::Ground;
            None
        } else {
            self.enter_escape();
            self.escape(byte, buf)
        }
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
        self.seq_len = 0;
    }

    fn ground(&mut self, byte: u8, buf: &mut ScreenBuffer) {
        if byte == 0x7F {
            return;
        }
        let graphics = if self.shifted_out {
            self.g1_graphics
        } else {
            self.g0_graphics
        };
        if graphics {
            if let Some(ch) = dec_graphics(byte) {
                let mut utf8 = [0u8; 4];
                buf.put_bytes(ch.encode_utf8(&mut utf8).as_bytes());
                return;
            }
        }
        buf.put_byte(byte);
    }

    fn escape(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        self.state = ParserState::Ground;
        match byte {
            b'[' => {
                self.state = ParserState::CsiEntry;
            }
            b']' => {
                self.state = ParserState::OscString;
                self.osc_string.clear();
            }
            b'7' => buf.save_cursor(),
            b'8' => buf.restore_cursor(),
            b'D' => buf.index(),
            b'E' => {
                buf.carriage_return();
                buf.line_feed();
            }
            b'H' => buf.set_tab_stop(),
            b'M' => buf.reverse_index(),
            b'=' => buf.modes.insert(TerminalModes::APP_KEYPAD),
            b'>' => buf.modes.remove(TerminalModes::APP_KEYPAD),
            b'c' => {
                // RIS: full reset keeps scrollback but clears the screen
                buf.attr = DEFAULT_ATTR;
                buf.modes = TerminalModes::default();
                buf.set_scroll_region(1, 0);
                buf.erase_in_display(2);
                buf.goto(0, 0);
                self.g0_graphics = false;
                self.g1_graphics = false;
                self.shifted_out = false;
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => {
                tracing::trace!("unhandled ESC {:?}", byte as char);
            }
        }
        None
    }

    fn escape_intermediate(&mut self, byte: u8, buf: &mut ScreenBuffer) {
        match byte {
            0x20..=0x2F => self.intermediates.push(byte),
            0x30..=0x7E => {
                match (self.intermediates.first().copied(), byte) {
                    (Some(b'('), charset) => self.g0_graphics = charset == b'0',
                    (Some(b')'), charset) => self.g1_graphics = charset == b'0',
                    (Some(b'#'), b'8') => buf.alignment_test(),
                    _ => {}
                }
                self.state = ParserState::Ground;
            }
            _ => self.state = ParserState::Ground,
        }
    }

    fn csi_entry(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        match byte {
            b'0'..=b'9' => {
                self.current_param = Some((byte - b'0') as u16);
                self.state = ParserState::CsiParam;
            }
            b';' => {
                self.params.push(0);
                self.state = ParserState::CsiParam;
            }
            b'?' | b'>' | b'!' | b'=' => self.intermediates.push(byte),
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => return self.execute_csi(byte, buf),
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_param(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            b';' | b':' => {
                self.params.push(self.current_param.take().unwrap_or(0));
            }
            0x20..=0x2F => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                return self.execute_csi(byte, buf);
            }
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_intermediate(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        match byte {
            0x20..=0x2F => self.intermediates.push(byte),
            0x40..=0x7E => return self.execute_csi(byte, buf),
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn osc_string_state(&mut self, byte: u8) {
        match byte {
            0x07 | 0x9C => {
                self.execute_osc();
                self.state = ParserState::Ground;
            }
            0x1B => self.state = ParserState::EscapeInOsc,
            _ => self.osc_string.push(byte),
        }
    }

    fn execute_csi(&mut self, final_byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        self.state = ParserState::Ground;
        let is_private = self.intermediates.contains(&b'?');
        let is_gt = self.intermediates.contains(&b'>');
        let params = std::mem::take(&mut self.params);
        // First parameter with 0 and absent both meaning 1
        let n = params.first().copied().unwrap_or(1).max(1) as usize;
        let arg = |i: usize| params.get(i).copied().unwrap_or(0);

        let response = match (is_private, is_gt, final_byte) {
            (false, false, b'A') => {
                buf.cursor_up(n);
                None
            }
            (false, false, b'B') | (false, false, b'e') => {
                buf.cursor_down(n);
                None
            }
            (false, false, b'C') | (false, false, b'a') => {
                buf.cursor_forward(n);
                None
            }
            (false, false, b'D') => {
                buf.cursor_backward(n);
                None
            }
            (false, false, b'E') => {
                buf.cursor_down(n);
                buf.carriage_return();
                None
            }
            (false, false, b'F') => {
                buf.cursor_up(n);
                buf.carriage_return();
                None
            }
            (false, false, b'G') | (false, false, b'`') => {
                buf.set_column(n - 1);
                None
            }
            (false, false, b'H') | (false, false, b'f') => {
                let row = (arg(0).max(1) - 1) as usize;
                let col = (arg(1).max(1) - 1) as usize;
                buf.goto(row, col);
                None
            }
            (false, false, b'd') => {
                buf.set_row(n - 1);
                None
            }

            (false, false, b'J') => {
                buf.erase_in_display(arg(0));
                None
            }
            (false, false, b'K') => {
                buf.erase_in_line(arg(0));
                None
            }
            (false, false, b'L') => {
                buf.insert_lines(n);
                None
            }
            (false, false, b'M') => {
                buf.delete_lines(n);
                None
            }
            (false, false, b'@') => {
                buf.insert_chars(n);
                None
            }
            (false, false, b'P') => {
                buf.delete_chars(n);
                None
            }
            (false, false, b'X') => {
                buf.erase_chars(n);
                None
            }
            (false, false, b'S') => {
                buf.scroll_up(n);
                None
            }
            (false, false, b'T') => {
                buf.scroll_down(n);
                None
            }
            (false, false, b'g') => {
                buf.clear_tab_stop(arg(0));
                None
            }
            (false, false, b'r') => {
                buf.set_scroll_region(arg(0) as usize, arg(1) as usize);
                None
            }
            (false, false, b'm') => {
                execute_sgr(&params, buf);
                None
            }
            (false, false, b's') => {
                buf.save_cursor();
                None
            }
            (false, false, b'u') => {
                buf.restore_cursor();
                None
            }
            (false, false, b'n') => match arg(0) {
                5 => Some(Response::StatusOk),
                6 => {
                    let (top, _) = buf.scroll_region();
                    let mut row = buf.cursor_row();
                    if buf.modes.contains(TerminalModes::ORIGIN) {
                        row = row.saturating_sub(top);
                    }
                    let col = buf.cursor_col().min(buf.cols - 1);
                    Some(Response::CursorPosition(row + 1, col + 1))
                }
                _ => None,
            },
            (false, false, b'c') => Some(Response::DeviceAttributes),
            (false, true, b'c') => Some(Response::SecondaryDeviceAttributes),

            (true, false, b'h') => {
                for &p in &params {
                    set_private_mode(buf, p, true);
                }
                None
            }
            (true, false, b'l') => {
                for &p in &params {
                    set_private_mode(buf, p, false);
                }
                None
            }
            (false, false, b'h') | (false, false, b'l') => {
                if params.contains(&4) {
                    buf.modes.set(TerminalModes::INSERT, final_byte == b'h');
                }
                None
            }

            _ => {
                tracing::debug!(
                    "Unknown CSI: intermediates={:?}, params={:?}, final={:?}",
                    self.intermediates,
                    params,
                    final_byte as char
                );
                None
            }
        };

        self.params = params;
        self.params.clear();
        response
    }

    fn execute_osc(&mut self) {
        let osc = String::from_utf8_lossy(&self.osc_string);
        if let Some((code, text)) = osc.split_once(';') {
            if matches!(code, "0" | "1" | "2") {
                self.title = Some(text.to_string());
            }
        }
        self.osc_string.clear();
    }
}

fn set_private_mode(buf: &mut ScreenBuffer, mode: u16, enable: bool) {
    match mode {
        1 => buf.modes.set(TerminalModes::APP_CURSOR, enable),
        6 => {
            buf.modes.set(TerminalModes::ORIGIN, enable);
            buf.goto(0, 0);
        }
        7 => buf.modes.set(TerminalModes::AUTO_WRAP, enable),
        25 => buf.modes.set(TerminalModes::CURSOR_VISIBLE, enable),
        47 | 1047 => {
            if enable {
                buf.enter_alternate_screen();
            } else {
                buf.leave_alternate_screen();
            }
        }
        1048 => {
            if enable {
                buf.save_cursor();
            } else {
                buf.restore_cursor();
            }
        }
        1049 => {
            if enable {
                buf.save_cursor();
                buf.enter_alternate_screen();
            } else {
                buf.leave_alternate_screen();
                buf.restore_cursor();
            }
        }
        2004 => buf.modes.set(TerminalModes::BRACKETED_PASTE, enable),
        _ => tracing::trace!("ignored private mode {} = {}", mode, enable),
    }
}

/// Apply SGR parameters to the packed attribute byte
/// (low nibble foreground, high nibble background, bit 3 bold).
/// Reverse video is a flag on the buffer, applied when text is stored.
fn execute_sgr(params: &[u16], buf: &mut ScreenBuffer) {
    if params.is_empty() {
        buf.attr = DEFAULT_ATTR;
        buf.reverse = false;
        return;
    }

    let mut iter = params.iter();
    while let Some(&param) = iter.next() {
        let attr = buf.attr;
        buf.attr = match param {
            0 => {
                buf.reverse = false;
                DEFAULT_ATTR
            }
            1 => attr | ATTR_BOLD,
            22 => attr & !ATTR_BOLD,
            7 => {
                buf.reverse = true;
                attr
            }
            27 => {
                buf.reverse = false;
                attr
            }
            30..=37 => (attr & 0xF8) | (param - 30) as u8,
            39 => (attr & 0xF8) | DEFAULT_ATTR,
            40..=47 => (attr & 0x0F) | (((param - 40) as u8) << 4),
            49 => attr & 0x0F,
            90..=97 => (attr & 0xF0) | (param - 90 + 8) as u8,
            100..=107 => (attr & 0x0F) | (((param - 100 + 8) as u8) << 4),
            38 | 48 => {
                // 256-colour and RGB forms are consumed; only the
                // first sixteen palette entries fit in the attribute
                let colour = match iter.next() {
                    Some(5) => iter.next().copied().filter(|&c| c < 16),
                    Some(2) => {
                        iter.nth(2);
                        None
                    }
                    _ => None,
                };
                match colour {
                    Some(c) if param == 38 => (attr & 0xF0) | c as u8,
                    Some(c) => (attr & 0x0F) | ((c as u8) << 4),
                    None => attr,
                }
            }
            _ => attr,
        };
    }
}

/// DEC special graphics, used while the active charset is '0'
fn dec_graphics(byte: u8) -> Option<char> {
    let ch = match byte {
        b'`' => '◆',
        b'a' => '▒',
        b'f' => '°',
        b'g' => '±',
        b'j' => '┘',
        b'k' => '┐',
        b'l' => '┌',
        b'm' => '└',
        b'n' => '┼',
        b'o' => '⎺',
        b'p' => '⎻',
        b'q' => '─',
        b'r' => '⎼',
        b's' => '⎽',
        b't' => '├',
        b'u' => '┤',
        b'v' => '┴',
        b'w' => '┬',
        b'x' => '│',
        b'y' => '≤',
        b'z' => '≥',
        b'{' => 'π',
        b'|' => '≠',
        b'}' => '£',
        b'~' => '·',
        _ => return None,
    };
    Some(ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(buf: &mut ScreenBuffer, parser: &mut VtParser, data: &[u8]) -> Vec<Response> {
        data.iter().filter_map(|&b| parser.feed(b, buf)).collect()
    }

    #[test]
    fn test_cursor_movement() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x1b[5;10H");
        assert_eq!(buf.cursor_row(), 4);
        assert_eq!(buf.cursor_col(), 9);
    }

    #[test]
    fn test_sgr_colors() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x1b[31mA\x1b[0mB");
        assert_eq!(buf.attrs(), &[0x01, DEFAULT_ATTR]);

        run(&mut buf, &mut parser, b"\x1b[1;44m");
        assert_eq!(buf.attr, 0x4F);
        run(&mut buf, &mut parser, b"\x1b[38;5;200;48;2;1;2;3m");
        assert_eq!(buf.attr, 0x4F);
    }

    #[test]
    fn test_reverse_video_is_idempotent_and_keeps_bold() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        // bold white on blue, reversed twice, then SGR 27
        run(&mut buf, &mut parser, b"\x1b[1;44m\x1b[7mA\x1b[7mB\x1b[27mC");
        assert_eq!(buf.attrs(), &[0x7C, 0x7C, 0x4F]);
        assert!(!buf.reverse);

        // colour set while reversed lands on the foreground
        run(&mut buf, &mut parser, b"\x1b[0;7;31mD\x1b[mE");
        assert_eq!(&buf.attrs()[3..], &[0x10, DEFAULT_ATTR]);
        assert!(!buf.reverse);
    }

    #[test]
    fn test_erase_display_home_and_erase_chars() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"hello\r\nworld");
        run(&mut buf, &mut parser, b"\x1b[2J\x1b[H");
        assert_eq!(buf.cursor_row(), 0);
        assert_eq!(buf.cursor_col(), 0);
        assert!(buf.screen_lines().iter().all(|l| l.trim().is_empty()));

        run(&mut buf, &mut parser, b"abcdef\x1b[1;2H\x1b[3X");
        assert_eq!(buf.line_text(buf.cursor_y()), "a   ef");
    }

    #[test]
    fn test_cursor_position_report() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        let replies = run(&mut buf, &mut parser, b"\x1b[3;7H\x1b[6n\x1b[c");
        assert_eq!(
            replies,
            vec![Response::CursorPosition(3, 7), Response::DeviceAttributes]
        );
        assert_eq!(Response::DeviceAttributes.to_bytes(), b"\x1b[?1;2c");
    }

    #[test]
    fn test_split_sequence_across_feeds() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x1b[1");
        assert!(parser.in_escape());
        run(&mut buf, &mut parser, b"0Gx");
        assert_eq!(buf.line_text(0), "         x");
    }

    #[test]
    fn test_cancel_aborts_sequence() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x1b[12\x18ok");
        assert_eq!(buf.line_text(0), "ok");
    }

    #[test]
    fn test_overlong_sequence_is_dropped() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        let mut data = b"\x1b[".to_vec();
        data.extend(std::iter::repeat(b'1').take(100));
        run(&mut buf, &mut parser, &data);
        assert!(!parser.in_escape());
    }

    #[test]
    fn test_osc_title() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x1b]0;router\x07\x1b]2;switch\x1b\\");
        assert_eq!(parser.take_title().as_deref(), Some("switch"));
        assert!(buf.cells().is_empty());
    }

    #[test]
    fn test_line_drawing_charset() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x1b(0lqk\x1b(Bq");
        assert_eq!(buf.line_text(0), "┌─┐q");
        assert_eq!(buf.cursor_col(), 4);
    }

    #[test]
    fn test_cr_at_right_margin_wraps_before_text() {
        let mut buf = ScreenBuffer::new(4, 3);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"abcd\rxy");
        assert_eq!(buf.screen_lines(), vec!["abcd", "xy", ""]);

        let mut buf = ScreenBuffer::new(4, 3);
        run(&mut buf, &mut parser, b"abcd\r\nxy");
        assert_eq!(buf.screen_lines(), vec!["abcd", "xy", ""]);
    }

    #[test]
    fn test_alternate_screen_mode() {
        let mut buf = ScreenBuffer::new(20, 4);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"$ vi\r\n");
        run(&mut buf, &mut parser, b"\x1b[?1049h\x1b[Hfile\x1b[?1049l");
        assert_eq!(buf.line_text(0), "$ vi");
        assert_eq!(buf.cursor_row(), 1);
        assert_eq!(buf.cursor_col(), 0);
    }

    #[test]
    fn test_bell_flag() {
        let mut buf = ScreenBuffer::new(80, 24);
        let mut parser = VtParser::new();
        run(&mut buf, &mut parser, b"\x07");
        assert!(parser.take_bell());
        assert!(!parser.take_bell());
    }
}
