//! Telnet option negotiation
//!
//! Handles IAC sequences found inline in the received stream. The terminal
//! accepts ECHO, SGA, TTYPE and NEW-ENVIRON and refuses everything else.
//! A request for a state an option is already in gets no reply, so a peer
//! that repeats itself cannot start a DO/WILL loop.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NEW_ENVIRON: u8 = 39;

const TTYPE_SEND: u8 = 1;
const TTYPE_IS: u8 = 0;
const ENVIRON_IS: u8 = 0;

/// Longest IAC tail kept between reads. An unterminated subnegotiation
/// past this is dropped.
pub const MAX_PENDING: usize = 256;

/// Outcome of looking at an IAC at some position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The command ends at this offset; nothing to display
    Consumed(usize),
    /// IAC IAC: a literal 0xFF data byte, next offset
    Literal(usize),
    /// The command is cut off; keep the tail for the next read
    Incomplete,
}

/// Negotiation state carried by the terminal between reads
#[derive(Debug, Clone)]
pub struct TelnetOptions {
    pub term_type: String,
    /// Whether the remote end left echoing to us
    pub local_echo: bool,
    /// Options we agreed to perform (answered DO with WILL)
    local: [bool; 256],
    /// Options we asked the peer to perform (answered WILL with DO)
    remote: [bool; 256],
}

impl TelnetOptions {
    pub fn new(term_type: &str) -> Self {
        Self {
            term_type: term_type.to_string(),
            local_echo: false,
            local: [false; 256],
            remote: [false; 256],
        }
    }

    /// Process the IAC at `data[pos]`, appending any reply to `replies`
    pub fn negotiate(&mut self, data: &[u8], pos: usize, replies: &mut Vec<u8>) -> Negotiation {
        debug_assert_eq!(data.get(pos), Some(&IAC));
        let Some(&cmd) = data.get(pos + 1) else {
            return Negotiation::Incomplete;
        };
        match cmd {
            IAC => Negotiation::Literal(pos + 2),
            DO | DONT | WILL | WONT => {
                let Some(&opt) = data.get(pos + 2) else {
                    return Negotiation::Incomplete;
                };
                self.option(cmd, opt, replies);
                Negotiation::Consumed(pos + 3)
            }
            SB => {
                let Some(end) = find_se(data, pos + 2) else {
                    return Negotiation::Incomplete;
                };
                self.subnegotiation(&data[pos + 2..end], replies);
                Negotiation::Consumed(end + 2)
            }
            _ => Negotiation::Consumed(pos + 2),
        }
    }

    fn option(&mut self, cmd: u8, opt: u8, replies: &mut Vec<u8>) {
        let supported = matches!(opt, OPT_ECHO | OPT_SGA | OPT_TTYPE | OPT_NEW_ENVIRON);
        let idx = opt as usize;
        match cmd {
            DO if supported => {
                if opt == OPT_ECHO {
                    self.local_echo = false;
                }
                if !self.local[idx] {
                    self.local[idx] = true;
                    replies.extend_from_slice(&[IAC, WILL, opt]);
                }
            }
            WILL if supported => {
                if opt == OPT_ECHO {
                    self.local_echo = true;
                }
                if !self.remote[idx] {
                    self.remote[idx] = true;
                    replies.extend_from_slice(&[IAC, DO, opt]);
                }
            }
            DO => replies.extend_from_slice(&[IAC, WONT, opt]),
            WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
            DONT if self.local[idx] => {
                self.local[idx] = false;
                replies.extend_from_slice(&[IAC, WONT, opt]);
            }
            WONT if self.remote[idx] => {
                self.remote[idx] = false;
                replies.extend_from_slice(&[IAC, DONT, opt]);
            }
            _ => tracing::trace!("telnet: ignored {} {}", cmd, opt),
        }
    }

    fn subnegotiation(&mut self, body: &[u8], replies: &mut Vec<u8>) {
        match body {
            [OPT_TTYPE, TTYPE_SEND, ..] => {
                replies.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
                replies.extend_from_slice(self.term_type.as_bytes());
                replies.extend_from_slice(&[IAC, SE]);
            }
            [OPT_NEW_ENVIRON, ..] => {
                replies.extend_from_slice(&[IAC, SB, OPT_NEW_ENVIRON, ENVIRON_IS, IAC, SE]);
            }
            _ => {}
        }
    }
}

/// Offset of the IAC that starts the closing IAC SE
fn find_se(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < data.len() {
        if data[i] == IAC {
            if data[i + 1] == SE {
                return Some(i);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

/// Double every 0xFF so outgoing data is not read as a command
pub fn escape_iac(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    if !data.contains(&IAC) {
        return std::borrow::Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len() + 4);
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    std::borrow::Cow::Owned(out)
}
