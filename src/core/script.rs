//! Scripting bridge
//!
//! Blocking helpers used by scripted commands and by the SSH layer while it
//! needs answers from the user: waiting for the remote prompt, waiting for
//! a string, and reading a line typed at the terminal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::term::SharedTerminal;

/// Poll interval for every wait in this module
pub const TICK: Duration = Duration::from_millis(100);

/// Longest line accepted by `gets`
const MAX_LINE: usize = 256;

/// Something that can ask the user a question and return the answer.
/// `None` means the question was cancelled.
pub trait PromptProvider: Send + Sync {
    fn ask(&self, prompt: &str, echo: bool) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    Editing,
    Done,
    Cancelled,
}

struct LineInput {
    buf: Vec<u8>,
    echo: bool,
    state: InputState,
}

pub struct ScriptBridge {
    term: SharedTerminal,
    timeout_secs: AtomicU64,
    input: Mutex<Option<LineInput>>,
    input_ready: Condvar,
    cancelled: AtomicBool,
}

impl ScriptBridge {
    pub fn new(term: SharedTerminal, timeout_secs: u64) -> Self {
        Self {
            term,
            timeout_secs: AtomicU64::new(timeout_secs),
            input: Mutex::new(None),
            input_ready: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, secs: u64) {
        self.timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// Wait until the prompt shows up after the mark, or until no new
    /// output has arrived for the timeout. Returns the unread byte count.
    pub fn wait_for_prompt(&self) -> usize {
        let ticks = self.timeout() * 10;
        let mut idle = 0;
        let mut last = self.term.lock().unread_len();
        loop {
            {
                let term = self.term.lock();
                let unread = term.unread_len();
                if term.prompt_observed() {
                    return unread;
                }
                if unread > last {
                    idle = 0;
                }
                last = unread;
            }
            if idle >= ticks || self.is_cancelled() {
                return last;
            }
            thread::sleep(TICK);
            idle += 1;
        }
    }

    /// Wait up to `secs` for `text` to appear after the mark. On a match
    /// returns everything up to and including it and advances the mark.
    pub fn wait_for(&self, text: &str, secs: u64) -> Option<String> {
        let needle = text.as_bytes();
        if needle.is_empty() {
            return None;
        }
        let ticks = secs * 10;
        for tick in 0..=ticks {
            {
                let mut term = self.term.lock();
                let start = term.buf.mark();
                let end = term.buf.cursor_x();
                let hit = term.buf.cells()[start..end]
                    .windows(needle.len())
                    .position(|w| w == needle);
                if let Some(pos) = hit {
                    return Some(term.consume_unread(pos + needle.len()));
                }
            }
            if tick < ticks {
                if self.is_cancelled() {
                    break;
                }
                thread::sleep(TICK);
            }
        }
        None
    }

    /// Sleep in ticks so a closing host interrupts the wait
    pub fn wait(&self, secs: u64) {
        for _ in 0..secs * 10 {
            if self.is_cancelled() {
                return;
            }
            thread::sleep(TICK);
        }
    }

    /// Show `prompt` and block until the user finishes a line.
    /// With `echo` off the typed characters show as '*'.
    pub fn gets(&self, prompt: &str, echo: bool) -> Option<String> {
        if self.is_cancelled() {
            return None;
        }
        self.term.lock().disp(prompt);

        let mut input = self.input.lock();
        *input = Some(LineInput {
            buf: Vec::new(),
            echo,
            state: InputState::Editing,
        });
        loop {
            let state = input.as_ref().map_or(InputState::Cancelled, |i| i.state);
            match state {
                InputState::Editing => {
                    self.input_ready.wait_for(&mut input, TICK);
                    if self.is_cancelled() {
                        *input = None;
                        return None;
                    }
                }
                InputState::Done => {
                    let line = input.take().map(|i| i.buf).unwrap_or_default();
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
                InputState::Cancelled => {
                    *input = None;
                    return None;
                }
            }
        }
    }

    pub fn gets_active(&self) -> bool {
        matches!(
            self.input.lock().as_ref(),
            Some(LineInput { state: InputState::Editing, .. })
        )
    }

    /// Offer keystrokes to a pending `gets`. Returns false when no line is
    /// being read, leaving the keys to the caller.
    pub fn feed_key(&self, bytes: &[u8]) -> bool {
        let mut echo = Vec::new();
        let finished;
        {
            let mut guard = self.input.lock();
            let Some(input) = guard.as_mut() else {
                return false;
            };
            if input.state != InputState::Editing {
                return false;
            }
            for &b in bytes {
                match b {
                    b'\r' | b'\n' => {
                        input.state = InputState::Done;
                        echo.extend_from_slice(b"\r\n");
                        break;
                    }
                    0x03 => {
                        input.state = InputState::Cancelled;
                        echo.extend_from_slice(b"^C\r\n");
                        break;
                    }
                    0x08 | 0x7F => {
                        while let Some(last) = input.buf.pop() {
                            if !super::term::buffer::is_continuation(last) {
                                echo.extend_from_slice(b"\x08 \x08");
                                break;
                            }
                        }
                    }
                    // Escape sequences (arrow keys) are not line editing
                    0x1B => break,
                    b if b >= 0x20 && input.buf.len() < MAX_LINE => {
                        input.buf.push(b);
                        if input.echo {
                            echo.push(b);
                        } else if !super::term::buffer::is_continuation(b) {
                            echo.push(b'*');
                        }
                    }
                    _ => {}
                }
            }
            finished = input.state != InputState::Editing;
        }
        if !echo.is_empty() {
            self.term.lock().disp(&String::from_utf8_lossy(&echo));
        }
        if finished {
            self.input_ready.notify_all();
        }
        true
    }

    /// Abort any pending or future wait until `reset` is called
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(input) = self.input.lock().as_mut() {
            input.state = InputState::Cancelled;
        }
        self.input_ready.notify_all();
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl PromptProvider for ScriptBridge {
    fn ask(&self, prompt: &str, echo: bool) -> Option<String> {
        self.gets(prompt, echo)
    }
}
