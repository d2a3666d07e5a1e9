//! Terminal renderer using crossterm
//!
//! Draws a [`Snapshot`] of the viewport to the console, plus a reverse
//! video status line on the bottom row. Rows unchanged since the last
//! frame are skipped.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{DisableMouseCapture, EnableMouseCapture},
    execute, queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen, LeaveAlternateScreen},
};
use unicode_width::UnicodeWidthChar;

use crate::core::term::buffer::ATTR_BOLD;
use crate::core::term::{Snapshot, DEFAULT_ATTR};

/// Text sharing one attribute and selection state
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub text: String,
    pub attr: u8,
    pub selected: bool,
}

/// Split a row into runs, clipped to `cols` display columns
pub fn row_runs(cells: &[u8], attrs: &[u8], selected: &std::ops::Range<usize>, cols: usize) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    let mut width = 0;
    let mut i = 0;
    while i < cells.len() {
        let len = utf8_len(cells[i]).min(cells.len() - i);
        let (ch, len) = match std::str::from_utf8(&cells[i..i + len]) {
            Ok(s) => (s.chars().next().unwrap_or(' '), len),
            Err(_) => (char::REPLACEMENT_CHARACTER, 1),
        };
        let ch = if ch.is_control() { ' ' } else { ch };
        let w = ch.width().unwrap_or(0);
        if width + w > cols {
            break;
        }
        width += w;

        let attr = attrs.get(i).copied().unwrap_or(DEFAULT_ATTR);
        let sel = selected.contains(&i);
        match runs.last_mut() {
            Some(run) if run.attr == attr && run.selected == sel => run.text.push(ch),
            _ => runs.push(Run {
                text: ch.to_string(),
                attr,
                selected: sel,
            }),
        }
        i += len;
    }
    runs
}

fn utf8_len(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}

pub struct Renderer {
    initialized: bool,
    prev: Vec<Vec<Run>>,
    prev_status: String,
    size: (u16, u16),
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            initialized: false,
            prev: Vec::new(),
            prev_status: String::new(),
            size: (0, 0),
        }
    }

    /// Switch the console to raw mode on the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            EnableMouseCapture,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        self.size = terminal::size()?;
        self.initialized = true;
        Ok(())
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            DisableMouseCapture,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();
        terminal::disable_raw_mode()
    }

    /// Forget the last frame so the next render draws everything
    pub fn invalidate(&mut self, size: (u16, u16)) {
        self.size = size;
        self.prev.clear();
        self.prev_status.clear();
    }

    /// Viewport rows available above the status line
    pub fn view_rows(&self) -> u16 {
        self.size.1.saturating_sub(1).max(1)
    }

    pub fn render(&mut self, snap: &Snapshot, status: &str) -> io::Result<()> {
        let cols = self.size.0 as usize;
        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());
        queue!(out, Hide)?;

        let frame: Vec<Vec<Run>> = snap
            .rows
            .iter()
            .map(|row| row_runs(&row.cells, &row.attrs, &row.selected, cols))
            .collect();
        if self.prev.len() != frame.len() {
            self.prev = vec![Vec::new(); frame.len()];
            self.prev_status.clear();
            queue!(out, Clear(ClearType::All))?;
        }

        for (y, runs) in frame.iter().enumerate() {
            if self.prev[y] == *runs {
                continue;
            }
            queue!(out, MoveTo(0, y as u16), SetAttribute(Attribute::Reset), ResetColor, Clear(ClearType::UntilNewLine))?;
            for run in runs {
                Self::apply_attr(&mut out, run.attr, run.selected)?;
                queue!(out, Print(&run.text))?;
            }
            queue!(out, SetAttribute(Attribute::Reset), ResetColor)?;
        }
        self.prev = frame;

        let mut status = status.to_string();
        if snap.scrolled_back > 0 {
            status = format!("[{} lines back] {}", snap.scrolled_back, status);
        }
        if status != self.prev_status {
            let line: String = status.chars().take(cols).collect();
            queue!(
                out,
                MoveTo(0, self.view_rows()),
                Clear(ClearType::UntilNewLine),
                SetAttribute(Attribute::Reverse),
                Print(format!("{:<width$}", line, width = cols)),
                SetAttribute(Attribute::Reset)
            )?;
            self.prev_status = status;
        }

        if let Some((row, col)) = snap.cursor {
            queue!(out, MoveTo(col as u16, row as u16), Show)?;
        }
        out.flush()
    }

    fn apply_attr<W: Write>(out: &mut W, attr: u8, selected: bool) -> io::Result<()> {
        if attr & ATTR_BOLD != 0 {
            queue!(out, SetAttribute(Attribute::Bold))?;
        }
        if selected {
            queue!(out, SetAttribute(Attribute::Reverse))?;
        }
        let fg = attr & 0x0F;
        let bg = attr >> 4;
        if fg != DEFAULT_ATTR {
            queue!(out, SetForegroundColor(Color::AnsiValue(fg)))?;
        }
        if bg != 0 {
            queue!(out, SetBackgroundColor(Color::AnsiValue(bg)))?;
        }
        Ok(())
    }

    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_runs_split_on_attr_and_selection() {
        let cells = b"abcdef";
        let attrs = [7, 7, 1, 1, 7, 7];
        let runs = row_runs(cells, &attrs, &(4..6), 80);
        let texts: Vec<(&str, u8, bool)> = runs.iter().map(|r| (r.text.as_str(), r.attr, r.selected)).collect();
        assert_eq!(texts, vec![("ab", 7, false), ("cd", 1, false), ("ef", 7, true)]);
    }

    #[test]
    fn test_runs_decode_utf8_and_clip_wide() {
        let text = "a日本b";
        let attrs = vec![DEFAULT_ATTR; text.len()];
        let runs = row_runs(text.as_bytes(), &attrs, &(0..0), 80);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "a日本b");

        // a(1) + 日(2) fits in 4 columns, 本 would need 6
        let runs = row_runs(text.as_bytes(), &attrs, &(0..0), 4);
        assert_eq!(runs[0].text, "a日");
    }

    #[test]
    fn test_runs_replace_controls_and_bad_bytes() {
        let cells = [b'a', 0x07, 0xFF, b'b'];
        let runs = row_runs(&cells, &[DEFAULT_ATTR; 4], &(0..0), 80);
        assert_eq!(runs[0].text, "a \u{FFFD}b");
    }
}
