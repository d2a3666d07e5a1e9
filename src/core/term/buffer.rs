//! Screen buffer
//!
//! All text ever received lives in one flat byte vector with a parallel
//! attribute vector. `lines` holds the byte offset where each logical line
//! starts, followed by a sentinel equal to the total length, so line `y`
//! occupies `cells[lines[y]..lines[y + 1]]`. Lines carry no separator bytes
//! and hold UTF-8 text; a continuation byte never counts as a column.
//!
//! The visible viewport is the `rows` lines starting at `screen_top`.
//! Everything above it is scrollback. When the buffer grows past its
//! capacity or line limit, a prefix of scrollback is dropped and every
//! stored offset is shifted down by the same amount.

use bitflags::bitflags;
use std::ops::Range;

/// Light grey on black.
pub const DEFAULT_ATTR: u8 = 0x07;
/// Bold / bright foreground bit.
pub const ATTR_BOLD: u8 = 0x08;

pub const DEFAULT_CAPACITY: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_LINES: usize = 65536;

const TAB_STOPS: usize = 256;

bitflags! {
    /// DEC and ANSI modes that change how bytes land in the buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TerminalModes: u16 {
        const AUTO_WRAP = 1 << 0;
        const INSERT = 1 << 1;
        const ORIGIN = 1 << 2;
        const APP_CURSOR = 1 << 3;
        const APP_KEYPAD = 1 << 4;
        const BRACKETED_PASTE = 1 << 5;
        const CURSOR_VISIBLE = 1 << 6;
    }
}

impl Default for TerminalModes {
    fn default() -> Self {
        TerminalModes::AUTO_WRAP | TerminalModes::CURSOR_VISIBLE
    }
}

#[inline]
pub fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

#[derive(Clone, Copy, Debug)]
struct SavedCursor {
    row: usize,
    col: usize,
    attr: u8,
    reverse: bool,
}

/// Where the primary screen stood when the alternate screen was entered
#[derive(Clone, Copy, Debug)]
struct AltScreen {
    cells_len: usize,
    line_count: usize,
    cursor_y: usize,
    col: usize,
    screen_top: usize,
}

/// One viewport row copied out for drawing
#[derive(Debug, Clone, Default)]
pub struct SnapshotRow {
    pub cells: Vec<u8>,
    pub attrs: Vec<u8>,
    /// Byte range within `cells` covered by the selection
    pub selected: Range<usize>,
}

/// Owned copy of the viewport, taken under the terminal lock
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub rows: Vec<SnapshotRow>,
    /// (row, col) when the cursor should be drawn
    pub cursor: Option<(usize, usize)>,
    pub scrolled_back: usize,
}

pub struct ScreenBuffer {
    cells: Vec<u8>,
    attrs: Vec<u8>,
    lines: Vec<usize>,
    /// Absolute byte offset of the cursor
    cursor_x: usize,
    /// Absolute line index of the cursor
    cursor_y: usize,
    /// Column of the cursor; may equal `cols` while a wrap is pending
    col: usize,
    screen_top: usize,
    view_offset: usize,
    selection: (usize, usize),
    mark: usize,
    pub cols: usize,
    pub rows: usize,
    roll_top: usize,
    roll_bot: usize,
    pub attr: u8,
    /// SGR 7; applied to `attr` when a character is stored
    pub reverse: bool,
    pub modes: TerminalModes,
    tab_stops: [bool; TAB_STOPS],
    saved: Option<SavedCursor>,
    alt: Option<AltScreen>,
    capacity: usize,
    max_lines: usize,
}

impl ScreenBuffer {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self::with_limits(cols, rows, DEFAULT_CAPACITY, DEFAULT_MAX_LINES)
    }

    pub fn with_limits(cols: usize, rows: usize, capacity: usize, max_lines: usize) -> Self {
        let rows = rows.max(1);
        Self {
            cells: Vec::with_capacity(capacity.min(1 << 20)),
            attrs: Vec::with_capacity(capacity.min(1 << 20)),
            lines: vec![0, 0],
            cursor_x: 0,
            cursor_y: 0,
            col: 0,
            screen_top: 0,
            view_offset: 0,
            selection: (0, 0),
            mark: 0,
            cols: cols.max(1),
            rows,
            roll_top: 0,
            roll_bot: rows - 1,
            attr: DEFAULT_ATTR,
            reverse: false,
            modes: TerminalModes::default(),
            tab_stops: default_tab_stops(),
            saved: None,
            alt: None,
            capacity: capacity.max(1024),
            max_lines: max_lines.max(rows * 2),
        }
    }

    /// Reset to an empty screen, keeping the allocation
    pub fn clear(&mut self) {
        self.cells.clear();
        self.attrs.clear();
        self.lines.clear();
        self.lines.extend_from_slice(&[0, 0]);
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.col = 0;
        self.screen_top = 0;
        self.view_offset = 0;
        self.selection = (0, 0);
        self.mark = 0;
        self.roll_top = 0;
        self.roll_bot = self.rows - 1;
        self.attr = DEFAULT_ATTR;
        self.reverse = false;
        self.modes = TerminalModes::default();
        self.tab_stops = default_tab_stops();
        self.saved = None;
        self.alt = None;
    }

    // ---- accessors ----

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn attrs(&self) -> &[u8] {
        &self.attrs
    }

    pub fn line_count(&self) -> usize {
        self.lines.len() - 1
    }

    /// Start offsets of every line
    pub fn line_offsets(&self) -> &[usize] {
        &self.lines[..self.line_count()]
    }

    pub fn line_range(&self, y: usize) -> Range<usize> {
        self.lines[y]..self.lines[y + 1]
    }

    pub fn cursor_x(&self) -> usize {
        self.cursor_x
    }

    pub fn cursor_y(&self) -> usize {
        self.cursor_y
    }

    pub fn screen_top_line(&self) -> usize {
        self.screen_top
    }

    /// Cursor row relative to the viewport
    pub fn cursor_row(&self) -> usize {
        self.cursor_y - self.screen_top
    }

    pub fn cursor_col(&self) -> usize {
        self.col
    }

    pub fn mark(&self) -> usize {
        self.mark
    }

    pub fn selection(&self) -> (usize, usize) {
        self.selection
    }

    pub fn view_offset(&self) -> usize {
        self.view_offset
    }

    pub fn in_alternate_screen(&self) -> bool {
        self.alt.is_some()
    }

    pub fn scroll_region(&self) -> (usize, usize) {
        (self.roll_top, self.roll_bot)
    }

    // ---- low level editing ----

    fn line_end(&self, y: usize) -> usize {
        self.lines[y + 1]
    }

    /// End offset of the character starting at `pos` in line `y`
    fn char_end(&self, y: usize, pos: usize) -> usize {
        let end = self.line_end(y);
        let mut p = pos + 1;
        while p < end && is_continuation(self.cells[p]) {
            p += 1;
        }
        p.min(end)
    }

    /// Offset of column `col` in line `y`, and the column actually reached
    fn offset_in_line(&self, y: usize, col: usize) -> (usize, usize) {
        let end = self.line_end(y);
        let mut pos = self.lines[y];
        let mut c = 0;
        while pos < end && c < col {
            pos = self.char_end(y, pos);
            c += 1;
        }
        (pos, c)
    }

    fn column_at(&self, y: usize, pos: usize) -> usize {
        self.cells[self.lines[y]..pos]
            .iter()
            .filter(|&&b| !is_continuation(b))
            .count()
    }

    /// Line index containing offset `pos`
    pub fn line_of(&self, pos: usize) -> usize {
        let idx = self.lines[..self.line_count()].partition_point(|&s| s <= pos);
        idx.saturating_sub(1)
    }

    fn ensure_line(&mut self, y: usize) {
        while self.line_count() <= y {
            self.lines.push(self.cells.len());
        }
    }

    fn insert(&mut self, y: usize, pos: usize, bytes: &[u8], attr: u8) {
        let n = bytes.len();
        if n == 0 {
            return;
        }
        self.cells.splice(pos..pos, bytes.iter().copied());
        self.attrs.splice(pos..pos, std::iter::repeat(attr).take(n));
        for start in &mut self.lines[y + 1..] {
            *start += n;
        }
        let shift = |p: &mut usize| {
            if *p > pos {
                *p += n;
            }
        };
        shift(&mut self.cursor_x);
        shift(&mut self.mark);
        shift(&mut self.selection.0);
        shift(&mut self.selection.1);
    }

    fn remove(&mut self, y: usize, range: Range<usize>) {
        let (start, end) = (range.start, range.end);
        let n = end - start;
        if n == 0 {
            return;
        }
        self.cells.drain(range.clone());
        self.attrs.drain(range);
        for s in &mut self.lines[y + 1..] {
            *s -= n;
        }
        let shift = |p: &mut usize| {
            if *p >= end {
                *p -= n;
            } else if *p > start {
                *p = start;
            }
        };
        shift(&mut self.cursor_x);
        shift(&mut self.mark);
        shift(&mut self.selection.0);
        shift(&mut self.selection.1);
    }

    fn clear_line(&mut self, y: usize) {
        if y < self.line_count() {
            let range = self.line_range(y);
            self.remove(y, range);
        }
    }

    fn delete_line(&mut self, y: usize) {
        self.clear_line(y);
        self.lines.remove(y);
    }

    fn insert_empty_line(&mut self, y: usize) {
        let at = self.lines[y];
        self.lines.insert(y, at);
    }

    fn truncate_line(&mut self, y: usize, max_cols: usize) {
        let (pos, _) = self.offset_in_line(y, max_cols);
        let end = self.line_end(y);
        if pos < end {
            self.remove(y, pos..end);
        }
    }

    fn blank_attr(&self) -> u8 {
        (self.attr & 0xF0) | DEFAULT_ATTR
    }

    /// Attribute stored with printed text
    fn text_attr(&self) -> u8 {
        if self.reverse {
            reversed(self.attr)
        } else {
            self.attr
        }
    }

    /// Move the cursor to column `col` of line `y`, padding with spaces
    fn seek(&mut self, y: usize, col: usize) {
        self.ensure_line(y);
        let (pos, reached) = self.offset_in_line(y, col);
        let pad = col - reached;
        if pad > 0 {
            let spaces = vec![b' '; pad];
            let attr = self.blank_attr();
            self.insert(y, pos, &spaces, attr);
        }
        self.cursor_y = y;
        self.cursor_x = pos + pad;
        self.col = col;
    }

    // ---- text ----

    /// Store one byte at the cursor
    pub fn put_byte(&mut self, b: u8) {
        self.view_offset = 0;
        if is_continuation(b) {
            let (y, x) = (self.cursor_y, self.cursor_x);
            let attr = self.text_attr();
            self.insert(y, x, &[b], attr);
            self.cursor_x += 1;
            return;
        }
        self.maybe_compact();
        if self.col >= self.cols {
            if self.modes.contains(TerminalModes::AUTO_WRAP) {
                self.next_line();
                self.seek(self.cursor_y, 0);
            } else {
                self.seek(self.cursor_y, self.cols - 1);
            }
        }
        let (y, x) = (self.cursor_y, self.cursor_x);
        let attr = self.text_attr();
        if self.modes.contains(TerminalModes::INSERT) {
            self.insert(y, x, &[b], attr);
            let cols = self.cols;
            self.truncate_line(y, cols);
        } else if x >= self.line_end(y) {
            self.insert(y, x, &[b], attr);
        } else {
            let end = self.char_end(y, x);
            if end > x + 1 {
                self.remove(y, x + 1..end);
            }
            self.cells[x] = b;
            self.attrs[x] = attr;
        }
        self.cursor_x = x + 1;
        self.col += 1;
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_byte(b);
        }
    }

    // ---- cursor motion ----

    /// Move down one line, scrolling the region or growing the buffer
    fn next_line(&mut self) {
        self.maybe_compact();
        let row = self.cursor_row();
        let full_region = self.roll_top == 0 && self.roll_bot == self.rows - 1;
        if row == self.roll_bot {
            if full_region && self.alt.is_none() {
                self.cursor_y += 1;
                self.ensure_line(self.cursor_y);
                self.screen_top += 1;
            } else {
                self.scroll_up(1);
            }
        } else if row + 1 < self.rows {
            self.cursor_y += 1;
            self.ensure_line(self.cursor_y);
        }
    }

    pub fn line_feed(&mut self) {
        self.view_offset = 0;
        let col = self.col.min(self.cols - 1);
        self.next_line();
        self.seek(self.cursor_y, col);
    }

    pub fn carriage_return(&mut self) {
        self.cursor_x = self.lines[self.cursor_y];
        self.col = 0;
    }

    /// True when the cursor sits past the last column waiting to wrap
    pub fn wrap_pending(&self) -> bool {
        self.col >= self.cols
    }

    pub fn backspace(&mut self) {
        if self.col >= self.cols {
            let y = self.cursor_y;
            self.seek(y, self.cols - 1);
        }
        let start = self.lines[self.cursor_y];
        if self.cursor_x > start {
            let mut x = self.cursor_x - 1;
            while x > start && is_continuation(self.cells[x]) {
                x -= 1;
            }
            self.cursor_x = x;
            self.col -= 1;
        }
    }

    pub fn tab(&mut self) {
        let last = self.cols - 1;
        let mut c = self.col + 1;
        while c < last && (c >= TAB_STOPS || !self.tab_stops[c]) {
            c += 1;
        }
        let y = self.cursor_y;
        self.seek(y, c.min(last));
    }

    pub fn set_tab_stop(&mut self) {
        if self.col < TAB_STOPS {
            self.tab_stops[self.col] = true;
        }
    }

    /// TBC: 0 clears the stop at the cursor, 3 clears all
    pub fn clear_tab_stop(&mut self, mode: u16) {
        match mode {
            0 if self.col < TAB_STOPS => self.tab_stops[self.col] = false,
            3 => self.tab_stops = [false; TAB_STOPS],
            _ => {}
        }
    }

    /// Absolute position within the viewport, 0-based
    pub fn goto(&mut self, row: usize, col: usize) {
        let row = if self.modes.contains(TerminalModes::ORIGIN) {
            (row + self.roll_top).min(self.roll_bot)
        } else {
            row.min(self.rows - 1)
        };
        let y = self.screen_top + row;
        self.seek(y, col.min(self.cols - 1));
    }

    pub fn set_column(&mut self, col: usize) {
        let y = self.cursor_y;
        self.seek(y, col.min(self.cols - 1));
    }

    pub fn set_row(&mut self, row: usize) {
        let col = self.col.min(self.cols - 1);
        self.goto(row, col);
    }

    pub fn cursor_up(&mut self, n: usize) {
        let row = self.cursor_row();
        let min = if row >= self.roll_top { self.roll_top } else { 0 };
        let target = row.saturating_sub(n).max(min);
        let col = self.col.min(self.cols - 1);
        self.seek(self.screen_top + target, col);
    }

    pub fn cursor_down(&mut self, n: usize) {
        let row = self.cursor_row();
        let max = if row <= self.roll_bot { self.roll_bot } else { self.rows - 1 };
        let target = (row + n).min(max);
        let col = self.col.min(self.cols - 1);
        self.seek(self.screen_top + target, col);
    }

    pub fn cursor_forward(&mut self, n: usize) {
        let col = (self.col + n).min(self.cols - 1);
        let y = self.cursor_y;
        self.seek(y, col);
    }

    pub fn cursor_backward(&mut self, n: usize) {
        let col = self.col.min(self.cols - 1).saturating_sub(n);
        let y = self.cursor_y;
        self.seek(y, col);
    }

    /// IND: line feed that keeps the column
    pub fn index(&mut self) {
        self.line_feed();
    }

    /// RI: move up, scrolling the region down at its top
    pub fn reverse_index(&mut self) {
        let row = self.cursor_row();
        if row == self.roll_top {
            self.scroll_down(1);
        } else if row > 0 {
            let col = self.col.min(self.cols - 1);
            self.seek(self.cursor_y - 1, col);
        }
    }

    pub fn save_cursor(&mut self) {
        self.saved = Some(SavedCursor {
            row: self.cursor_row(),
            col: self.col.min(self.cols - 1),
            attr: self.attr,
            reverse: self.reverse,
        });
    }

    pub fn restore_cursor(&mut self) {
        let saved = self.saved.unwrap_or(SavedCursor {
            row: 0,
            col: 0,
            attr: DEFAULT_ATTR,
            reverse: false,
        });
        self.attr = saved.attr;
        self.reverse = saved.reverse;
        let row = saved.row.min(self.rows - 1);
        self.seek(self.screen_top + row, saved.col.min(self.cols - 1));
    }

    /// DECSTBM, 1-based inclusive bounds; a bottom of 0 means the last row
    pub fn set_scroll_region(&mut self, top: usize, bottom: usize) {
        let top = top.max(1) - 1;
        let bottom = if bottom == 0 { self.rows } else { bottom.min(self.rows) } - 1;
        if top < bottom {
            self.roll_top = top;
            self.roll_bot = bottom;
        } else {
            self.roll_top = 0;
            self.roll_bot = self.rows - 1;
        }
        self.goto(0, 0);
    }

    // ---- scrolling ----

    fn region_lines(&mut self) -> (usize, usize) {
        let top = self.screen_top + self.roll_top;
        let bot = self.screen_top + self.roll_bot;
        self.ensure_line(bot);
        (top, bot)
    }

    /// Scroll the region up; the top line is discarded
    pub fn scroll_up(&mut self, n: usize) {
        let (top, bot) = self.region_lines();
        let col = self.col.min(self.cols - 1);
        for _ in 0..n.min(bot - top + 1) {
            self.delete_line(top);
            self.insert_empty_line(bot);
        }
        self.seek(self.cursor_y, col);
    }

    pub fn scroll_down(&mut self, n: usize) {
        let (top, bot) = self.region_lines();
        let col = self.col.min(self.cols - 1);
        for _ in 0..n.min(bot - top + 1) {
            self.delete_line(bot);
            self.insert_empty_line(top);
        }
        self.seek(self.cursor_y, col);
    }

    pub fn insert_lines(&mut self, n: usize) {
        let row = self.cursor_row();
        if row < self.roll_top || row > self.roll_bot {
            return;
        }
        let (_, bot) = self.region_lines();
        let y = self.cursor_y;
        for _ in 0..n.min(bot - y + 1) {
            self.delete_line(bot);
            self.insert_empty_line(y);
        }
        self.seek(y, 0);
    }

    pub fn delete_lines(&mut self, n: usize) {
        let row = self.cursor_row();
        if row < self.roll_top || row > self.roll_bot {
            return;
        }
        let (_, bot) = self.region_lines();
        let y = self.cursor_y;
        for _ in 0..n.min(bot - y + 1) {
            self.delete_line(y);
            self.insert_empty_line(bot);
        }
        self.seek(y, 0);
    }

    // ---- erasing ----

    pub fn erase_in_line(&mut self, mode: u16) {
        let y = self.cursor_y;
        let col = self.col.min(self.cols - 1);
        match mode {
            0 => {
                let end = self.line_end(y);
                if self.cursor_x < end {
                    let x = self.cursor_x;
                    self.remove(y, x..end);
                }
            }
            1 => {
                let start = self.lines[y];
                let end = if self.cursor_x < self.line_end(y) {
                    self.char_end(y, self.cursor_x)
                } else {
                    self.cursor_x
                };
                let count = self.column_at(y, end);
                self.remove(y, start..end);
                let attr = self.blank_attr();
                self.insert(y, start, &vec![b' '; count], attr);
                self.seek(y, col);
            }
            2 => {
                self.clear_line(y);
                self.seek(y, col);
            }
            _ => {}
        }
    }

    pub fn erase_in_display(&mut self, mode: u16) {
        let col = self.col.min(self.cols - 1);
        let last = (self.screen_top + self.rows).min(self.line_count());
        match mode {
            0 => {
                self.erase_in_line(0);
                for y in self.cursor_y + 1..last {
                    self.clear_line(y);
                }
            }
            1 => {
                for y in self.screen_top..self.cursor_y {
                    self.clear_line(y);
                }
                self.seek(self.cursor_y, col);
                self.erase_in_line(1);
            }
            2 | 3 => {
                for y in self.screen_top..last {
                    self.clear_line(y);
                }
                self.seek(self.cursor_y, col);
            }
            _ => {}
        }
    }

    /// Span of up to `n` characters starting at the cursor
    fn chars_at_cursor(&self, n: usize) -> (Range<usize>, usize) {
        let y = self.cursor_y;
        let end = self.line_end(y);
        let mut e = self.cursor_x;
        let mut k = 0;
        while e < end && k < n {
            e = self.char_end(y, e);
            k += 1;
        }
        (self.cursor_x..e, k)
    }

    /// ECH
    pub fn erase_chars(&mut self, n: usize) {
        let (range, k) = self.chars_at_cursor(n);
        if k > 0 {
            let (y, x) = (self.cursor_y, range.start);
            self.remove(y, range);
            let attr = self.blank_attr();
            self.insert(y, x, &vec![b' '; k], attr);
        }
    }

    /// DCH
    pub fn delete_chars(&mut self, n: usize) {
        let (range, _) = self.chars_at_cursor(n);
        let y = self.cursor_y;
        self.remove(y, range);
    }

    /// ICH
    pub fn insert_chars(&mut self, n: usize) {
        let (y, x) = (self.cursor_y, self.cursor_x);
        let n = n.min(self.cols);
        let attr = self.blank_attr();
        self.insert(y, x, &vec![b' '; n], attr);
        let cols = self.cols;
        self.truncate_line(y, cols);
    }

    /// DECALN: fill the screen with 'E'
    pub fn alignment_test(&mut self) {
        let row_text = vec![b'E'; self.cols];
        for r in 0..self.rows {
            let y = self.screen_top + r;
            self.ensure_line(y);
            self.clear_line(y);
            let start = self.lines[y];
            self.insert(y, start, &row_text, DEFAULT_ATTR);
        }
        self.goto(0, 0);
    }

    // ---- alternate screen ----

    pub fn enter_alternate_screen(&mut self) {
        if self.alt.is_some() {
            return;
        }
        self.alt = Some(AltScreen {
            cells_len: self.cells.len(),
            line_count: self.line_count(),
            cursor_y: self.cursor_y,
            col: self.col,
            screen_top: self.screen_top,
        });
        let top = self.line_count();
        for _ in 0..self.rows {
            self.lines.push(self.cells.len());
        }
        self.screen_top = top;
        self.view_offset = 0;
        self.seek(top, 0);
    }

    pub fn leave_alternate_screen(&mut self) {
        let Some(alt) = self.alt.take() else {
            return;
        };
        self.cells.truncate(alt.cells_len);
        self.attrs.truncate(alt.cells_len);
        self.lines.truncate(alt.line_count + 1);
        self.lines[alt.line_count] = alt.cells_len;
        self.mark = self.mark.min(alt.cells_len);
        self.selection = (0, 0);
        self.screen_top = alt.screen_top;
        self.view_offset = 0;
        self.cursor_x = self.lines[alt.cursor_y];
        self.seek(alt.cursor_y, alt.col);
    }

    // ---- geometry ----

    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.cols = cols.max(1);
        self.rows = rows.max(1);
        self.roll_top = 0;
        self.roll_bot = self.rows - 1;
        if self.cursor_y >= self.screen_top + self.rows {
            self.screen_top = self.cursor_y + 1 - self.rows;
        }
        self.view_offset = 0;
        self.max_lines = self.max_lines.max(self.rows * 2);
    }

    // ---- compaction ----

    fn maybe_compact(&mut self) {
        if self.cells.len() >= self.capacity || self.line_count() >= self.max_lines {
            self.compact();
        }
    }

    /// Drop the oldest scrollback lines, keeping about half of each limit.
    /// The viewport is never dropped, so a single enormous line can keep
    /// the buffer above capacity until it scrolls off.
    pub fn compact(&mut self) {
        let len = self.cells.len();
        let keep_bytes = self.capacity / 2;
        let keep_lines = self.max_lines / 2;
        let by_bytes = self.lines[..self.line_count()].partition_point(|&s| s + keep_bytes < len);
        let by_lines = self.line_count().saturating_sub(keep_lines);
        let mut limit = self.screen_top.min(self.cursor_y);
        if let Some(alt) = &self.alt {
            limit = limit.min(alt.screen_top);
        }
        let k = by_bytes.max(by_lines).min(limit);
        if k == 0 {
            return;
        }

        let dropped = self.lines[k];
        self.cells.drain(..dropped);
        self.attrs.drain(..dropped);
        self.lines.drain(..k);
        for start in &mut self.lines {
            *start -= dropped;
        }
        self.cursor_x -= dropped;
        self.cursor_y -= k;
        self.screen_top -= k;
        self.view_offset = self.view_offset.min(self.screen_top);
        self.mark = self.mark.saturating_sub(dropped);
        self.selection.0 = self.selection.0.saturating_sub(dropped);
        self.selection.1 = self.selection.1.saturating_sub(dropped);
        if let Some(alt) = &mut self.alt {
            alt.cells_len -= dropped;
            alt.line_count -= k;
            alt.cursor_y = alt.cursor_y.saturating_sub(k);
            alt.screen_top -= k;
        }
        tracing::debug!("compacted buffer: dropped {} lines, {} bytes", k, dropped);
    }

    // ---- reading ----

    /// Text between two offsets with a newline at every line boundary
    pub fn text_range(&self, start: usize, end: usize) -> String {
        let end = end.min(self.cells.len());
        if start >= end {
            return String::new();
        }
        let first = self.line_of(start);
        let mut out = Vec::with_capacity(end - start + 16);
        for y in first..self.line_count() {
            let range = self.line_range(y);
            if y > first {
                if range.start >= end {
                    break;
                }
                out.push(b'\n');
            }
            let a = start.max(range.start);
            let b = end.min(range.end);
            if a < b {
                out.extend_from_slice(&self.cells[a..b]);
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn line_text(&self, y: usize) -> String {
        if y >= self.line_count() {
            return String::new();
        }
        String::from_utf8_lossy(&self.cells[self.line_range(y)]).into_owned()
    }

    fn view_top(&self) -> usize {
        self.screen_top - self.view_offset.min(self.screen_top)
    }

    /// Text of each viewport row (honours the scrollback view)
    pub fn screen_lines(&self) -> Vec<String> {
        let top = self.view_top();
        (top..top + self.rows).map(|y| self.line_text(y)).collect()
    }

    /// Cell and attribute bytes of one viewport row
    pub fn row_cells(&self, row: usize) -> (&[u8], &[u8]) {
        let y = self.view_top() + row;
        if y >= self.line_count() {
            return (&[], &[]);
        }
        let range = self.line_range(y);
        (&self.cells[range.clone()], &self.attrs[range])
    }

    pub fn snapshot(&self) -> Snapshot {
        let top = self.view_top();
        let (sel_start, sel_end) = self.selection;
        let rows = (0..self.rows)
            .map(|row| {
                let y = top + row;
                if y >= self.line_count() {
                    return SnapshotRow::default();
                }
                let range = self.line_range(y);
                let selected = if sel_start < sel_end {
                    let a = sel_start.clamp(range.start, range.end) - range.start;
                    let b = sel_end.clamp(range.start, range.end) - range.start;
                    a..b
                } else {
                    0..0
                };
                SnapshotRow {
                    cells: self.cells[range.clone()].to_vec(),
                    attrs: self.attrs[range].to_vec(),
                    selected,
                }
            })
            .collect();
        let cursor = (self.view_offset == 0 && self.modes.contains(TerminalModes::CURSOR_VISIBLE))
            .then(|| (self.cursor_row(), self.col.min(self.cols - 1)));
        Snapshot {
            rows,
            cursor,
            scrolled_back: self.view_offset,
        }
    }

    // ---- scrollback view ----

    /// Move the view; negative values look back into history
    pub fn scroll_view(&mut self, delta: isize) {
        let offset = self.view_offset as isize - delta;
        self.view_offset = offset.clamp(0, self.screen_top as isize) as usize;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.view_offset = 0;
    }

    // ---- selection ----

    pub fn select(&mut self, a: usize, b: usize) {
        let len = self.cells.len();
        let (a, b) = (a.min(len), b.min(len));
        self.selection = (a.min(b), a.max(b));
    }

    pub fn clear_selection(&mut self) {
        self.selection = (0, 0);
    }

    pub fn selection_text(&self) -> Option<String> {
        let (a, b) = self.selection;
        (a < b).then(|| self.text_range(a, b))
    }

    /// Offset of a viewport position
    pub fn offset_at(&self, row: usize, col: usize) -> usize {
        let y = (self.view_top() + row).min(self.line_count() - 1);
        self.offset_in_line(y, col).0
    }

    pub fn select_word_at(&mut self, row: usize, col: usize) {
        let pos = self.offset_at(row, col);
        let y = self.line_of(pos);
        let range = self.line_range(y);
        let is_word = |b: u8| b != b' ' && b != b'\t';
        let mut a = pos;
        while a > range.start && is_word(self.cells[a - 1]) {
            a -= 1;
        }
        let mut b = pos;
        while b < range.end && is_word(self.cells[b]) {
            b += 1;
        }
        self.select(a, b);
    }

    pub fn drag_select(&mut self, from: (usize, usize), to: (usize, usize)) {
        let a = self.offset_at(from.0, from.1);
        let b = self.offset_at(to.0, to.1);
        let b = if b < self.cells.len() && b >= a {
            self.char_end(self.line_of(b), b)
        } else {
            b
        };
        self.select(a, b);
    }

    /// Search backwards from the selection (or the cursor) and select the hit
    pub fn find(&mut self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return None;
        }
        let from = if self.selection.0 < self.selection.1 {
            self.selection.0 + needle.len() - 1
        } else {
            self.cursor_x
        }
        .min(self.cells.len());
        let pos = self.cells[..from]
            .windows(needle.len())
            .rposition(|w| w == needle)?;
        self.select(pos, pos + needle.len());
        let y = self.line_of(pos);
        self.view_offset = self.screen_top.saturating_sub(y);
        Some(pos)
    }

    // ---- unread mark ----

    pub fn set_mark(&mut self) {
        self.mark = self.cursor_x;
    }

    pub fn set_mark_at(&mut self, pos: usize) {
        self.mark = pos.min(self.cursor_x);
    }

    /// Keep the mark at or before the cursor
    pub fn clamp_mark(&mut self) {
        if self.mark > self.cursor_x {
            self.mark = self.cursor_x;
        }
    }

    pub fn unread_len(&self) -> usize {
        self.cursor_x.saturating_sub(self.mark)
    }

    pub fn unread_text(&self) -> String {
        self.text_range(self.mark, self.cursor_x)
    }
}

/// Swap foreground and background, keeping bold with the foreground
pub fn reversed(attr: u8) -> u8 {
    (attr & ATTR_BOLD) | ((attr & 0x07) << 4) | ((attr >> 4) & 0x07)
}

fn default_tab_stops() -> [bool; TAB_STOPS] {
    let mut stops = [false; TAB_STOPS];
    for c in (8..TAB_STOPS).step_by(8) {
        stops[c] = true;
    }
    stops
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(buf: &mut ScreenBuffer, text: &str) {
        for b in text.bytes() {
            match b {
                b'\r' => buf.carriage_return(),
                b'\n' => buf.line_feed(),
                _ => buf.put_byte(b),
            }
        }
    }

    #[test]
    fn test_printable_text_is_stored_in_order() {
        let mut buf = ScreenBuffer::new(80, 24);
        write(&mut buf, "hello");
        assert_eq!(buf.cells(), b"hello");
        assert_eq!(buf.cursor_x(), 5);
        assert_eq!(buf.line_count(), 1);
    }

    #[test]
    fn test_lines_have_no_separators() {
        let mut buf = ScreenBuffer::new(80, 24);
        write(&mut buf, "ab\r\ncd");
        assert_eq!(buf.cells(), b"abcd");
        assert_eq!(buf.line_offsets(), &[0, 2]);
        assert_eq!(buf.text_range(0, 4), "ab\ncd");
    }

    #[test]
    fn test_autowrap_starts_new_line() {
        let mut buf = ScreenBuffer::new(4, 3);
        write(&mut buf, "abcdef");
        assert_eq!(buf.line_text(0), "abcd");
        assert_eq!(buf.line_text(1), "ef");
        assert_eq!(buf.cursor_col(), 2);
    }

    #[test]
    fn test_overwrite_replaces_multibyte_char() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "aé b");
        buf.goto(0, 1);
        buf.put_byte(b'x');
        assert_eq!(buf.line_text(0), "ax b");
    }

    #[test]
    fn test_goto_pads_with_spaces() {
        let mut buf = ScreenBuffer::new(80, 24);
        buf.goto(2, 3);
        buf.put_byte(b'X');
        assert_eq!(buf.line_count(), 3);
        assert_eq!(buf.line_text(2), "   X");
    }

    #[test]
    fn test_scroll_grows_scrollback() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "1\r\n2\r\n3\r\n4");
        assert_eq!(buf.screen_top_line(), 1);
        assert_eq!(buf.screen_lines(), vec!["2", "3", "4"]);
        assert_eq!(buf.cursor_row(), 2);
    }

    #[test]
    fn test_region_scroll_discards_top_line() {
        let mut buf = ScreenBuffer::new(10, 4);
        write(&mut buf, "a\r\nb\r\nc\r\nd");
        buf.set_scroll_region(2, 3);
        buf.goto(2, 0);
        buf.line_feed();
        assert_eq!(buf.screen_lines(), vec!["a", "c", "", "d"]);
        assert_eq!(buf.line_count(), 4);
    }

    #[test]
    fn test_erase_display_keeps_cursor() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "abc\r\ndef");
        buf.erase_in_display(2);
        assert_eq!(buf.screen_lines(), vec!["", "   ", ""]);
        assert_eq!(buf.cursor_row(), 1);
        assert_eq!(buf.cursor_col(), 3);
    }

    #[test]
    fn test_erase_line_modes() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "abcdef");
        buf.set_column(2);
        buf.erase_in_line(0);
        assert_eq!(buf.line_text(0), "ab");

        write(&mut buf, "cdef");
        buf.set_column(2);
        buf.erase_in_line(1);
        assert_eq!(buf.line_text(0), "   def");
    }

    #[test]
    fn test_insert_and_delete_chars() {
        let mut buf = ScreenBuffer::new(6, 2);
        write(&mut buf, "abcdef");
        buf.set_column(1);
        buf.insert_chars(2);
        assert_eq!(buf.line_text(0), "a  bcd");
        buf.delete_chars(3);
        assert_eq!(buf.line_text(0), "acd");
        buf.erase_chars(1);
        assert_eq!(buf.line_text(0), "a d");
    }

    #[test]
    fn test_insert_delete_lines() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "a\r\nb\r\nc");
        buf.goto(1, 0);
        buf.insert_lines(1);
        assert_eq!(buf.screen_lines(), vec!["a", "", "b"]);
        buf.delete_lines(1);
        assert_eq!(buf.screen_lines(), vec!["a", "b", ""]);
    }

    #[test]
    fn test_alternate_screen_restores_primary() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "shell$ ");
        buf.enter_alternate_screen();
        write(&mut buf, "editor");
        assert_eq!(buf.screen_lines()[0], "editor");
        buf.leave_alternate_screen();
        assert_eq!(buf.cells(), b"shell$ ");
        assert_eq!(buf.cursor_x(), 7);
    }

    #[test]
    fn test_mark_follows_inserted_text() {
        let mut buf = ScreenBuffer::new(10, 3);
        write(&mut buf, "abc");
        buf.set_mark();
        write(&mut buf, "de");
        assert_eq!(buf.mark(), 3);
        assert_eq!(buf.unread_text(), "de");
    }

    #[test]
    fn test_compaction_keeps_recent_lines() {
        let mut buf = ScreenBuffer::with_limits(20, 5, 1024, 64);
        for i in 0..500 {
            write(&mut buf, &format!("line {}\r\n", i));
            assert!(buf.line_count() <= 64);
            assert!(buf.cells().len() <= 1024);
        }
        write(&mut buf, "tail");
        let screen = buf.screen_lines();
        assert_eq!(screen[3], "line 499");
        assert_eq!(screen[4], "tail");
        let offsets = buf.line_offsets();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(offsets[0], 0);
    }

    #[test]
    fn test_find_selects_backwards() {
        let mut buf = ScreenBuffer::new(20, 3);
        write(&mut buf, "foo bar foo");
        assert_eq!(buf.find(b"foo"), Some(8));
        assert_eq!(buf.find(b"foo"), Some(0));
        assert_eq!(buf.selection_text().as_deref(), Some("foo"));
        assert_eq!(buf.find(b"zzz"), None);
    }

    #[test]
    fn test_select_word() {
        let mut buf = ScreenBuffer::new(20, 3);
        write(&mut buf, "one two three");
        buf.select_word_at(0, 5);
        assert_eq!(buf.selection_text().as_deref(), Some("two"));
    }

    #[test]
    fn test_tab_stops() {
        let mut buf = ScreenBuffer::new(40, 3);
        buf.tab();
        assert_eq!(buf.cursor_col(), 8);
        buf.set_column(3);
        buf.set_tab_stop();
        buf.set_column(0);
        buf.tab();
        assert_eq!(buf.cursor_col(), 3);
        buf.clear_tab_stop(3);
        buf.tab();
        assert_eq!(buf.cursor_col(), 39);
    }
}
