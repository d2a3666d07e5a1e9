//! Streaming XML indenter for netconf sessions.
//!
//! Tags can arrive split across reads, so partial tags are buffered until
//! their closing '>'.

const INDENT: usize = 2;

#[derive(Debug, Default)]
pub struct XmlPrettyPrinter {
    depth: usize,
    in_tag: bool,
    tag: Vec<u8>,
    text: Vec<u8>,
    /// Last thing written was an opening tag, so a close may stay inline
    after_open: bool,
    /// Text has been written on the current line
    after_text: bool,
}

impl XmlPrettyPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Reformat a chunk; returns the bytes to display
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() * 2);
        for &b in data {
            if self.in_tag {
                self.tag.push(b);
                if b == b'>' {
                    self.in_tag = false;
                    self.emit_tag(&mut out);
                }
            } else if b == b'<' {
                self.flush_text(&mut out);
                self.in_tag = true;
                self.tag.clear();
                self.tag.push(b);
            } else {
                self.text.push(b);
            }
        }
        self.flush_text(&mut out);
        out
    }

    fn newline(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"\r\n");
        out.extend(std::iter::repeat(b' ').take(self.depth * INDENT));
    }

    fn flush_text(&mut self, out: &mut Vec<u8>) {
        if self.text.iter().all(|b| b.is_ascii_whitespace()) {
            self.text.clear();
            return;
        }
        let text = std::mem::take(&mut self.text);
        let trimmed = trim_ascii(&text);
        if !self.after_open && !self.after_text {
            self.newline(out);
        }
        out.extend_from_slice(trimmed);
        self.after_text = true;
    }

    fn emit_tag(&mut self, out: &mut Vec<u8>) {
        let tag = std::mem::take(&mut self.tag);
        if tag.starts_with(b"</") {
            self.depth = self.depth.saturating_sub(1);
            if !self.after_open {
                self.newline(out);
            }
            self.after_open = false;
        } else if tag.starts_with(b"<?") || tag.starts_with(b"<!") || tag.ends_with(b"/>") {
            self.newline(out);
            self.after_open = false;
        } else {
            self.newline(out);
            self.depth += 1;
            self.after_open = true;
        }
        out.extend_from_slice(&tag);
        self.after_text = false;
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pretty(chunks: &[&str]) -> String {
        let mut p = XmlPrettyPrinter::new();
        let out: Vec<u8> = chunks.iter().flat_map(|c| p.feed(c.as_bytes())).collect();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_nested_elements_are_indented() {
        let out = pretty(&["<rpc-reply><data><name>eth0</name></data></rpc-reply>"]);
        assert_eq!(
            out,
            "\r\n<rpc-reply>\r\n  <data>\r\n    <name>eth0</name>\r\n  </data>\r\n</rpc-reply>"
        );
    }

    #[test]
    fn test_tags_split_across_reads() {
        let out = pretty(&["<a><b", "/>   \n", "</a>]]>", "]]>"]);
        assert_eq!(out, "\r\n<a>\r\n  <b/>\r\n</a>\r\n]]>]]>");
    }

    #[test]
    fn test_declaration_does_not_indent() {
        let out = pretty(&["<?xml version=\"1.0\"?><hello/>"]);
        assert_eq!(out, "\r\n<?xml version=\"1.0\"?>\r\n<hello/>");
    }
}
