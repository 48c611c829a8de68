// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Content encoder: line-oriented receipt markup to ESC/POS bytes.
//
// Markup, one receipt line per text line:
//
//   [C]<b>ORDER 42</b>
//   [L]2x Dumplings[R]12.50
//   [L]<u>Note:</u> no <dw>onions</dw>
//
// `[L]`, `[C]`, `[R]` select alignment (left when absent).  A line with more
// than one marker is laid out as columns across the paper width.  `<b>`,
// `<u>`, `<dw>` and `<dh>` are bold, underline, double width and double
// height.  Anything else that looks like a tag is printed literally.
//
// The text encoding is chosen once per payload: GBK with the printer's
// double-byte mode when any CJK code point is present, single-byte Latin
// otherwise.

use encoding_rs::{Encoding, GBK, WINDOWS_1252};
use tracing::debug;

use receiptlink_core::PaperWidth;

/// ESC/POS opcodes used by the engine.
pub mod cmd {
    pub const LF: u8 = 0x0A;

    /// ESC @
    pub const INIT: &[u8] = &[0x1B, 0x40];
    pub const BOLD_ON: &[u8] = &[0x1B, 0x45, 0x01];
    pub const BOLD_OFF: &[u8] = &[0x1B, 0x45, 0x00];
    pub const UNDERLINE_ON: &[u8] = &[0x1B, 0x2D, 0x01];
    pub const UNDERLINE_OFF: &[u8] = &[0x1B, 0x2D, 0x00];
    /// FS &
    pub const DOUBLE_BYTE_ON: &[u8] = &[0x1C, 0x26];
    /// FS C 1
    pub const SELECT_GBK: &[u8] = &[0x1C, 0x43, 0x01];
    /// FS .
    pub const DOUBLE_BYTE_OFF: &[u8] = &[0x1C, 0x2E];
    /// GS V 1
    pub const PARTIAL_CUT: &[u8] = &[0x1D, 0x56, 0x01];
    /// Written after every transmission group.
    pub const FLUSH: &[u8] = &[0x0A, 0x0A, 0x0C, 0x0D];
    /// Re-initialise and feed one line so a pending cut executes.
    pub const NUDGE: &[u8] = &[0x1B, 0x40, 0x1B, 0x64, 0x01];
    /// NUL, ignored by the printer; used as the liveness probe.
    pub const PROBE: &[u8] = &[0x00];

    /// ESC a n
    pub fn align(align: super::Align) -> [u8; 3] {
        [0x1B, 0x61, align as u8]
    }

    /// GS ! n
    pub fn char_size(double_width: bool, double_height: bool) -> [u8; 3] {
        let mut n = 0u8;
        if double_width {
            n |= 0x10;
        }
        if double_height {
            n |= 0x01;
        }
        [0x1D, 0x21, n]
    }

    /// ESC d n
    pub fn feed(lines: u8) -> [u8; 3] {
        [0x1B, 0x64, lines]
    }
}

/// Lines fed before the auto-cut so the last line clears the cutter.
const CUT_FEED_LINES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left = 0,
    Center = 1,
    Right = 2,
}

impl Align {
    fn from_marker(b: u8) -> Option<Self> {
        match b {
            b'L' => Some(Self::Left),
            b'C' => Some(Self::Center),
            b'R' => Some(Self::Right),
            _ => None,
        }
    }
}

/// Character geometry of a receipt printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptFormat {
    pub dpi: u16,
    pub paper_width_mm: u32,
    pub chars_per_line: usize,
}

impl ReceiptFormat {
    pub const DPI: u16 = 203;

    pub fn for_paper(width: PaperWidth) -> Self {
        Self {
            dpi: Self::DPI,
            paper_width_mm: width.width_mm(),
            chars_per_line: width.chars_per_line(),
        }
    }
}

/// Encoded receipt, kept line-granular for the transmitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Initialisation and code-page selection.
    pub prologue: Vec<u8>,
    /// One entry per markup line, each ending in LF.
    pub lines: Vec<Vec<u8>>,
    /// Double-byte exit, feed and cut.
    pub epilogue: Vec<u8>,
    /// Whether the text was encoded as GBK.
    pub double_byte: bool,
}

impl EncodedPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.prologue);
        for line in &self.lines {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(&self.epilogue);
        out
    }

    pub fn len(&self) -> usize {
        self.prologue.len() + self.lines.iter().map(Vec::len).sum::<usize>() + self.epilogue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether `c` falls in one of the CJK blocks that force GBK.
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F     // CJK symbols and punctuation
            | 0x3300..=0x33FF // CJK compatibility
            | 0x3400..=0x4DBF // extension A
            | 0x4E00..=0x9FFF // unified ideographs
            | 0xF900..=0xFAFF // compatibility ideographs
            | 0xFE30..=0xFE4F // compatibility forms
            | 0xFF00..=0xFFEF // half/full width forms
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// Printed columns taken by `text` in font A.
pub fn display_width(text: &str) -> usize {
    text.chars().map(|c| if is_cjk(c) { 2 } else { 1 }).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Bold,
    Underline,
    DoubleWidth,
    DoubleHeight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Open(Style),
    Close(Style),
}

const TAGS: &[(&str, Style, bool)] = &[
    ("<b>", Style::Bold, true),
    ("</b>", Style::Bold, false),
    ("<u>", Style::Underline, true),
    ("</u>", Style::Underline, false),
    ("<dw>", Style::DoubleWidth, true),
    ("</dw>", Style::DoubleWidth, false),
    ("<dh>", Style::DoubleHeight, true),
    ("</dh>", Style::DoubleHeight, false),
];

fn parse_pieces(text: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some((tag, style, open)) = TAGS.iter().find(|(tag, ..)| rest.starts_with(tag)) {
                if !literal.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut literal)));
                }
                pieces.push(if *open {
                    Piece::Open(*style)
                } else {
                    Piece::Close(*style)
                });
                rest = &rest[tag.len()..];
                continue;
            }
        }
        literal.push(c);
        rest = &rest[c.len_utf8()..];
    }
    if !literal.is_empty() {
        pieces.push(Piece::Text(literal));
    }
    pieces
}

fn pieces_width(pieces: &[Piece]) -> usize {
    pieces
        .iter()
        .map(|p| match p {
            Piece::Text(t) => display_width(t),
            _ => 0,
        })
        .sum()
}

/// Split a line at its alignment markers.
fn split_segments(line: &str) -> Vec<(Align, &str)> {
    let bytes = line.as_bytes();
    let mut segments = Vec::new();
    let mut align = Align::Left;
    let mut start = 0;
    let mut i = 0;

    while i + 3 <= bytes.len() {
        let marker = if bytes[i] == b'[' && bytes[i + 2] == b']' {
            Align::from_marker(bytes[i + 1])
        } else {
            None
        };
        match marker {
            Some(next) => {
                if i > start {
                    segments.push((align, &line[start..i]));
                }
                align = next;
                i += 3;
                start = i;
            }
            None => i += 1,
        }
    }
    if start < line.len() || segments.is_empty() {
        segments.push((align, &line[start..]));
    }
    segments
}

/// On/off state of the four emphasis kinds within one line.
#[derive(Default)]
struct StyleState {
    bold: bool,
    underline: bool,
    double_width: bool,
    double_height: bool,
}

impl StyleState {
    fn apply(&mut self, style: Style, on: bool, out: &mut Vec<u8>) {
        let flag = match style {
            Style::Bold => &mut self.bold,
            Style::Underline => &mut self.underline,
            Style::DoubleWidth => &mut self.double_width,
            Style::DoubleHeight => &mut self.double_height,
        };
        // Repeated opens and stray closes change nothing.
        if *flag == on {
            return;
        }
        *flag = on;
        match style {
            Style::Bold => out.extend_from_slice(if on { cmd::BOLD_ON } else { cmd::BOLD_OFF }),
            Style::Underline => {
                out.extend_from_slice(if on { cmd::UNDERLINE_ON } else { cmd::UNDERLINE_OFF })
            }
            Style::DoubleWidth | Style::DoubleHeight => {
                out.extend_from_slice(&cmd::char_size(self.double_width, self.double_height))
            }
        }
    }

    /// Close whatever the line left open.
    fn close_all(&mut self, out: &mut Vec<u8>) {
        self.apply(Style::Bold, false, out);
        self.apply(Style::Underline, false, out);
        if self.double_width || self.double_height {
            self.double_width = false;
            self.double_height = false;
            out.extend_from_slice(&cmd::char_size(false, false));
        }
    }
}

fn encode_text(text: &str, encoding: &'static Encoding, out: &mut Vec<u8>) {
    let mut buf = [0u8; 4];
    for c in text.chars() {
        if c.is_ascii() {
            if !c.is_ascii_control() {
                out.push(c as u8);
            } else if c == '\t' {
                out.push(b' ');
            }
            continue;
        }
        let (bytes, _, had_errors) = encoding.encode(c.encode_utf8(&mut buf));
        if had_errors {
            out.push(b'?');
        } else {
            out.extend_from_slice(&bytes);
        }
    }
}

/// Turns receipt markup into printer bytes for one paper format.
#[derive(Debug, Clone, Copy)]
pub struct ContentEncoder {
    format: ReceiptFormat,
    auto_cut: bool,
}

impl ContentEncoder {
    pub fn new(format: ReceiptFormat, auto_cut: bool) -> Self {
        Self { format, auto_cut }
    }

    pub fn format(&self) -> ReceiptFormat {
        self.format
    }

    pub fn encode(&self, markup: &str) -> EncodedPayload {
        let double_byte = contains_cjk(markup);
        let encoding = if double_byte { GBK } else { WINDOWS_1252 };

        let mut prologue = cmd::INIT.to_vec();
        if double_byte {
            prologue.extend_from_slice(cmd::DOUBLE_BYTE_ON);
            prologue.extend_from_slice(cmd::SELECT_GBK);
        }

        let lines: Vec<Vec<u8>> = markup
            .lines()
            .map(|line| self.encode_line(line, encoding))
            .collect();

        let mut epilogue = Vec::new();
        if double_byte {
            epilogue.extend_from_slice(cmd::DOUBLE_BYTE_OFF);
        }
        if self.auto_cut {
            epilogue.extend_from_slice(&cmd::feed(CUT_FEED_LINES));
            epilogue.extend_from_slice(cmd::PARTIAL_CUT);
        }

        debug!(
            lines = lines.len(),
            double_byte,
            encoding = encoding.name(),
            "receipt encoded"
        );

        EncodedPayload {
            prologue,
            lines,
            epilogue,
            double_byte,
        }
    }

    /// Markup reduced to plain text lines, alignment rendered with spaces.
    pub fn plain_lines(&self, markup: &str) -> Vec<String> {
        let cpl = self.format.chars_per_line;
        markup
            .lines()
            .map(|line| {
                let (align, pieces) = self.line_pieces(line);
                let text: String = pieces
                    .iter()
                    .filter_map(|p| match p {
                        Piece::Text(t) => Some(t.as_str()),
                        _ => None,
                    })
                    .collect();
                let pad = cpl.saturating_sub(display_width(&text));
                match align {
                    Align::Left => text,
                    Align::Center => format!("{}{text}", " ".repeat(pad / 2)),
                    Align::Right => format!("{}{text}", " ".repeat(pad)),
                }
            })
            .collect()
    }

    fn line_pieces(&self, line: &str) -> (Align, Vec<Piece>) {
        let segments = split_segments(line);
        match segments.as_slice() {
            [(align, text)] => (*align, parse_pieces(text)),
            _ => (Align::Left, self.layout_columns(&segments)),
        }
    }

    fn encode_line(&self, line: &str, encoding: &'static Encoding) -> Vec<u8> {
        let (align, pieces) = self.line_pieces(line);

        let mut out = cmd::align(align).to_vec();
        let mut style = StyleState::default();
        for piece in &pieces {
            match piece {
                Piece::Text(text) => encode_text(text, encoding, &mut out),
                Piece::Open(s) => style.apply(*s, true, &mut out),
                Piece::Close(s) => style.apply(*s, false, &mut out),
            }
        }
        style.close_all(&mut out);
        out.push(cmd::LF);
        out
    }

    /// Lay multi-marker segments out as left / centre / right columns.
    fn layout_columns(&self, segments: &[(Align, &str)]) -> Vec<Piece> {
        let mut columns: [Vec<Piece>; 3] = Default::default();
        for (align, text) in segments {
            columns[*align as usize].extend(parse_pieces(text));
        }
        let [left, center, right] = columns;
        let (l, c, r) = (
            pieces_width(&left),
            pieces_width(&center),
            pieces_width(&right),
        );
        let cpl = self.format.chars_per_line;
        let spaces = |n: usize| Piece::Text(" ".repeat(n));

        let mut out = Vec::new();
        if l + c + r > cpl {
            let mut written = 0;
            for (column, width) in [(left, l), (center, c), (right, r)] {
                if written > 0 && width > 0 {
                    out.push(spaces(1));
                }
                written += width;
                out.extend(column);
            }
        } else if c == 0 {
            out.extend(left);
            out.extend(center);
            out.push(spaces(cpl - l - r));
            out.extend(right);
        } else {
            let start = ((cpl - c) / 2).max(l).min(cpl - r - c);
            out.extend(left);
            out.push(spaces(start - l));
            out.extend(center);
            out.push(spaces(cpl - r - c - start));
            out.extend(right);
        }
        out.retain(|p| !matches!(p, Piece::Text(t) if t.is_empty()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrow(auto_cut: bool) -> ContentEncoder {
        ContentEncoder::new(ReceiptFormat::for_paper(PaperWidth::Narrow), auto_cut)
    }

    fn line_text(line: &[u8]) -> String {
        // Strip the 3-byte alignment prefix and trailing LF.
        String::from_utf8_lossy(&line[3..line.len() - 1]).into_owned()
    }

    #[test]
    fn every_line_starts_with_its_own_alignment() {
        let payload = narrow(false).encode("[C]Title\nplain\n[R]end");
        assert_eq!(payload.lines[0][..3], cmd::align(Align::Center));
        assert_eq!(payload.lines[1][..3], cmd::align(Align::Left));
        assert_eq!(payload.lines[2][..3], cmd::align(Align::Right));
    }

    #[test]
    fn bold_span_is_switched_on_and_off() {
        let payload = narrow(false).encode("[L]<b>Hi</b> there");
        let mut expected = cmd::align(Align::Left).to_vec();
        expected.extend_from_slice(cmd::BOLD_ON);
        expected.extend_from_slice(b"Hi");
        expected.extend_from_slice(cmd::BOLD_OFF);
        expected.extend_from_slice(b" there\n");
        assert_eq!(payload.lines[0], expected);
    }

    #[test]
    fn unbalanced_tags_close_at_end_of_line() {
        let payload = narrow(false).encode("<u><dw>big");
        let line = &payload.lines[0];
        let tail = &line[line.len() - 7..];
        assert_eq!(&tail[..3], cmd::UNDERLINE_OFF);
        assert_eq!(&tail[3..6], cmd::char_size(false, false));
        assert_eq!(tail[6], cmd::LF);
    }

    #[test]
    fn stray_close_and_unknown_tags() {
        let payload = narrow(false).encode("</b>a <i>b</i>");
        assert_eq!(line_text(&payload.lines[0]), "a <i>b</i>");
    }

    #[test]
    fn width_and_height_combine_into_one_size_command() {
        let payload = narrow(false).encode("<dw><dh>X</dh></dw>");
        let line = &payload.lines[0];
        let parts: [&[u8]; 7] = [
            &cmd::align(Align::Left),
            &cmd::char_size(true, false),
            &cmd::char_size(true, true),
            b"X",
            &cmd::char_size(true, false),
            &cmd::char_size(false, false),
            b"\n",
        ];
        assert_eq!(*line, parts.concat());
    }

    #[test]
    fn blank_lines_stay_empty() {
        let payload = narrow(false).encode("a\n\nb");
        assert_eq!(payload.lines.len(), 3);
        let mut blank = cmd::align(Align::Left).to_vec();
        blank.push(cmd::LF);
        assert_eq!(payload.lines[1], blank);
    }

    #[test]
    fn latin_payload_stays_single_byte() {
        let payload = narrow(false).encode("Café");
        assert!(!payload.double_byte);
        assert_eq!(payload.prologue, cmd::INIT);
        assert_eq!(&payload.lines[0][3..], &[b'C', b'a', b'f', 0xE9, b'\n']);
    }

    #[test]
    fn any_cjk_switches_the_whole_payload_to_gbk() {
        let payload = narrow(false).encode("Café\n你好");
        assert!(payload.double_byte);
        assert!(payload.prologue.ends_with(&[0x1C, 0x26, 0x1C, 0x43, 0x01]));
        // Latin text shares the payload's encoding.
        let (gbk_e, _, _) = GBK.encode("é");
        assert_eq!(&payload.lines[0][6..6 + gbk_e.len()], &gbk_e[..]);
        assert_eq!(&payload.lines[1][3..7], &[0xC4, 0xE3, 0xBA, 0xC3]);
        assert!(payload.epilogue.starts_with(cmd::DOUBLE_BYTE_OFF));
    }

    #[test]
    fn auto_cut_feeds_then_cuts() {
        let payload = narrow(true).encode("x");
        assert_eq!(payload.epilogue, [0x1B, 0x64, 0x03, 0x1D, 0x56, 0x01]);
        assert!(narrow(false).encode("x").epilogue.is_empty());
    }

    #[test]
    fn column_line_fills_the_paper_width() {
        let payload = narrow(false).encode("[L]Total:[R]12.50");
        let text = line_text(&payload.lines[0]);
        assert_eq!(text.len(), 32);
        assert!(text.starts_with("Total:"));
        assert!(text.ends_with("12.50"));
    }

    #[test]
    fn column_tags_do_not_count_towards_width() {
        let plain = narrow(false).plain_lines("[L]<b>Total:</b>[R]12.50");
        assert_eq!(plain[0].len(), 32);
    }

    #[test]
    fn cjk_counts_double_in_columns() {
        let plain = narrow(false).plain_lines("[L]你好[R]1");
        assert_eq!(display_width(&plain[0]), 32);
        assert_eq!(plain[0].chars().filter(|c| *c == ' ').count(), 27);
    }

    #[test]
    fn overflowing_columns_are_joined_by_one_space() {
        let long = "x".repeat(30);
        let plain = narrow(false).plain_lines(&format!("[L]{long}[R]12.50"));
        assert_eq!(plain[0], format!("{long} 12.50"));
    }

    #[test]
    fn centre_column_sits_in_the_middle() {
        let plain = narrow(false).plain_lines("[L]a[C]mid[R]b");
        assert_eq!(plain[0].len(), 32);
        assert_eq!(plain[0].find("mid"), Some(14));
    }

    #[test]
    fn plain_lines_pad_centre_and_right() {
        let plain = narrow(false).plain_lines("[C]ab\n[R]ab");
        assert_eq!(plain[0], format!("{}ab", " ".repeat(15)));
        assert_eq!(plain[1], format!("{}ab", " ".repeat(30)));
    }

    #[test]
    fn encoding_is_deterministic() {
        let markup = "[C]<b>Shop</b>\n[L]1x Tea[R]3.00\n\n[C]谢谢";
        let encoder = narrow(true);
        assert_eq!(encoder.encode(markup), encoder.encode(markup));
    }

    #[test]
    fn wide_paper_uses_42_columns() {
        let encoder = ContentEncoder::new(ReceiptFormat::for_paper(PaperWidth::Wide), false);
        assert_eq!(encoder.format().dpi, 203);
        assert_eq!(encoder.plain_lines("[L]a[R]b")[0].len(), 42);
    }
}
