//! Single-page PDF documents built from positioned lines of text.
//!
//! Only the two standard Helvetica faces are used, so no fonts are embedded.
//! Text is written in WinAnsi encoding; characters outside it become `?`.

use std::fmt::Write as _;

const PAGE_WIDTH: u32 = 612;
const PAGE_HEIGHT: u32 = 792;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Face {
    Regular,
    Bold,
}

impl Face {
    fn resource(self) -> &'static str {
        match self {
            Face::Regular => "F1",
            Face::Bold => "F2",
        }
    }
}

#[derive(Debug, Clone)]
struct TextRun {
    x: u32,
    y: u32,
    size: u32,
    face: Face,
    text: String,
}

/// Lays text out top to bottom starting at the top margin.
#[derive(Debug, Clone)]
pub struct Page {
    runs: Vec<TextRun>,
    margin: u32,
    cursor: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self::new(72)
    }
}

impl Page {
    pub fn new(margin: u32) -> Self {
        Self {
            runs: Vec::new(),
            margin,
            cursor: PAGE_HEIGHT.saturating_sub(margin),
        }
    }

    pub fn line(&mut self, face: Face, size: u32, text: impl Into<String>) -> &mut Self {
        self.cursor = self.cursor.saturating_sub(size);
        self.runs.push(TextRun {
            x: self.margin,
            y: self.cursor,
            size,
            face,
            text: text.into(),
        });
        self.cursor = self.cursor.saturating_sub(size / 2);
        self
    }

    /// Word-wraps `text` at `width` characters.
    pub fn paragraph(&mut self, size: u32, width: usize, text: &str) -> &mut Self {
        let mut current = String::new();
        for word in text.split_whitespace() {
            if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
                self.line(Face::Regular, size, std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            self.line(Face::Regular, size, current);
        }
        self
    }

    pub fn gap(&mut self, points: u32) -> &mut Self {
        self.cursor = self.cursor.saturating_sub(points);
        self
    }

    fn content(&self) -> String {
        let mut stream = String::new();
        for run in &self.runs {
            let _ = writeln!(
                stream,
                "BT /{} {} Tf {} {} Td ({}) Tj ET",
                run.face.resource(),
                run.size,
                run.x,
                run.y,
                escape(&run.text)
            );
        }
        stream
    }

    pub fn render(&self) -> Vec<u8> {
        let content = self.content();
        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
                 /Resources << /Font << /F1 5 0 R /F2 6 0 R >> >> /Contents 4 0 R >>"
            ),
            format!("<< /Length {} >>\nstream\n{content}endstream", content.len()),
            font("Helvetica"),
            font("Helvetica-Bold"),
        ];

        let mut out = String::from("%PDF-1.4\n");
        let mut offsets = Vec::with_capacity(objects.len());
        for (index, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            let _ = write!(out, "{} 0 obj\n{body}\nendobj\n", index + 1);
        }

        let xref_at = out.len();
        let _ = write!(out, "xref\n0 {}\n0000000000 65535 f\r\n", objects.len() + 1);
        for offset in offsets {
            let _ = write!(out, "{offset:010} 00000 n\r\n");
        }
        let _ = write!(
            out,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            objects.len() + 1
        );
        out.into_bytes()
    }
}

fn font(base: &str) -> String {
    format!("<< /Type /Font /Subtype /Type1 /BaseFont /{base} /Encoding /WinAnsiEncoding >>")
}

/// Escapes text for a PDF literal string. Bytes above ASCII are written as
/// octal escapes so the file stays 7-bit.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            ' '..='~' => out.push(ch),
            _ => match win_ansi(ch) {
                Some(byte) => {
                    let _ = write!(out, "\\{byte:03o}");
                }
                None => out.push('?'),
            },
        }
    }
    out
}

fn win_ansi(ch: char) -> Option<u8> {
    match ch {
        '\u{A0}'..='\u{FF}' => Some(ch as u32 as u8),
        '€' => Some(0x80),
        '–' => Some(0x96),
        '—' => Some(0x97),
        '‘' => Some(0x91),
        '’' => Some(0x92),
        '“' => Some(0x93),
        '”' => Some(0x94),
        '•' => Some(0x95),
        _ => None,
    }
}
