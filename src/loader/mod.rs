//! Document loader: raw bytes in, normalized text with anchors out.
//!
//! The format comes from the caller's hint (explicit format, MIME type or
//! file extension). If none of those resolves, it is sniffed from the
//! content itself. Each [`SourceFormat`] maps to one parser in [`PARSERS`].
//!
//! # Normalization
//!
//! - `\r\n` and lone `\r` become `\n`.
//! - NUL characters are removed.
//! - Trailing whitespace of the whole document is trimmed.
//!
//! Anchors are character offsets into the normalized text, sorted, with the
//! first one at offset 0.
//!
//! # Failure modes
//!
//! | Situation | Result |
//! |-----------|--------|
//! | No parser for the format | `UnsupportedFormat` |
//! | Some content unreadable | `PartialExtraction` with what was recovered |
//! | Known format, corrupt container | `PartialExtraction` with empty text |
//!
//! Loading has no side effects.

mod docx;
mod epub;
mod fb2;
mod pdf;
mod text;

use std::io::{Cursor, Read};
use std::path::Path;

use rag_harness_core::models::{Anchor, SourceFormat};
use rag_harness_core::{RagError, Result};

/// Maximum decompressed bytes read from a single archive entry.
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// What the caller knows about the bytes it hands to the loader.
#[derive(Debug, Clone, Default)]
pub struct FormatHint {
    pub format: Option<SourceFormat>,
    pub mime: Option<String>,
    pub extension: Option<String>,
}

impl FormatHint {
    pub fn format(format: SourceFormat) -> Self {
        FormatHint {
            format: Some(format),
            ..Default::default()
        }
    }

    /// Hint taken from the extension of a file name or path.
    pub fn from_name(name: &str) -> Self {
        FormatHint {
            extension: Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_string),
            ..Default::default()
        }
    }

    fn resolve(&self) -> Option<SourceFormat> {
        self.format
            .or_else(|| self.mime.as_deref().and_then(SourceFormat::from_mime))
            .or_else(|| {
                self.extension
                    .as_deref()
                    .and_then(SourceFormat::from_extension)
            })
    }
}

/// Normalized text of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub format: SourceFormat,
    pub text: String,
    pub anchors: Vec<Anchor>,
}

/// Raw parser output before normalization.
#[derive(Debug, Default)]
pub(crate) struct Parsed {
    pub text: String,
    pub anchors: Vec<Anchor>,
    /// Parts of the input that could not be read.
    pub problems: Vec<String>,
}

type ParseFn = fn(&[u8]) -> Parsed;

/// Parser strategy per format.
const PARSERS: [(SourceFormat, ParseFn); 7] = [
    (SourceFormat::Text, text::parse_plain),
    (SourceFormat::Code, text::parse_plain),
    (SourceFormat::Markdown, text::parse_markdown),
    (SourceFormat::Pdf, pdf::parse),
    (SourceFormat::Epub, epub::parse),
    (SourceFormat::Docx, docx::parse),
    (SourceFormat::Fb2, fb2::parse),
];

/// Resolve the format from the hint, falling back to content sniffing.
pub fn resolve_format(bytes: &[u8], hint: &FormatHint) -> Result<SourceFormat> {
    if let Some(format) = hint.resolve() {
        return Ok(format);
    }
    sniff(bytes).ok_or_else(|| {
        let declared = hint
            .mime
            .clone()
            .or_else(|| hint.extension.clone())
            .unwrap_or_else(|| "unrecognized content".to_string());
        RagError::UnsupportedFormat(declared)
    })
}

/// Load a document whose format is resolved from `hint` or sniffed.
pub fn load(bytes: &[u8], hint: &FormatHint) -> Result<Extraction> {
    let format = resolve_format(bytes, hint)?;
    load_as(bytes, format)
}

/// Load a document of a known format.
pub fn load_as(bytes: &[u8], format: SourceFormat) -> Result<Extraction> {
    let parse = PARSERS
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, p)| *p)
        .ok_or_else(|| RagError::UnsupportedFormat(format.to_string()))?;

    let parsed = parse(bytes);
    let (text, anchors) = finish(parsed.text, parsed.anchors);

    if parsed.problems.is_empty() {
        Ok(Extraction {
            format,
            text,
            anchors,
        })
    } else {
        Err(RagError::PartialExtraction {
            text,
            anchors,
            reason: parsed.problems.join("; "),
        })
    }
}

/// Guess the format from magic bytes and structure.
pub fn sniff(bytes: &[u8]) -> Option<SourceFormat> {
    if bytes.starts_with(b"%PDF") {
        return Some(SourceFormat::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return sniff_zip(bytes);
    }

    let head = &bytes[..bytes.len().min(1024)];
    let head_text = String::from_utf8_lossy(head);
    if head_text.contains("<FictionBook") {
        return Some(SourceFormat::Fb2);
    }

    let sample = &bytes[..bytes.len().min(8192)];
    if !sample.contains(&0) && std::str::from_utf8(bytes).is_ok() {
        return Some(SourceFormat::Text);
    }
    None
}

fn sniff_zip(bytes: &[u8]) -> Option<SourceFormat> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;

    if let Ok(mimetype) = read_zip_entry(&mut archive, "mimetype") {
        if mimetype.trim_ascii() == b"application/epub+zip" {
            return Some(SourceFormat::Epub);
        }
    }
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    if names.iter().any(|n| n == "word/document.xml") {
        return Some(SourceFormat::Docx);
    }
    if names.iter().any(|n| n.ends_with(".opf")) {
        return Some(SourceFormat::Epub);
    }
    None
}

/// `\r\n`/`\r` to `\n`, NULs removed.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").replace('\0', "")
}

/// Normalize the assembled text and tidy the anchor list against it.
fn finish(text: String, mut anchors: Vec<Anchor>) -> (String, Vec<Anchor>) {
    let normalized = normalize(&text);
    let text = if normalized.len() == text.len() {
        normalized.trim_end().to_string()
    } else {
        // Normalization changed lengths; anchors from the raw text no
        // longer line up, so only the start anchor survives.
        anchors.retain(|a| a.offset == 0);
        normalized.trim_end().to_string()
    };
    let n = text.chars().count();

    anchors.sort_by_key(|a| a.offset);
    anchors.retain(|a| a.offset == 0 || a.offset < n);

    let mut tidy: Vec<Anchor> = Vec::with_capacity(anchors.len());
    for anchor in anchors {
        match tidy.last_mut() {
            Some(last) if last.offset == anchor.offset => *last = anchor,
            _ => tidy.push(anchor),
        }
    }
    if tidy.first().map(|a| a.offset) != Some(0) {
        tidy.insert(0, Anchor::start());
    }
    (text, tidy)
}

/// Assembles text out of blocks separated by blank lines, tracking the
/// character offset for anchors.
#[derive(Debug, Default)]
pub(crate) struct TextBuilder {
    text: String,
    chars: usize,
    anchors: Vec<Anchor>,
}

impl TextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor the next block to a page and/or section.
    pub fn anchor(&mut self, page: Option<u32>, section: Option<String>) {
        self.anchors.push(Anchor {
            offset: self.chars,
            page,
            section,
        });
    }

    /// Append a block. Blank blocks are skipped.
    pub fn push_block(&mut self, block: &str) {
        let block = normalize(block);
        let block = block.trim_start_matches('\n').trim_end();
        if block.is_empty() {
            return;
        }
        self.text.push_str(block);
        self.text.push_str("\n\n");
        self.chars += block.chars().count() + 2;
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_parsed(self, problems: Vec<String>) -> Parsed {
        Parsed {
            text: self.text,
            anchors: self.anchors,
            problems,
        }
    }
}

/// Read a whole archive entry, bounded by [`MAX_ENTRY_BYTES`].
pub(crate) fn read_zip_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(format!(
            "{} exceeds size limit ({} bytes)",
            name, MAX_ENTRY_BYTES
        ));
    }
    Ok(out)
}

/// Unescaped text of an XML text node. Unknown entities (common in XHTML)
/// fall back to the raw text.
pub(crate) fn xml_text(te: &quick_xml::events::BytesText<'_>) -> String {
    match te.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(te).into_owned(),
    }
}

/// Collapse runs of whitespace to single spaces and trim.
pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
