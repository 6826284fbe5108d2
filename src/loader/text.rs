//! Plain text, source code and Markdown.

use rag_harness_core::models::Anchor;

use super::{normalize, Parsed};

/// Decode UTF-8, replacing invalid sequences and reporting them.
fn decode(bytes: &[u8]) -> (String, Vec<String>) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => (normalize(s), Vec::new()),
        Err(e) => (
            normalize(&String::from_utf8_lossy(bytes)),
            vec![format!(
                "invalid UTF-8 sequences replaced (first at byte {})",
                e.valid_up_to()
            )],
        ),
    }
}

pub(super) fn parse_plain(bytes: &[u8]) -> Parsed {
    let (text, problems) = decode(bytes);
    Parsed {
        text,
        anchors: vec![Anchor::start()],
        problems,
    }
}

/// Markdown keeps its markup; every ATX heading outside fenced code opens
/// a section anchor at the start of its line.
pub(super) fn parse_markdown(bytes: &[u8]) -> Parsed {
    let (text, problems) = decode(bytes);

    let mut anchors = Vec::new();
    let mut offset = 0usize;
    let mut in_fence = false;

    for line in text.split('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some(title) = atx_heading(trimmed) {
                anchors.push(Anchor {
                    offset,
                    page: None,
                    section: Some(title),
                });
            }
        }
        offset += line.chars().count() + 1;
    }

    Parsed {
        text,
        anchors,
        problems,
    }
}

/// Title of an ATX heading line (`#` to `######` followed by a space).
fn atx_heading(line: &str) -> Option<String> {
    let level = line.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}
