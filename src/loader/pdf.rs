//! PDF text via `pdf-extract`, one page anchor per page.

use tracing::debug;

use super::{Parsed, TextBuilder};

pub(super) fn parse(bytes: &[u8]) -> Parsed {
    let pages = match pdf_extract::extract_text_from_mem_by_pages(bytes) {
        Ok(pages) => pages,
        Err(e) => {
            return Parsed {
                problems: vec![format!("PDF extraction failed: {}", e)],
                ..Default::default()
            }
        }
    };
    debug!(pages = pages.len(), "extracted PDF pages");

    let mut builder = TextBuilder::new();
    let mut empty_pages = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let number = i as u32 + 1;
        if page.trim().is_empty() {
            empty_pages.push(number);
        }
        builder.anchor(Some(number), None);
        builder.push_block(page);
    }

    let mut problems = Vec::new();
    if !pages.is_empty() && empty_pages.len() == pages.len() {
        problems.push("PDF has no extractable text (scanned or image-only?)".to_string());
    }
    builder.into_parsed(problems)
}
