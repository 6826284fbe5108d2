//! EPUB: `META-INF/container.xml` → OPF package → spine items in reading
//! order. Each spine item becomes a section anchor named after its first
//! heading (or `<title>`, or its file name).

use std::collections::HashMap;
use std::io::Cursor;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

use super::{collapse_whitespace, read_zip_entry, xml_text, Parsed, TextBuilder};

const CONTAINER_PATH: &str = "META-INF/container.xml";

pub(super) fn parse(bytes: &[u8]) -> Parsed {
    let mut archive = match zip::ZipArchive::new(Cursor::new(bytes)) {
        Ok(a) => a,
        Err(e) => {
            return Parsed {
                problems: vec![format!("EPUB archive unreadable: {}", e)],
                ..Default::default()
            }
        }
    };

    let opf_path = match locate_package(&mut archive) {
        Ok(p) => p,
        Err(e) => {
            return Parsed {
                problems: vec![e],
                ..Default::default()
            }
        }
    };
    let spine = match read_zip_entry(&mut archive, &opf_path).and_then(|xml| read_spine(&xml)) {
        Ok(s) => s,
        Err(e) => {
            return Parsed {
                problems: vec![format!("EPUB package {} unreadable: {}", opf_path, e)],
                ..Default::default()
            }
        }
    };

    let base = match opf_path.rfind('/') {
        Some(i) => &opf_path[..=i],
        None => "",
    };

    let mut builder = TextBuilder::new();
    let mut problems = Vec::new();
    for href in spine {
        let path = resolve_href(base, &href);
        let chapter = read_zip_entry(&mut archive, &path).and_then(|xml| xhtml_text(&xml));
        match chapter {
            Ok(chapter) => {
                let title = chapter.title.unwrap_or_else(|| file_stem(&path));
                builder.anchor(None, Some(title));
                for block in &chapter.blocks {
                    builder.push_block(block);
                }
            }
            Err(e) => {
                warn!(item = %path, error = %e, "skipping unreadable EPUB spine item");
                problems.push(format!("spine item {} unreadable: {}", path, e));
            }
        }
    }

    builder.into_parsed(problems)
}

/// Path of the OPF package named by the container, or the first `.opf`
/// entry if the container is missing.
fn locate_package(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
) -> std::result::Result<String, String> {
    if let Ok(xml) = read_zip_entry(archive, CONTAINER_PATH) {
        let mut reader = Reader::from_reader(xml.as_slice());
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e))
                    if e.local_name().as_ref() == b"rootfile" =>
                {
                    if let Some(path) = attr(&e, b"full-path") {
                        return Ok(path);
                    }
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
    }
    archive
        .file_names()
        .find(|n| n.ends_with(".opf"))
        .map(str::to_string)
        .ok_or_else(|| "EPUB has no OPF package document".to_string())
}

/// Hrefs of the spine items, in reading order.
fn read_spine(opf: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut idrefs: Vec<String> = Vec::new();

    let mut reader = Reader::from_reader(opf);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attr(&e, b"id"), attr(&e, b"href")) {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    let linear = attr(&e, b"linear").unwrap_or_default();
                    if let Some(idref) = attr(&e, b"idref") {
                        if linear != "no" {
                            idrefs.push(idref);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    if idrefs.is_empty() {
        return Err("empty spine".to_string());
    }
    Ok(idrefs
        .into_iter()
        .filter_map(|id| manifest.get(&id).cloned())
        .collect())
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Join an href onto the package directory, resolving `..` segments.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or_default();
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn file_stem(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name).to_string()
}

#[derive(Debug, Default)]
struct Chapter {
    title: Option<String>,
    blocks: Vec<String>,
}

/// Paragraph-level text of an XHTML document.
fn xhtml_text(xml: &[u8]) -> std::result::Result<Chapter, String> {
    let mut chapter = Chapter::default();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut current = String::new();
    let mut skip_depth = 0usize;
    let mut in_body = false;
    let mut in_title = false;
    let mut doc_title = String::new();
    let mut in_heading = false;
    let mut heading = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"script" | b"style" => skip_depth += 1,
                    b"title" if !in_body => in_title = true,
                    b"body" => in_body = true,
                    n if is_block(n) => flush(&mut current, &mut chapter.blocks),
                    _ => {}
                }
                if is_heading(&name) && chapter.title.is_none() {
                    in_heading = true;
                    heading.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref().eq_ignore_ascii_case(b"br") {
                    current.push('\n');
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"script" | b"style" => skip_depth = skip_depth.saturating_sub(1),
                    b"title" => in_title = false,
                    n if is_block(n) => {
                        if is_heading(n) && in_heading {
                            in_heading = false;
                            let h = collapse_whitespace(&heading);
                            if !h.is_empty() {
                                chapter.title = Some(h);
                            }
                        }
                        flush(&mut current, &mut chapter.blocks);
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(te)) => {
                // Source line breaks are insignificant; only <br/> breaks lines.
                let text = xml_text(&te).replace('\n', " ");
                if in_title {
                    doc_title.push_str(&text);
                } else if in_body && skip_depth == 0 {
                    if in_heading {
                        heading.push_str(&text);
                    }
                    current.push_str(&text);
                }
            }
            Ok(Event::CData(cd)) => {
                if in_body && skip_depth == 0 {
                    current.push_str(&String::from_utf8_lossy(&cd));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    flush(&mut current, &mut chapter.blocks);

    if chapter.title.is_none() {
        let t = collapse_whitespace(&doc_title);
        if !t.is_empty() {
            chapter.title = Some(t);
        }
    }
    Ok(chapter)
}

fn is_heading(name: &[u8]) -> bool {
    matches!(name, b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6")
}

fn is_block(name: &[u8]) -> bool {
    is_heading(name)
        || matches!(
            name,
            b"p" | b"div" | b"li" | b"blockquote" | b"pre" | b"tr" | b"section" | b"dt" | b"dd"
        )
}

fn flush(current: &mut String, blocks: &mut Vec<String>) {
    let lines: Vec<String> = current
        .split('\n')
        .map(collapse_whitespace)
        .filter(|l| !l.is_empty())
        .collect();
    if !lines.is_empty() {
        blocks.push(lines.join("\n"));
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_href() {
        assert_eq!(resolve_href("OEBPS/", "text/ch1.xhtml"), "OEBPS/text/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/text/", "../images/a.png"), "OEBPS/images/a.png");
        assert_eq!(resolve_href("", "ch1.xhtml#frag"), "ch1.xhtml");
    }

    #[test]
    fn test_xhtml_text_blocks_and_title() {
        let xhtml = br#"<?xml version="1.0"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>Fallback</title><style>p { color: red; }</style></head>
<body>
  <h1>Chapter   One</h1>
  <p>It was a <em>dark</em> and
     stormy night.</p>
  <p>Line one<br/>Line two</p>
  <script>var x = 1;</script>
</body>
</html>"#;
        let chapter = xhtml_text(xhtml).unwrap();
        assert_eq!(chapter.title.as_deref(), Some("Chapter One"));
        assert_eq!(
            chapter.blocks,
            vec![
                "Chapter One".to_string(),
                "It was a dark and stormy night.".to_string(),
                "Line one\nLine two".to_string(),
            ]
        );
    }

    #[test]
    fn test_title_falls_back_to_head() {
        let xhtml = br#"<html><head><title>Preface</title></head><body><p>Hi</p></body></html>"#;
        let chapter = xhtml_text(xhtml).unwrap();
        assert_eq!(chapter.title.as_deref(), Some("Preface"));
    }

    #[test]
    fn test_corrupt_archive() {
        let parsed = parse(b"PK\x03\x04 definitely not a zip");
        assert!(parsed.text.is_empty());
        assert!(parsed.problems[0].contains("EPUB archive unreadable"));
    }
}
