//! DOCX: `word/document.xml`, `w:t` runs concatenated per `w:p` paragraph.

use std::io::Cursor;

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{read_zip_entry, xml_text, Parsed, TextBuilder};

const DOCUMENT_PATH: &str = "word/document.xml";

pub(super) fn parse(bytes: &[u8]) -> Parsed {
    let xml = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| format!("DOCX archive unreadable: {}", e))
        .and_then(|mut archive| read_zip_entry(&mut archive, DOCUMENT_PATH));
    let xml = match xml {
        Ok(x) => x,
        Err(e) => {
            return Parsed {
                problems: vec![e],
                ..Default::default()
            }
        }
    };

    let mut builder = TextBuilder::new();
    builder.anchor(None, None);
    match paragraphs(&xml) {
        Ok(paras) => {
            builder.push_block(&paras.join("\n"));
            builder.into_parsed(Vec::new())
        }
        Err((paras, e)) => {
            builder.push_block(&paras.join("\n"));
            builder.into_parsed(vec![format!("{} malformed: {}", DOCUMENT_PATH, e)])
        }
    }
}

/// Paragraph texts. On malformed XML, the paragraphs read so far are
/// returned with the error.
fn paragraphs(xml: &[u8]) -> std::result::Result<Vec<String>, (Vec<String>, String)> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paras = Vec::new();
    let mut current = String::new();
    let mut in_t = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"p" => current.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => current.push_str(&xml_text(&te)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => paras.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err((paras, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(paras)
}
