//! FictionBook 2: paragraphs of every `<body>`, one section anchor per
//! titled `<section>`. Embedded `<binary>` payloads are ignored.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{collapse_whitespace, xml_text, Parsed, TextBuilder};

pub(super) fn parse(bytes: &[u8]) -> Parsed {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut builder = TextBuilder::new();
    let mut problems = Vec::new();

    let mut body_depth = 0usize;
    let mut title_depth = 0usize;
    let mut title_lines: Vec<String> = Vec::new();
    let mut in_para = false;
    let mut para = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"body" => body_depth += 1,
                b"title" if body_depth > 0 => {
                    title_depth += 1;
                    if title_depth == 1 {
                        title_lines.clear();
                    }
                }
                b"p" | b"v" | b"subtitle" | b"text-author" if body_depth > 0 => {
                    in_para = true;
                    para.clear();
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_para => para.push_str(&xml_text(&te)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"body" => body_depth = body_depth.saturating_sub(1),
                b"p" | b"v" | b"subtitle" | b"text-author" if in_para => {
                    in_para = false;
                    let line = collapse_whitespace(&para);
                    if title_depth > 0 {
                        if !line.is_empty() {
                            title_lines.push(line);
                        }
                    } else {
                        builder.push_block(&line);
                    }
                }
                b"title" if title_depth > 0 => {
                    title_depth -= 1;
                    if title_depth == 0 && !title_lines.is_empty() {
                        let title = title_lines.join(" ");
                        builder.anchor(None, Some(title.clone()));
                        builder.push_block(&title);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                problems.push(format!("FB2 XML malformed: {}", e));
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    if builder.is_empty() && problems.is_empty() {
        problems.push("FB2 document has no <body> text".to_string());
    }
    builder.into_parsed(problems)
}
