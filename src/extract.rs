//! Plain-text extraction from versioner XML.
//!
//! The full-text endpoint serves the eCFR's own markup (`DIV8`, `HEAD`, `P`,
//! `FP`, ...). Extraction keeps the character data and turns block-level
//! elements into paragraph breaks (`\n\n`), so the paragraph counter in
//! [`crate::readability`] sees the document's real structure.
//!
//! Payloads are fragments as often as documents: several top-level elements
//! and stray text are accepted. Mismatched tags are an error; callers keep
//! the raw markup and store no processed text.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("malformed XML: {0}")]
    Malformed(String),
}

/// Elements that start a new paragraph. `DIV1`..`DIV9` are matched by prefix.
const BLOCK_ELEMENTS: &[&[u8]] = &[
    b"P",
    b"FP",
    b"HEAD",
    b"HD",
    b"NOTE",
    b"EXTRACT",
    b"SECTION",
    b"SUBJECT",
    b"AUTH",
    b"SOURCE",
    b"CITA",
    b"EDNOTE",
    b"GPOTABLE",
    b"ROW",
    b"APPENDIX",
];

fn is_block(name: &[u8]) -> bool {
    name.starts_with(b"DIV") || BLOCK_ELEMENTS.iter().any(|b| b.eq_ignore_ascii_case(name))
}

/// Extract paragraph-separated plain text from `xml`.
pub fn extract_xml_text(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if is_block(e.local_name().as_ref()) {
                    flush(&mut current, &mut paragraphs);
                }
            }
            Ok(Event::End(e)) => {
                if is_block(e.local_name().as_ref()) {
                    flush(&mut current, &mut paragraphs);
                }
            }
            Ok(Event::Text(t)) => {
                // Named HTML entities are not XML; keep them verbatim.
                match t.unescape() {
                    Ok(text) => push_words(&mut current, &text),
                    Err(_) => push_words(&mut current, &String::from_utf8_lossy(&t)),
                }
            }
            Ok(Event::CData(c)) => {
                push_words(&mut current, &String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Malformed(e.to_string())),
            _ => {}
        }
    }
    flush(&mut current, &mut paragraphs);

    Ok(paragraphs.join("\n\n"))
}

fn push_words(current: &mut String, text: &str) {
    for word in text.split_whitespace() {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
}

fn flush(current: &mut String, paragraphs: &mut Vec<String>) {
    if !current.is_empty() {
        paragraphs.push(std::mem::take(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_elements_become_paragraphs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <DIV8 N="52.1" TYPE="SECTION">
              <HEAD>§ 52.1   Introduction.</HEAD>
              <P>(a) This part sets forth
                 the plans.</P>
              <P>(b) Each <I>subpart</I> applies.</P>
            </DIV8>"#;
        let text = extract_xml_text(xml).unwrap();
        assert_eq!(
            text,
            "§ 52.1 Introduction.\n\n(a) This part sets forth the plans.\n\n(b) Each subpart applies."
        );
    }

    #[test]
    fn fragments_with_several_roots() {
        let text = extract_xml_text("<P>One.</P><P>Two.</P>").unwrap();
        assert_eq!(text, "One.\n\nTwo.");
    }

    #[test]
    fn entities_are_decoded() {
        let text = extract_xml_text("<P>A &amp; B &#167; 3</P>").unwrap();
        assert_eq!(text, "A & B § 3");
    }

    #[test]
    fn empty_markup_yields_empty_text() {
        assert_eq!(extract_xml_text("<DIV5/>").unwrap(), "");
        assert_eq!(extract_xml_text("").unwrap(), "");
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let err = extract_xml_text("<P>open</HEAD>").unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)));
    }
}
