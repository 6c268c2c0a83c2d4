//! Document parsers.
//!
//! Every parser returns plain text with paragraph boundaries preserved:
//! contiguous non-empty lines form paragraphs, paragraphs are separated by a
//! double newline, DOCX tables become pipe-joined rows framed by blank
//! lines, and PDF page boundaries are promoted to paragraph boundaries.
//! The recursive splitter relies on "\n\n" as its highest-priority
//! separator, so this contract is load-bearing.

use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;

use super::{FileStoreError, FileType, Result};

/// Parse a stored file according to its detected type.
pub fn parse_file(path: &Path, file_type: FileType) -> Result<String> {
    let text = match file_type {
        FileType::Txt | FileType::Md => parse_text(path)?,
        FileType::Pdf => parse_pdf(path)?,
        FileType::Docx => parse_docx(path)?,
        FileType::Html => parse_html(path)?,
    };

    tracing::debug!(path = %path.display(), chars = text.chars().count(), "file parsed");
    Ok(text)
}

// ============================================================================
// Plain text / Markdown
// ============================================================================

fn parse_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    // Lossy fallback keeps legacy single-byte encodings readable instead of
    // failing the whole ingestion.
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

// ============================================================================
// PDF
// ============================================================================

fn parse_pdf(path: &Path) -> Result<String> {
    let doc = lopdf::Document::load(path)
        .map_err(|e| FileStoreError::Parse(format!("failed to load PDF: {}", e)))?;

    let mut pages = Vec::new();
    for (page_number, _) in doc.get_pages() {
        let page_text = doc
            .extract_text(&[page_number])
            .map_err(|e| FileStoreError::Parse(format!("failed to extract page {}: {}", page_number, e)))?;

        if page_text.trim().is_empty() {
            continue;
        }

        // Collapse runs of blank lines within a page to a single paragraph
        // separator; pages themselves join with a paragraph separator.
        let mut cleaned = Vec::new();
        let mut prev_empty = false;
        for line in page_text.lines() {
            let line = line.trim();
            if !line.is_empty() {
                cleaned.push(line.to_string());
                prev_empty = false;
            } else if !prev_empty {
                cleaned.push(String::new());
                prev_empty = true;
            }
        }

        pages.push(format!("[Page {}]\n{}", page_number, cleaned.join("\n")));
    }

    Ok(pages.join("\n\n"))
}

// ============================================================================
// DOCX
// ============================================================================

/// DOCX files are ZIP archives; the document body lives in
/// `word/document.xml`. Paragraphs (`w:p`) become text lines, tables
/// (`w:tbl`/`w:tr`/`w:tc`) become pipe-joined rows.
fn parse_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| FileStoreError::Parse(format!("failed to open DOCX archive: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| FileStoreError::Parse(format!("missing word/document.xml: {}", e)))?
        .read_to_string(&mut xml)?;

    let mut reader = Reader::from_str(&xml);

    let mut parts: Vec<String> = Vec::new();
    let mut paragraph = String::new();
    let mut in_table = false;
    let mut table_rows: Vec<String> = Vec::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    in_table = true;
                    table_rows.clear();
                }
                b"w:tr" => row_cells.clear(),
                b"w:tc" => cell.clear(),
                b"w:p" if !in_table => paragraph.clear(),
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    in_table = false;
                    if !table_rows.is_empty() {
                        // Tables stand alone between blank lines.
                        parts.push(table_rows.join("\n"));
                    }
                }
                b"w:tr" => {
                    if !row_cells.is_empty() {
                        table_rows.push(row_cells.join(" | "));
                    }
                }
                b"w:tc" => {
                    let text = cell.trim().to_string();
                    if !text.is_empty() {
                        row_cells.push(text);
                    }
                }
                b"w:p" if !in_table => {
                    let text = paragraph.trim().to_string();
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| FileStoreError::Parse(format!("bad XML text: {}", e)))?;
                if in_table {
                    cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FileStoreError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(parts.join("\n\n"))
}

// ============================================================================
// HTML
// ============================================================================

static SCRIPT_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)<script\b.*?</script>|<style\b.*?</style>|<head\b.*?</head>|<nav\b.*?</nav>|<footer\b.*?</footer>",
    )
    .expect("valid script regex")
});
static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex"));
static BLOCK_BREAKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|table|blockquote|section|article|ul|ol)>")
        .expect("valid block regex")
});
static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag regex"));
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank-run regex"));

/// Strip markup, promoting block-element boundaries to paragraph breaks.
fn parse_html(path: &Path) -> Result<String> {
    let html = parse_text(path)?;

    let text = SCRIPT_BLOCKS.replace_all(&html, "");
    let text = COMMENTS.replace_all(&text, "");
    let text = BLOCK_BREAKS.replace_all(&text, "\n\n");
    let text = LINE_BREAKS.replace_all(&text, "\n");
    let text = TAGS.replace_all(&text, "");

    let text = decode_entities(&text);

    // Trim per line, then collapse blank runs to paragraph separators.
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    let collapsed = BLANK_RUNS.replace_all(&joined, "\n\n");
    Ok(collapsed.trim().to_string())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    #[test]
    fn test_parse_text() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", "hello\n\nworld".as_bytes());
        assert_eq!(parse_file(&path, FileType::Txt).unwrap(), "hello\n\nworld");
    }

    #[test]
    fn test_parse_text_invalid_utf8_is_lossy() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", &[0x68, 0x69, 0xFF, 0x21]);
        let text = parse_file(&path, FileType::Txt).unwrap();
        assert!(text.starts_with("hi"));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn test_parse_html_paragraphs() {
        let dir = TempDir::new().unwrap();
        let html = r#"<html><head><title>t</title></head><body>
            <script>var x = 1;</script>
            <h1>Title</h1>
            <p>First paragraph with &amp; entity.</p>
            <p>Second<br>paragraph.</p>
            <!-- a comment -->
        </body></html>"#;
        let path = write_file(&dir, "a.html", html.as_bytes());

        let text = parse_file(&path, FileType::Html).unwrap();
        assert!(text.contains("Title"));
        assert!(text.contains("First paragraph with & entity."));
        assert!(text.contains("Second\nparagraph."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("a comment"));
        // Block boundaries became double newlines.
        assert!(text.contains("\n\n"));
        assert!(!text.contains("\n\n\n"));
    }

    #[test]
    fn test_parse_docx_paragraphs_and_table() {
        let dir = TempDir::new().unwrap();
        let document_xml = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>Intro paragraph.</w:t></w:r></w:p>
                <w:tbl>
                  <w:tr>
                    <w:tc><w:p><w:r><w:t>Name</w:t></w:r></w:p></w:tc>
                    <w:tc><w:p><w:r><w:t>Role</w:t></w:r></w:p></w:tc>
                  </w:tr>
                  <w:tr>
                    <w:tc><w:p><w:r><w:t>Alice</w:t></w:r></w:p></w:tc>
                    <w:tc><w:p><w:r><w:t>Engineer</w:t></w:r></w:p></w:tc>
                  </w:tr>
                </w:tbl>
                <w:p><w:r><w:t>Closing paragraph.</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;

        let path = dir.path().join("a.docx");
        let file = std::fs::File::create(&path).unwrap();
        let mut archive = zip::ZipWriter::new(file);
        archive
            .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        archive.write_all(document_xml.as_bytes()).unwrap();
        archive.finish().unwrap();

        let text = parse_file(&path, FileType::Docx).unwrap();
        assert!(text.contains("Intro paragraph."));
        assert!(text.contains("Name | Role"));
        assert!(text.contains("Alice | Engineer"));
        assert!(text.contains("Closing paragraph."));
        // Table rows are framed by paragraph separators.
        assert!(text.contains("Intro paragraph.\n\nName | Role"));
    }

    #[test]
    fn test_parse_missing_file() {
        let err = parse_file(Path::new("/nonexistent/a.txt"), FileType::Txt);
        assert!(matches!(err, Err(FileStoreError::Io(_))));
    }
}
