//! Text extraction for the document loader.
//!
//! The file extension picks the extractor. Plain text and unknown
//! extensions are read as UTF-8; HTML is reduced to visible text; PDF and
//! the OOXML formats (docx, pptx, xlsx) are best-effort. Extraction never
//! panics: every failure is an [`ExtractError`] and the loader skips the
//! file.

use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::Event;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

/// Cap on sheets read from one workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Cap on cells read from one sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Cap on decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("binary file with no text extractor")]
    NotText,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// How a file's bytes are turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Html,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("html") | Some("htm") => DocumentKind::Html,
            Some("pdf") => DocumentKind::Pdf,
            Some("docx") => DocumentKind::Docx,
            Some("pptx") => DocumentKind::Pptx,
            Some("xlsx") => DocumentKind::Xlsx,
            _ => DocumentKind::Text,
        }
    }

    /// Classify a fetched resource by its `Content-Type` header.
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => DocumentKind::Html,
            "application/pdf" => DocumentKind::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                DocumentKind::Docx
            }
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                DocumentKind::Pptx
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                DocumentKind::Xlsx
            }
            _ => DocumentKind::Text,
        }
    }
}

/// Extracted text plus the document title, when the format carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    pub title: Option<String>,
}

impl Extracted {
    fn untitled(text: String) -> Self {
        Self { text, title: None }
    }
}

pub fn extract(bytes: &[u8], kind: DocumentKind) -> Result<Extracted, ExtractError> {
    match kind {
        DocumentKind::Text => std::str::from_utf8(bytes)
            .map(|s| Extracted::untitled(s.to_string()))
            .map_err(|_| ExtractError::NotText),
        DocumentKind::Html => Ok(html_to_text(&String::from_utf8_lossy(bytes))),
        DocumentKind::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map(Extracted::untitled)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        DocumentKind::Docx => extract_docx(bytes).map(Extracted::untitled),
        DocumentKind::Pptx => extract_pptx(bytes).map(Extracted::untitled),
        DocumentKind::Xlsx => extract_xlsx(bytes).map(Extracted::untitled),
    }
}

// ============ HTML ============

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "head", "template", "svg"];
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "main", "nav", "aside", "h1", "h2",
    "h3", "h4", "h5", "h6", "li", "ul", "ol", "tr", "table", "pre", "blockquote", "br",
];

/// Visible text of an HTML page, one block element per line.
pub fn html_to_text(html: &str) -> Extracted {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });

    let body = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next());

    let mut raw = String::new();
    match body {
        Some(el) => collect_visible(el, &mut raw),
        None => collect_visible(document.root_element(), &mut raw),
    }

    let text = raw
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    Extracted { text, title }
}

fn collect_visible(element: ElementRef<'_>, out: &mut String) {
    for node in element.children() {
        if let Some(child) = ElementRef::wrap(node) {
            let tag = child.value().name();
            if SKIPPED_TAGS.contains(&tag) {
                continue;
            }
            let block = BLOCK_TAGS.contains(&tag);
            if block && !out.ends_with('\n') {
                out.push('\n');
            }
            collect_visible(child, out);
            if block {
                out.push('\n');
            }
        } else if let Some(text) = node.value().as_text() {
            out.push_str(text);
        }
    }
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, sorted by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<t>` element; a newline closes each
/// `<p>` so paragraphs survive for the chunker.
fn text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    text_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let text = text_runs(&read_entry(&mut archive, &name)?)?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            sheets.push(cells);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one sheet, tab-separated within a row.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, ExtractError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut shared_ref = false;
    let mut count = 0usize;
    while count < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => rows.push(Vec::new()),
                b"c" => {
                    shared_ref = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    })
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_v => {
                let raw = te.unescape().unwrap_or_default();
                let raw = raw.trim();
                let value = if shared_ref {
                    raw.parse::<usize>().ok().and_then(|i| shared.get(i).cloned())
                } else if raw.is_empty() {
                    None
                } else {
                    Some(raw.to_string())
                };
                if let (Some(v), Some(row)) = (value, rows.last_mut()) {
                    row.push(v);
                    count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => shared_ref = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows
        .into_iter()
        .filter(|r| !r.is_empty())
        .map(|r| r.join("\t"))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(DocumentKind::from_path(Path::new("a/b.HTML")), DocumentKind::Html);
        assert_eq!(DocumentKind::from_path(Path::new("x.pdf")), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_path(Path::new("notes.md")), DocumentKind::Text);
        assert_eq!(DocumentKind::from_path(Path::new("README")), DocumentKind::Text);
    }

    #[test]
    fn kind_from_content_type() {
        assert_eq!(
            DocumentKind::from_content_type("text/html; charset=utf-8"),
            DocumentKind::Html
        );
        assert_eq!(DocumentKind::from_content_type("text/plain"), DocumentKind::Text);
    }

    #[test]
    fn plain_text_passes_through() {
        let out = extract("Paris is the capital of France.".as_bytes(), DocumentKind::Text).unwrap();
        assert_eq!(out.text, "Paris is the capital of France.");
    }

    #[test]
    fn binary_as_text_is_rejected() {
        let err = extract(&[0xff, 0xfe, 0x00, 0x80], DocumentKind::Text).unwrap_err();
        assert!(matches!(err, ExtractError::NotText));
    }

    #[test]
    fn html_drops_scripts_and_keeps_title() {
        let html = r#"<html><head><title> Capitals </title><style>p{}</style></head>
            <body><script>var x = 1;</script><h1>France</h1><p>Paris is   the capital.</p></body></html>"#;
        let out = html_to_text(html);
        assert_eq!(out.title.as_deref(), Some("Capitals"));
        assert_eq!(out.text, "France\nParis is the capital.");
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract(b"not a pdf", DocumentKind::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract(b"not a zip", DocumentKind::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let doc = r#"<?xml version="1.0"?><w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space="preserve"> line</w:t></w:r></w:p>
            <w:p><w:r><w:t>Second</w:t></w:r></w:p></w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", doc)]);
        let out = extract(&bytes, DocumentKind::Docx).unwrap();
        assert_eq!(out.text, "First line\nSecond");
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let shared = r#"<sst><si><t>city</t></si><si><t>Paris</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>1</v></c></row>
            <row><c t="s"><v>1</v></c><c><v>2148000</v></c></row>
            </sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let out = extract(&bytes, DocumentKind::Xlsx).unwrap();
        assert_eq!(out.text, "city\t1\nParis\t2148000");
    }
}
