//! Attachment text extraction.
//!
//! The format is picked from the file extension, falling back to the media
//! type reported by the wiki:
//!
//! | Format | Handling |
//! |--------|----------|
//! | `.txt`, `.md`, `.csv`, `.json`, `.log` | UTF-8 (lossy) |
//! | `.html`, `.htm`, `.xml` | text nodes via the storage-format renderer |
//! | `.pdf` | `pdf-extract` |
//! | `.docx`, `.pptx`, `.xlsx` | `zip` + `quick-xml` |
//!
//! Anything else yields `Ok(None)`.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::text::render_page_text;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Cap on decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

fn ooxml<E: std::fmt::Display>(e: E) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    PlainText,
    Markup,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

fn detect_format(file_name: &str, media_type: &str) -> Option<Format> {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let by_ext = match ext.as_str() {
        "txt" | "md" | "markdown" | "csv" | "tsv" | "json" | "log" | "yaml" | "yml" => {
            Some(Format::PlainText)
        }
        "html" | "htm" | "xml" => Some(Format::Markup),
        "pdf" => Some(Format::Pdf),
        "docx" => Some(Format::Docx),
        "pptx" => Some(Format::Pptx),
        "xlsx" => Some(Format::Xlsx),
        _ => None,
    };
    by_ext.or(match media_type {
        MIME_PDF => Some(Format::Pdf),
        MIME_DOCX => Some(Format::Docx),
        MIME_PPTX => Some(Format::Pptx),
        MIME_XLSX => Some(Format::Xlsx),
        "text/html" | "application/xml" | "text/xml" => Some(Format::Markup),
        "application/json" => Some(Format::PlainText),
        t if t.starts_with("text/") => Some(Format::PlainText),
        _ => None,
    })
}

/// Plain text of an attachment, or `None` for unsupported formats.
pub fn extract_attachment_text(
    file_name: &str,
    media_type: &str,
    bytes: &[u8],
) -> Result<Option<String>, ExtractError> {
    let Some(format) = detect_format(file_name, media_type) else {
        tracing::debug!(file_name, media_type, "unsupported attachment type");
        return Ok(None);
    };
    let text = match format {
        Format::PlainText => String::from_utf8_lossy(bytes).into_owned(),
        Format::Markup => render_page_text(&String::from_utf8_lossy(bytes), &HashMap::new()),
        Format::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?,
        Format::Docx => extract_docx(bytes)?,
        Format::Pptx => extract_pptx(bytes)?,
        Format::Xlsx => extract_xlsx(bytes)?,
    };
    Ok(Some(text))
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name).map_err(ooxml)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

/// Entries named `{prefix}{n}.xml`, ordered by `n`.
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

/// Text of every `<*:t>` element. Runs are concatenated; each closing
/// `paragraph` element adds a newline.
fn text_runs(xml: &[u8], paragraph: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(&te.unescape().map_err(ooxml)?);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == paragraph && !out.is_empty() && !out.ends_with('\n')
                {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_entry(&mut archive, &name)?;
        let text = text_runs(&xml, b"p")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = match archive.index_for_name("xl/sharedStrings.xml") {
        Some(_) => shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?,
        None => Vec::new(),
    };
    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        let rows = sheet_rows(&xml, &shared)?;
        if !rows.is_empty() {
            sheets.push(rows);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
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
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => {
                strings.push(String::new());
            }
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values, tab-separated within a row and one row per line.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, ExtractError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cell_type: Option<Vec<u8>> = None;
    let mut in_value = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_type = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"t")
                        .map(|a| a.value.into_owned());
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(ooxml)?;
                let raw = raw.trim();
                let value = match cell_type.as_deref() {
                    Some(b"s") => raw
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned()),
                    _ => Some(raw.to_string()),
                };
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    row.push(value);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_type = None,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join("\t")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}
