//! Text utilities shared by the crawler and the retriever.
//!
//! - Storage-format rendering: turn wiki editor markup into plain text,
//!   replacing user references with `@DisplayName`.
//! - Reference scanning: user ids and attachment file names mentioned by a
//!   page body.
//! - Query normalization: [`simplify_text`] for expansion dedup and
//!   [`remove_stop_words_and_punctuation`] for keyword extraction.
//!
//! Storage markup is XHTML with namespaced macro elements (`ac:*`, `ri:*`).
//! It is read with a lenient `quick-xml` reader: mismatched end tags are
//! tolerated and a hard parse error ends the scan, keeping whatever text was
//! produced up to that point.

use std::collections::HashMap;

use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

/// Display name used when a referenced user cannot be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";

/// Elements that start and end a line of output.
const BLOCK_TAGS: &[&[u8]] = &[
    b"p",
    b"div",
    b"h1",
    b"h2",
    b"h3",
    b"h4",
    b"h5",
    b"h6",
    b"li",
    b"ul",
    b"ol",
    b"tr",
    b"table",
    b"pre",
    b"blockquote",
    b"section",
    b"hr",
    b"ac:structured-macro",
    b"ac:task",
];

/// Elements whose content never reaches the output.
const SKIPPED_TAGS: &[&[u8]] = &[b"script", b"style", b"ac:parameter", b"ac:placeholder"];

const CELL_TAGS: &[&[u8]] = &[b"td", b"th"];

fn storage_reader(html: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(html);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    reader
}

fn attr(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .map(|a| decode_entities(&String::from_utf8_lossy(&a.value)))
}

/// Account id (cloud) or user key (self-hosted) of an `<ri:user>` element.
fn user_ref(element: &BytesStart<'_>) -> Option<String> {
    attr(element, b"ri:account-id")
        .or_else(|| attr(element, b"ri:userkey"))
        .filter(|id| !id.is_empty())
}

/// Collect the distinct user ids referenced by `<ri:user>` elements, in
/// document order.
pub fn mentioned_user_ids(html: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut reader = storage_reader(html);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"ri:user" => {
                match user_ref(&e) {
                    Some(id) => {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                    None => warn!(
                        element = %String::from_utf8_lossy(&e),
                        "ri:userkey not found in ri:user element"
                    ),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(error = %e, "stopping user scan at malformed markup");
                break;
            }
            _ => {}
        }
    }
    ids
}

/// File names of every attachment referenced from the body.
pub fn used_attachments(html: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut reader = storage_reader(html);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.name().as_ref() == b"ri:attachment" =>
            {
                if let Some(name) = attr(&e, b"ri:filename") {
                    files.push(name);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(error = %e, "stopping attachment scan at malformed markup");
                break;
            }
            _ => {}
        }
    }
    files
}

/// Render a storage-format (or view-format) body as plain text.
///
/// `names` maps user ids to display names; a referenced id missing from the
/// map renders as `@Unknown User`.
pub fn render_page_text(html: &str, names: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let mut skip_depth = 0usize;
    let mut pre_depth = 0usize;
    let mut reader = storage_reader(html);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                let tag = name.as_ref();
                if SKIPPED_TAGS.contains(&tag) {
                    skip_depth += 1;
                } else if skip_depth > 0 {
                    continue;
                } else if tag == b"ri:user" {
                    push_mention(&mut out, &e, names);
                } else if tag == b"br" {
                    out.push('\n');
                } else if BLOCK_TAGS.contains(&tag) {
                    if tag == b"pre" {
                        pre_depth += 1;
                    }
                    break_line(&mut out);
                }
            }
            Ok(Event::Empty(e)) => {
                if skip_depth > 0 {
                    continue;
                }
                let name = e.name();
                let tag = name.as_ref();
                if tag == b"ri:user" {
                    push_mention(&mut out, &e, names);
                } else if tag == b"br" {
                    out.push('\n');
                } else if BLOCK_TAGS.contains(&tag) {
                    break_line(&mut out);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let tag = name.as_ref();
                if SKIPPED_TAGS.contains(&tag) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if skip_depth > 0 {
                    continue;
                } else if CELL_TAGS.contains(&tag) {
                    out.push('\t');
                } else if BLOCK_TAGS.contains(&tag) {
                    if tag == b"pre" {
                        pre_depth = pre_depth.saturating_sub(1);
                    }
                    break_line(&mut out);
                }
            }
            Ok(Event::Text(t)) => {
                if skip_depth == 0 {
                    let decoded = decode_entities(&String::from_utf8_lossy(&t));
                    push_text(&mut out, &decoded, pre_depth > 0);
                }
            }
            Ok(Event::CData(c)) => {
                if skip_depth == 0 {
                    out.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(error = %e, "stopping render at malformed markup");
                break;
            }
            _ => {}
        }
    }

    tidy_lines(&out)
}

fn push_mention(out: &mut String, element: &BytesStart<'_>, names: &HashMap<String, String>) {
    let Some(id) = user_ref(element) else {
        return;
    };
    let name = names.get(&id).map(String::as_str).unwrap_or(UNKNOWN_USER);
    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
        out.push(' ');
    }
    out.push('@');
    out.push_str(name);
}

fn break_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn push_text(out: &mut String, text: &str, preformatted: bool) {
    if preformatted {
        out.push_str(text);
        return;
    }
    let mut words = text.split_whitespace().peekable();
    if words.peek().is_none() {
        if !text.is_empty() && !out.is_empty() && !out.ends_with(char::is_whitespace) {
            out.push(' ');
        }
        return;
    }
    if text.starts_with(char::is_whitespace) && !out.is_empty() && !out.ends_with(char::is_whitespace)
    {
        out.push(' ');
    }
    let joined = words.collect::<Vec<_>>().join(" ");
    out.push_str(&joined);
    if text.ends_with(char::is_whitespace) {
        out.push(' ');
    }
}

/// Trim trailing whitespace per line and collapse runs of blank lines.
fn tidy_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Decode XML character references and the HTML5 named entity set.
///
/// Text holding an unrecognized or malformed reference is kept verbatim.
pub fn decode_entities(raw: &str) -> String {
    match unescape_with(raw, resolve_html5_entity) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            debug!(error = %e, "keeping text with an unresolved entity as is");
            raw.to_string()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Query normalization
// ═══════════════════════════════════════════════════════════════════════

/// Lowercase and drop ASCII punctuation and all whitespace.
///
/// Two rephrasings that differ only in case, spacing or punctuation simplify
/// to the same string.
pub fn simplify_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation() && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves",
];

fn is_stop_word(word: &str) -> bool {
    let folded = word.to_lowercase();
    STOP_WORDS.contains(&folded.as_str())
}

fn is_punctuation(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_ascii_punctuation())
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|raw| {
            let trimmed = raw.trim_matches(|c: char| c.is_ascii_punctuation());
            if trimmed.is_empty() {
                raw.to_string()
            } else {
                trimmed.to_string()
            }
        })
        .collect()
}

/// Drop English stop words and bare punctuation from keywords.
///
/// Falls back to the unfiltered tokens when nothing would be left, so a
/// query made only of stop words still has keywords.
pub fn remove_stop_words_and_punctuation(keywords: &[String]) -> Vec<String> {
    let tokens: Vec<String> = keywords.iter().flat_map(|k| tokenize(k)).collect();
    let kept: Vec<String> = tokens
        .iter()
        .filter(|w| !is_stop_word(w) && !is_punctuation(w))
        .cloned()
        .collect();
    if kept.is_empty() {
        tokens
    } else {
        kept
    }
}

/// Keywords for a raw query string.
pub fn query_keywords(query: &str) -> Vec<String> {
    remove_stop_words_and_punctuation(&[query.to_string()])
}
