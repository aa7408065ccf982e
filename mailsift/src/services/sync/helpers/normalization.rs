use mailparse::{MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::MailsiftError;

static SUBJECT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:(?:re|fwd|fw)\s*:\s*)+").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static WROTE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*On .* wrote:\s*$").expect("valid regex"));
static FORWARD_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:From|Sent|To|Subject):").expect("valid regex"));
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("valid regex"));
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w.\-+]+@[\w.\-]+\.\w+").expect("valid regex"));
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(?:URL|EMAIL)\]").expect("valid regex"));

/// Plain text shorter than this loses to the HTML alternative
const MIN_PLAIN_CHARS: usize = 50;
const HTML_WIDTH: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub subject: String,
    pub sender: String,
    /// Unix seconds, 0 when the Date header is missing or unparseable
    pub timestamp: i64,
    pub body: String,
    /// Text handed to the embedder
    pub embedding_text: String,
    pub content_hash: String,
}

pub fn normalize(raw: &[u8], max_chars: usize) -> Result<NormalizedMessage, MailsiftError> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| MailsiftError::Parse(format!("Failed to parse message: {}", e)))?;

    let subject = clean_subject(&parsed.headers.get_first_value("Subject").unwrap_or_default());
    let sender = parsed
        .headers
        .get_first_value("From")
        .map(|s| collapse_whitespace(&s))
        .unwrap_or_default();
    let timestamp = parsed
        .headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .unwrap_or(0);

    let body = truncate_chars(&clean_body(&extract_body(&parsed)), max_chars);
    let embedding_text = embedding_text(&subject, &body);
    let content_hash = content_hash(&embedding_text);

    Ok(NormalizedMessage {
        subject,
        sender,
        timestamp,
        body,
        embedding_text,
        content_hash,
    })
}

pub fn clean_subject(subject: &str) -> String {
    let collapsed = collapse_whitespace(subject);
    SUBJECT_PREFIX.replace(&collapsed, "").trim().to_string()
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn collect_parts(part: &ParsedMail, mimetype: &str, out: &mut Vec<String>) {
    if part.subparts.is_empty() {
        let is_attachment = part
            .headers
            .get_first_value("Content-Disposition")
            .map(|d| d.to_lowercase().starts_with("attachment"))
            .unwrap_or(false);
        if part.ctype.mimetype == mimetype && !is_attachment {
            if let Ok(body) = part.get_body() {
                out.push(body);
            }
        }
        return;
    }
    for sub in &part.subparts {
        collect_parts(sub, mimetype, out);
    }
}

/// Prefer substantial plain text, else rendered HTML, else whatever plain
/// text there is.
fn extract_body(parsed: &ParsedMail) -> String {
    let mut plain = Vec::new();
    collect_parts(parsed, "text/plain", &mut plain);
    let plain = plain.join("\n");

    let plain_chars = plain.chars().filter(|c| !c.is_whitespace()).count();
    if plain_chars > MIN_PLAIN_CHARS {
        return plain;
    }

    let mut html = Vec::new();
    collect_parts(parsed, "text/html", &mut html);
    if html.is_empty() {
        return plain;
    }

    html.iter()
        .map(|h| html2text::from_read(h.as_bytes(), HTML_WIDTH).unwrap_or_else(|_| h.clone()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn clean_body(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        // Everything after an attribution line or a signature separator is
        // quoted history or boilerplate
        if WROTE_LINE.is_match(line) || line.trim_end() == "--" {
            break;
        }
        if line.trim_start().starts_with('>') || FORWARD_HEADER.is_match(line) {
            continue;
        }
        kept.push(line);
    }

    let text = kept.join("\n");
    let text = URL.replace_all(&text, "[URL]");
    let text = EMAIL.replace_all(&text, "[EMAIL]");
    collapse_whitespace(&text)
}

/// Truncate on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

pub fn embedding_text(subject: &str, body: &str) -> String {
    let combined = format!("{}\n{}", subject, body);
    let stripped = PLACEHOLDER.replace_all(&combined, "");
    stripped
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
