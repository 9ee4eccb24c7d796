//! Page reader: time- and byte-bounded fetch of a URL's main text
//!
//! Failures are bucketed into short reason strings for warning aggregation;
//! raw provider errors never reach the user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

// Elements whose entire content is noise, plus comments. Compiled once.
static RE_NON_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)\s*>|<!--.*?-->")
        .expect("valid regex")
});

/// Longest entity body we bother decoding (`&#x10ffff;`)
const ENTITY_MAX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("timeout")]
    Timeout,
    #[error("connect")]
    Connect,
    #[error("http_4xx")]
    Http4xx,
    #[error("http_5xx")]
    Http5xx,
    #[error("oversize")]
    Oversize,
    #[error("bad_content_type")]
    BadContentType,
    #[error("decode")]
    Decode,
}

impl ReadError {
    /// Short reason string used for warning aggregation
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::Oversize => "oversize",
            Self::BadContentType => "bad_content_type",
            Self::Decode => "decode",
        }
    }
}

/// Extracted main text of a page
#[derive(Debug, Clone)]
pub struct PageText {
    pub extracted_text: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn read(&self, url: &str) -> Result<PageText, ReadError>;
}

/// Convert HTML to plain text: drop non-content elements, then walk the
/// markup once, turning block-level tags into line breaks and decoding
/// entities. Paragraph structure survives as single blank lines.
pub fn html_to_text(html: &str) -> String {
    let cleaned = RE_NON_CONTENT.replace_all(html, " ");
    let flat = strip_markup(&cleaned);

    // Collapse runs of whitespace per line and runs of blank lines between
    // paragraphs
    let mut out = String::with_capacity(flat.len());
    let mut blank_pending = false;
    for line in flat.lines() {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            blank_pending = !out.is_empty();
            continue;
        };
        if blank_pending {
            out.push('\n');
            blank_pending = false;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(first);
        for word in words {
            out.push(' ');
            out.push_str(word);
        }
    }
    out
}

/// One pass over the markup: tags out, entities decoded
fn strip_markup(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(at) = rest.find(['<', '&']) {
        out.push_str(&rest[..at]);
        rest = &rest[at..];

        if rest.starts_with('<') {
            let Some(end) = rest.find('>') else {
                // unterminated tag: the tail is markup, not text
                return out;
            };
            if is_block_tag(&rest[1..end]) {
                out.push('\n');
            }
            rest = &rest[end + 1..];
        } else {
            let entity = rest[1..]
                .find(';')
                .filter(|semi| *semi > 0 && *semi <= ENTITY_MAX_LEN)
                .map(|semi| &rest[1..1 + semi])
                .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric() || c == '#'));
            match entity {
                Some(entity) => {
                    match decode_entity(entity) {
                        Some(c) => out.push(c),
                        // not an entity we know: keep it verbatim
                        None => out.push_str(&rest[..entity.len() + 2]),
                    }
                    rest = &rest[entity.len() + 2..];
                }
                // a bare ampersand is just text
                None => {
                    out.push('&');
                    rest = &rest[1..];
                }
            }
        }
    }

    out.push_str(rest);
    out
}

/// Tags that terminate a line of text when stripped
fn is_block_tag(raw_tag: &str) -> bool {
    let name: String = raw_tag
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    matches!(
        name.as_str(),
        "p" | "div"
            | "br"
            | "hr"
            | "li"
            | "ul"
            | "ol"
            | "tr"
            | "table"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "blockquote"
            | "pre"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
    )
}

/// Decode the body of an `&...;` entity, named or numeric
fn decode_entity(entity: &str) -> Option<char> {
    if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
        return char::from_u32(u32::from_str_radix(hex, 16).ok()?);
    }
    if let Some(dec) = entity.strip_prefix('#') {
        return char::from_u32(dec.parse().ok()?);
    }
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => None,
    }
}

/// HTTP page reader with a wall-clock timeout and a body byte cap
pub struct HttpPageReader {
    http: reqwest::Client,
    fetch_timeout: Duration,
    max_bytes: usize,
}

impl HttpPageReader {
    pub fn new(fetch_timeout: Duration, max_bytes: usize) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; Sounder/1.0)")
            .build()
            .unwrap_or_default();
        Self {
            http,
            fetch_timeout,
            max_bytes,
        }
    }

    async fn fetch(&self, url: &str) -> Result<PageText, ReadError> {
        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ReadError::Timeout
            } else {
                ReadError::Connect
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(ReadError::Http4xx);
        }
        if status.is_server_error() {
            return Err(ReadError::Http5xx);
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.is_empty()
            && !content_type.contains("text")
            && !content_type.contains("json")
            && !content_type.contains("xml")
        {
            return Err(ReadError::BadContentType);
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(ReadError::Oversize);
            }
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    ReadError::Timeout
                } else {
                    ReadError::Decode
                }
            })?;
            if body.len() + chunk.len() > self.max_bytes {
                return Err(ReadError::Oversize);
            }
            body.extend_from_slice(&chunk);
        }

        let raw = String::from_utf8_lossy(&body).to_string();
        let extracted_text = if content_type.contains("html") || looks_like_html(&raw) {
            html_to_text(&raw)
        } else {
            raw.trim().to_string()
        };

        Ok(PageText {
            extracted_text,
            fetched_at: Utc::now(),
        })
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(512).collect();
    head.contains("<html") || head.contains("<!DOCTYPE") || head.contains("<!doctype")
}

#[async_trait]
impl PageFetcher for HttpPageReader {
    async fn read(&self, url: &str) -> Result<PageText, ReadError> {
        match tokio::time::timeout(self.fetch_timeout, self.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text() {
        let html = r#"
            <html>
            <head><script>alert('hi')</script></head>
            <body>
                <h1>Title</h1>
                <p>Hello <b>world</b>!</p>
                <div>Another &amp; line</div>
            </body>
            </html>
        "#;

        let text = html_to_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Hello world!"));
        assert!(text.contains("Another & line"));
        assert!(!text.contains("<script>"));
        assert!(!text.contains("alert"));
    }

    #[test]
    fn test_html_to_text_entities() {
        let html = "&lt;code&gt; &amp; &quot;test&quot;";
        let text = html_to_text(html);
        assert_eq!(text, "<code> & \"test\"");
    }

    #[test]
    fn test_html_to_text_numeric_entities() {
        assert_eq!(
            html_to_text("it&#39;s a &#x27;quote&#x27;"),
            "it's a 'quote'"
        );
        // bare ampersands and unknown entities stay verbatim
        assert_eq!(html_to_text("AT&T &bogus; &#zzz;"), "AT&T &bogus; &#zzz;");
    }

    #[test]
    fn test_html_to_text_strips_comments_and_noscript() {
        let html = "before<!-- hidden note -->after<noscript>enable js</noscript>";
        let text = html_to_text(html);
        assert!(text.contains("before"));
        assert!(text.contains("after"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("enable js"));
    }

    #[test]
    fn test_html_to_text_paragraph_breaks() {
        let text = html_to_text("<p>one   two</p>\n\n\n<p>three</p>");
        assert_eq!(text, "one two\n\nthree");
    }

    #[test]
    fn test_html_to_text_inline_tags_do_not_split_words() {
        assert_eq!(html_to_text("Hello <b>world</b>!"), "Hello world!");
    }

    #[test]
    fn test_reason_strings_stay_short() {
        for e in [
            ReadError::Timeout,
            ReadError::Connect,
            ReadError::Http4xx,
            ReadError::Http5xx,
            ReadError::Oversize,
            ReadError::BadContentType,
            ReadError::Decode,
        ] {
            assert!(!e.reason().contains(' '));
            assert!(e.reason().len() <= 16);
        }
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("<!DOCTYPE html><html>"));
        assert!(!looks_like_html("plain text body"));
    }
}
