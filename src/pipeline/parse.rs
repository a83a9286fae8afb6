//! Response parsing: pull the first JSON object out of free-form model text.
//!
//! Vision models are asked for "a single JSON object and nothing else" but
//! routinely wrap it in prose or ```json fences. Rather than trusting the
//! reply, [`find_first_json_object`] scans for the first balanced top-level
//! `{ … }` and [`parse_extraction`] decodes it.
//!
//! The scan tracks string literals and escapes, so braces inside string
//! values (`"sheetTitle": "Detail {A}"`) never close the object early.
//!
//! Parsing never fails: a reply with no JSON, or JSON that does not decode,
//! becomes an [`ExtractedDocumentData`] with only `error` set.

use crate::output::ExtractedDocumentData;
use tracing::debug;

/// Longest raw-response excerpt kept on a page that failed to parse.
const MAX_EXCERPT_CHARS: usize = 500;

/// Return the first balanced top-level JSON object in `text`, if any.
pub fn find_first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..start + i + 1]);
                    }
                }
                _ => {}
            }
        }

        // Unbalanced from this brace; a later one may still open a full object.
        search_from = start + 1;
    }

    None
}

/// Decode a model reply into page data.
pub fn parse_extraction(response: &str) -> ExtractedDocumentData {
    let Some(json) = find_first_json_object(response) else {
        debug!("No JSON object in model response ({} chars)", response.len());
        return ExtractedDocumentData {
            raw_text: excerpt(response),
            ..ExtractedDocumentData::from_error("No structured data found in the analysis response")
        };
    };

    match serde_json::from_str::<ExtractedDocumentData>(json) {
        Ok(data) => data,
        Err(e) => {
            debug!("Model JSON did not decode: {}", e);
            ExtractedDocumentData {
                raw_text: excerpt(response),
                ..ExtractedDocumentData::from_error(format!(
                    "Could not parse the analysis response: {e}"
                ))
            }
        }
    }
}

fn excerpt(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_EXCERPT_CHARS).collect())
}
