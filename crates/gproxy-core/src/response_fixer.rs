//! Streaming-safe SSE/JSON repair (spec §4.8, component H).
//!
//! Sits ahead of the format translator: buffers until a line terminator,
//! normalizes encoding and SSE field casing, and repairs truncated trailing
//! JSON. Degrades to pass-through once the internal buffer would exceed
//! `max_fix_size`, since a repair attempt on an unbounded buffer is worse
//! than forwarding the bytes unmodified.

use bytes::{Bytes, BytesMut};

/// Once the buffered-but-unterminated tail exceeds this many bytes the fixer
/// stops trying to repair and flushes raw bytes through untouched.
const DEFAULT_MAX_FIX_SIZE: usize = 256 * 1024;

pub struct ResponseFixer {
    buffer: BytesMut,
    max_fix_size: usize,
    passthrough: bool,
}

impl ResponseFixer {
    pub fn new() -> Self {
        Self::with_max_fix_size(DEFAULT_MAX_FIX_SIZE)
    }

    pub fn with_max_fix_size(max_fix_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_fix_size,
            passthrough: false,
        }
    }

    /// Feeds one upstream chunk, returning zero or more repaired lines ready
    /// to forward. Call `flush` at stream end for any remaining partial line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        if self.passthrough {
            return vec![Bytes::copy_from_slice(chunk)];
        }

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_fix_size {
            // Too much unterminated data buffered: give up repairing and
            // flush what we have raw, then pass everything through from now on.
            self.passthrough = true;
            let drained = self.buffer.split().freeze();
            return vec![drained];
        }

        let mut out = Vec::new();
        loop {
            let Some(pos) = find_line_terminator(&self.buffer) else {
                break;
            };
            let line = self.buffer.split_to(pos + 1);
            out.push(repair_line(&line));
        }
        out
    }

    /// Call once the upstream has closed; repairs and returns any trailing
    /// partial line (e.g. a truncated final JSON object).
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split().freeze();
        if self.passthrough {
            return Some(rest);
        }
        Some(repair_line(&rest))
    }
}

impl Default for ResponseFixer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_line_terminator(buf: &BytesMut) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Normalizes a single SSE line or raw chunk: strips invalid UTF-8 sequences,
/// lower-cases a malformed `Event:`/`DATA:` field prefix, and repairs a
/// trailing-truncated JSON `data:` payload by closing unterminated braces.
fn repair_line(line: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(line);
    let normalized = normalize_sse_field_casing(&text);

    if let Some(data) = normalized.strip_prefix("data: ").or_else(|| normalized.strip_prefix("data:")) {
        let trimmed = data.trim_end_matches(['\n', '\r']);
        if trimmed != "[DONE]" && looks_like_truncated_json(trimmed) {
            let repaired = repair_truncated_json(trimmed);
            return Bytes::from(format!("data: {repaired}\n"));
        }
    }
    Bytes::from(normalized.into_owned())
}

/// SSE field names are case-sensitive per the spec (`event:`, `data:`, `id:`,
/// `retry:`); some upstreams emit them capitalized. Lower-case only the
/// leading field token, leaving the payload untouched.
fn normalize_sse_field_casing(line: &str) -> std::borrow::Cow<'_, str> {
    for field in ["event", "data", "id", "retry"] {
        let cased = capitalize_first(field);
        if let Some(rest) = line.strip_prefix(&cased) {
            if rest.starts_with(':') {
                return std::borrow::Cow::Owned(format!("{field}{rest}"));
            }
        }
    }
    std::borrow::Cow::Borrowed(line)
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn looks_like_truncated_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') || trimmed.starts_with('[')) && serde_json::from_str::<serde_json::Value>(trimmed).is_err()
}

/// Best-effort repair: closes unbalanced braces/brackets and strips a
/// trailing dangling comma or incomplete string/key.
fn repair_truncated_json(text: &str) -> String {
    let mut out = text.trim_end().to_string();
    // Drop a trailing incomplete token after the last comma/colon if the
    // buffer cuts off mid key or mid value.
    if out.ends_with(',') || out.ends_with(':') {
        out.pop();
    }
    let mut in_string = false;
    let mut escape = false;
    let mut stack = Vec::new();
    for c in out.chars() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Anthropic streams must terminate with a `message_stop` event or the
/// literal `[DONE]` marker (OpenAI-family); anything else is a truncated
/// stream (spec §4.8, "Anthropic terminal-chunk check").
pub fn is_terminal_chunk(accumulated_tail: &str) -> bool {
    accumulated_tail.contains("message_stop") || accumulated_tail.contains("[DONE]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_complete_lines_through_unchanged() {
        let mut fixer = ResponseFixer::new();
        let out = fixer.push(b"data: {\"a\":1}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], b"data: {\"a\":1}\n");
    }

    #[test]
    fn buffers_partial_line_until_terminator() {
        let mut fixer = ResponseFixer::new();
        assert!(fixer.push(b"data: {\"a\":").is_empty());
        let out = fixer.push(b"1}\n");
        assert_eq!(&out[0][..], b"data: {\"a\":1}\n");
    }

    #[test]
    fn repairs_truncated_trailing_json_on_flush() {
        let mut fixer = ResponseFixer::new();
        fixer.push(b"data: {\"a\":1,\"b\":{\"c\":2");
        let flushed = fixer.flush().unwrap();
        let text = String::from_utf8(flushed.to_vec()).unwrap();
        let data = text.strip_prefix("data: ").unwrap().trim();
        let parsed: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"]["c"], 2);
    }

    #[test]
    fn degrades_to_passthrough_past_max_fix_size() {
        let mut fixer = ResponseFixer::with_max_fix_size(16);
        let out = fixer.push(b"this line is definitely longer than sixteen bytes and has no newline");
        assert_eq!(out.len(), 1);
        let out2 = fixer.push(b"more raw bytes\n");
        assert_eq!(&out2[0][..], b"more raw bytes\n");
    }

    #[test]
    fn normalizes_capitalized_sse_field() {
        let mut fixer = ResponseFixer::new();
        let out = fixer.push(b"Event: message_stop\n");
        assert_eq!(&out[0][..], b"event: message_stop\n");
    }

    #[test]
    fn detects_terminal_chunk() {
        assert!(is_terminal_chunk("...message_stop..."));
        assert!(is_terminal_chunk("data: [DONE]"));
        assert!(!is_terminal_chunk("data: {\"partial\":true}"));
    }
}
