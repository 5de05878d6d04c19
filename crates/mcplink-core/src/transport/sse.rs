//! SSE (Server-Sent Events) frame decoding
//!
//! Incremental: chunks may split lines, fields or multi-byte characters at any
//! point. Bytes are held until a full line is available, so UTF-8 sequences
//! are never cut.

use std::time::Instant;
use tracing::{debug, trace};

/// One dispatched SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field; None means the default `message` type
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseFrame {
    /// Whether this frame carries a JSON-RPC message
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Stateful decoder fed with raw chunks from the wire
#[derive(Debug)]
pub struct SseDecoder {
    /// Bytes of a line not yet terminated
    partial: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    /// Most recent `id:` seen, used to resume with `Last-Event-ID`
    last_event_id: Option<String>,
    stream_start: Instant,
    frame_count: usize,
    bytes_received: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            partial: Vec::new(),
            event: None,
            data: Vec::new(),
            id: None,
            retry: None,
            last_event_id: None,
            stream_start: Instant::now(),
            frame_count: 0,
            bytes_received: 0,
        }
    }

    /// Feed a chunk and collect every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.bytes_received += chunk.len();
        trace!(
            "SSE chunk received: {} bytes (total: {} bytes)",
            chunk.len(),
            self.bytes_received
        );
        self.partial.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.partial[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.partial.drain(..start);
        frames
    }

    /// Flush at end of stream: a final unterminated line and any pending event
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comments keep the connection alive and are never surfaced
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            other => debug!("Ignoring unknown SSE field '{}'", other),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        self.frame_count += 1;
        debug!(
            "SSE frame #{} at {:?}: event={}, {} bytes",
            self.frame_count,
            self.stream_start.elapsed(),
            event.as_deref().unwrap_or("message"),
            data.len()
        );
        Some(SseFrame {
            event,
            data,
            id,
            retry,
        })
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a complete SSE body in one go
pub fn decode_frames(body: &str) -> Vec<SseFrame> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.feed(body.as_bytes());
    frames.extend(decoder.finish());
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let frames = decode_frames("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[0].is_message());
    }

    #[test]
    fn test_split_across_chunks_matches_whole() {
        let body = "id: 7\ndata: {\"jsonrpc\":\"2.0\",\n: keepalive\ndata: \"method\":\"x\"}\n\ndata: second\n\n";
        let whole = decode_frames(body);

        let mut decoder = SseDecoder::new();
        let mut split = Vec::new();
        for byte in body.as_bytes().chunks(3) {
            split.extend(decoder.feed(byte));
        }
        split.extend(decoder.finish());

        assert_eq!(whole, split);
        assert_eq!(whole.len(), 2);
        assert_eq!(whole[0].data, "{\"jsonrpc\":\"2.0\",\n\"method\":\"x\"}");
        assert_eq!(whole[0].id.as_deref(), Some("7"));
        assert_eq!(decoder.last_event_id(), Some("7"));
    }

    #[test]
    fn test_multibyte_characters_split_mid_sequence() {
        let body = "data: héllo ✓\n\n".as_bytes();
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for byte in body.chunks(1) {
            frames.extend(decoder.feed(byte));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo ✓");
    }

    #[test]
    fn test_comments_never_surface() {
        let frames = decode_frames(": ping\n\n: ping\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_crlf_and_fields() {
        let frames = decode_frames("event: endpoint\r\nretry: 1500\r\ndata:/messages\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("endpoint"));
        assert_eq!(frames[0].retry, Some(1500));
        assert_eq!(frames[0].data, "/messages");
        assert!(!frames[0].is_message());
    }

    #[test]
    fn test_unterminated_final_event_flushed() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.data, "tail");
        assert!(decoder.finish().is_none());
    }
}
