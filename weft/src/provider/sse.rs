//! Incremental server-sent-events framing.
//!
//! Providers hand us an HTTP byte stream; this parser accumulates bytes,
//! splits on line boundaries, and yields `(event, data)` pairs at each blank
//! line. `data:` lines within one event are joined with newlines per the SSE
//! spec, though no provider we speak to actually multi-lines them.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
}

/// Push-based SSE parser; feed byte chunks, drain complete events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk; returns every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(event) = self.flush_event() {
                    events.push(event);
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.current_event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.current_data.push(value.trim_start().to_string());
            }
            // Comments (`:`) and unknown fields are ignored.
        }

        events
    }

    /// Flushes any event still buffered at stream end.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.flush_event()
    }

    fn flush_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() && self.current_event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
        };
        self.current_data.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_pairs() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn handles_chunks_split_mid_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"par").is_empty());
        assert!(parser.feed(b"tial\":true}").is_empty());
        let events = parser.feed(b"\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
    }

    #[test]
    fn data_only_events_and_done_marker() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: one\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail\n").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
    }
}
