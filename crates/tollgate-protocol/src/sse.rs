//! Incremental server-sent-events parser for upstream response streams.
//!
//! Feed raw chunks as they arrive; complete events come back as soon as the
//! blank-line terminator for each one has been seen. Unknown field names and
//! comment lines are ignored per the SSE grammar.

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.consume_line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        out
    }

    /// Flush whatever is buffered at end of stream; a final event without a
    /// trailing blank line is still emitted.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        self.close_event(&mut out);
        out
    }

    fn consume_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.close_event(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event_name = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn close_event(&mut self, out: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.event_name.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// Encode one event back into wire framing.
pub fn encode_event(event: &SseEvent) -> Bytes {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"a\":").is_empty());
        let events = parser.push_str("1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn named_events_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push_str(
            ": keep-alive\nevent: message_start\ndata: {}\n\ndata: one\ndata: two\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "one\ntwo");
    }

    #[test]
    fn crlf_lines() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_round_trip() {
        let event = SseEvent {
            event: Some("delta".into()),
            data: "{\"x\":1}".into(),
        };
        let wire = encode_event(&event);
        let mut parser = SseParser::new();
        let parsed = parser.push_bytes(&wire);
        assert_eq!(parsed, vec![event]);
    }
}
