//! Incremental Server-Sent Events parser for streaming provider bodies.
//!
//! Providers frame chunks as `data:` lines separated by blank lines and
//! terminate with a `data: [DONE]` sentinel. HTTP bodies arrive in
//! arbitrary byte chunks, so the parser keeps line state across pushes
//! and emits events only when their boundary has been seen.

/// One parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, when present.
    pub event_type: Option<String>,
    /// Joined `data:` payload lines.
    pub data: String,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
struct EventAssembler {
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl EventAssembler {
    fn has_data(&self) -> bool {
        !self.data_lines.is_empty()
    }

    fn take(&mut self) -> SseEvent {
        SseEvent {
            event_type: self.event_type.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        }
    }

    /// Feed one line; a blank line is the event boundary.
    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.has_data().then(|| self.take());
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => return None,
        };
        match field {
            "data" => self.data_lines.push(value.to_owned()),
            "event" => self.event_type = Some(value.to_owned()),
            // `id`, `retry`, and unknown fields are not used by any
            // provider we speak to.
            _ => {}
        }
        None
    }
}

/// Stateful byte-chunk parser.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: String,
    assembler: EventAssembler,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of body bytes, collecting any completed events.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for ch in String::from_utf8_lossy(chunk).chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.line_buf);
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if let Some(event) = self.assembler.line(line) {
                    events.push(event);
                }
            } else {
                self.line_buf.push(ch);
            }
        }
        events
    }

    /// Flush a trailing event at end of body (no final blank line).
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.assembler.line(line);
        }
        self.assembler.has_data().then(|| self.assembler.take())
    }
}
