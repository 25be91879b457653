use serde_json::json;

/// Payload of the record that ends a stream
pub const DONE_SENTINEL: &str = "[DONE]";
const DATA_PREFIX: &str = "data:";

/// One complete event-stream record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Data(String),
    Terminator,
}

impl ProtocolEvent {
    /// Synthetic `{"error": ...}` record
    pub fn error(message: impl std::fmt::Display) -> Self {
        ProtocolEvent::Data(json!({ "error": message.to_string() }).to_string())
    }

    /// Serialize as a re-framed record: `data: <payload>\n\n`
    pub fn to_wire(&self) -> String {
        match self {
            ProtocolEvent::Data(payload) => format!("data: {}\n\n", payload),
            ProtocolEvent::Terminator => format!("data: {}\n\n", DONE_SENTINEL),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        // `\n` never occurs inside a multi-byte UTF-8 sequence, so everything
        // up to it is safe to decode.
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Flush a trailing record that never got its newline.
    pub fn close(&mut self) -> Vec<ProtocolEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(raw: &[u8]) -> Option<ProtocolEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let payload = line.strip_prefix(DATA_PREFIX)?.trim_start();
    if payload == DONE_SENTINEL {
        Some(ProtocolEvent::Terminator)
    } else {
        Some(ProtocolEvent::Data(payload.to_string()))
    }
}
