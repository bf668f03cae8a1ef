//! Incremental decoder for the server's event-stream framing.

use std::collections::VecDeque;

use aip_primitives::StreamEvent;

use crate::error::{ClientError, ClientResult};

const FRAME_SEPARATOR: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data: ";

/// Decodes `data: <json>\n\n` frames from an arbitrary byte chunking and
/// enforces the per-stream ordering rules.
///
/// Sequence numbers must be contiguous from zero and exactly one final event
/// must close the stream; any deviation is a protocol violation surfaced as
/// an error, never skipped over.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    next_sequence: u64,
    finished: bool,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the final event has been decoded.
    pub(crate) const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds raw bytes, returning every event completed by them.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> ClientResult<VecDeque<StreamEvent>> {
        if self.finished {
            return Err(ClientError::protocol("data received after the final event"));
        }
        self.buffer.extend_from_slice(bytes);

        let mut events = VecDeque::new();
        while let Some(end) = find_separator(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + FRAME_SEPARATOR.len()).collect();
            let frame = &frame[..end];
            if frame.is_empty() {
                continue;
            }
            let event = decode_frame(frame)?;
            self.check_order(&event)?;
            events.push_back(event);
        }
        Ok(events)
    }

    /// Signals end of body; errors when the stream never produced its final
    /// event.
    pub(crate) fn finish(&self) -> ClientResult<()> {
        if self.finished {
            Ok(())
        } else {
            Err(ClientError::protocol("stream ended without a final event"))
        }
    }

    fn check_order(&mut self, event: &StreamEvent) -> ClientResult<()> {
        if event.sequence() != self.next_sequence {
            return Err(ClientError::protocol(format!(
                "sequence gap: expected {}, received {}",
                self.next_sequence,
                event.sequence()
            )));
        }
        self.next_sequence += 1;
        if event.is_final() {
            self.finished = true;
        }
        Ok(())
    }
}

fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(FRAME_SEPARATOR.len())
        .position(|window| window == FRAME_SEPARATOR)
}

fn decode_frame(frame: &[u8]) -> ClientResult<StreamEvent> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| ClientError::protocol("event frame is not valid UTF-8"))?;
    let json = text
        .strip_prefix(DATA_PREFIX)
        .ok_or_else(|| ClientError::protocol(format!("unexpected frame `{text}`")))?;
    serde_json::from_str(json)
        .map_err(|err| ClientError::protocol(format!("undecodable event: {err}")))
}
