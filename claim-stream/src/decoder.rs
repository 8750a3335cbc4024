//! Newline-delimited JSON decoding for the claim progress stream.
//!
//! [`LineDecoder`] owns the text buffer for one response body. Bytes go in
//! through [`LineDecoder::push`] in whatever fragments the network delivers
//! them; every line completed by that push comes back as a record. The
//! unterminated tail stays buffered until more bytes arrive or
//! [`LineDecoder::finish`] flushes it at end of stream.
//!
//! A line that is not valid JSON is logged and skipped. It never ends the
//! stream.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt, stream};
use tracing::{debug, warn};

use crate::{
    error::{Result, StreamError},
    record::StreamRecord,
    text::Utf8Decoder,
};

/// Line framing state for a single stream
#[derive(Debug, Default)]
pub struct LineDecoder {
    text: Utf8Decoder,
    buffer: String,
    skipped: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the records completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        let text = self.text.decode(chunk);
        self.buffer.push_str(&text);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);

        complete
            .split('\n')
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    /// Flush the final, possibly unterminated line.
    ///
    /// The buffer is drained, so a second call yields nothing.
    pub fn finish(&mut self) -> Vec<StreamRecord> {
        let rest = self.text.finish();
        self.buffer.push_str(&rest);
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    /// Number of malformed lines skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// True when no partial line is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && !self.text.has_pending()
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamRecord> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<StreamRecord>(line) {
            Ok(record) => {
                debug!(stage = %record.stage, fields = record.payload.len(), "Decoded stream record");
                Some(record)
            }
            Err(e) => {
                self.skipped += 1;
                warn!(line_length = line.len(), error = %e, "Skipping malformed stream line");
                None
            }
        }
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: LineDecoder,
    ready: VecDeque<StreamRecord>,
    done: bool,
}

/// Turn a chunked response body into a lazy stream of records.
///
/// Records decoded from one chunk are all yielded before the next chunk is
/// polled. A body read error is yielded once as `Err` and ends the stream.
pub fn decode_records<S, B, E>(body: S) -> impl Stream<Item = Result<StreamRecord>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: LineDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(record) = state.ready.pop_front() {
                return Some((Ok(record), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let records = state.decoder.push(chunk.as_ref());
                    state.ready.extend(records);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(StreamError::Body(e.into())), state));
                }
                None => {
                    let records = state.decoder.finish();
                    state.ready.extend(records);
                    state.done = true;
                    if state.decoder.skipped() > 0 {
                        debug!(skipped = state.decoder.skipped(), "Stream ended with skipped lines");
                    }
                }
            }
        }
    })
}
