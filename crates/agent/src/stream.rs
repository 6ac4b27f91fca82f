//! Assembling a streamed assistant reply from raw byte chunks.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::llm::TransportError;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Incremental UTF-8 decoder that never splits a character across two
/// emitted states. Bytes of an incomplete trailing sequence are held back
/// until the next chunk completes them.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    pending: Vec<u8>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one chunk. Returns the full text so far when it grew.
    pub fn push(&mut self, chunk: &[u8]) -> Option<&str> {
        let before = self.text.len();
        self.pending.extend_from_slice(chunk);
        self.drain_pending();

        (self.text.len() > before).then_some(self.text.as_str())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Ends the stream. A dangling partial sequence becomes U+FFFD.
    pub fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.text.push(REPLACEMENT);
        }
        self.text
    }

    fn drain_pending(&mut self) {
        let mut consumed = 0;

        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                        self.text.push_str(valid);
                    }
                    consumed += valid_up_to;

                    match error.error_len() {
                        Some(invalid_len) => {
                            self.text.push(REPLACEMENT);
                            consumed += invalid_len;
                        }
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..consumed);
    }
}

/// A stream that failed before completing. The partial text is never used
/// for extraction but may still be shown as what the assistant produced.
#[derive(Debug)]
pub struct StreamInterrupted {
    pub error: TransportError,
    pub partial_text: String,
}

/// Drains `chunks` to completion, reporting every growth of the text to
/// `on_partial`. End of stream, abrupt or not, counts as completion.
pub async fn accumulate<S, F>(
    mut chunks: S,
    cancel: &CancellationToken,
    mut on_partial: F,
) -> Result<String, StreamInterrupted>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
    F: FnMut(&str),
{
    let mut accumulator = StreamAccumulator::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(StreamInterrupted {
                    error: TransportError::Cancelled,
                    partial_text: accumulator.finish(),
                });
            }
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if let Some(partial) = accumulator.push(&chunk) {
                    on_partial(partial);
                }
            }
            Some(Err(error)) => {
                return Err(StreamInterrupted { error, partial_text: accumulator.finish() });
            }
            None => return Ok(accumulator.finish()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::stream;
    use tokio_util::sync::CancellationToken;

    use super::{accumulate, StreamAccumulator};
    use crate::llm::TransportError;

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, TransportError>> {
        parts.iter().copied().map(|part| Ok(Bytes::from_static(part.as_bytes()))).collect()
    }

    #[test]
    fn multibyte_character_split_across_chunks_is_held_back() {
        let euro = "€".as_bytes();
        let mut accumulator = StreamAccumulator::new();

        assert_eq!(accumulator.push(b"Cost: "), Some("Cost: "));
        assert_eq!(accumulator.push(&euro[..1]), None);
        assert_eq!(accumulator.push(&euro[1..2]), None);
        assert_eq!(accumulator.push(&euro[2..]), Some("Cost: €"));
        assert_eq!(accumulator.finish(), "Cost: €");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.push(b"ok \xff then");
        assert_eq!(accumulator.text(), "ok \u{fffd} then");
    }

    #[test]
    fn truncated_sequence_at_end_of_stream_is_replaced() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.push(b"tile \xe2\x82");
        assert_eq!(accumulator.text(), "tile ");
        assert_eq!(accumulator.finish(), "tile \u{fffd}");
    }

    #[test]
    fn partial_states_grow_monotonically() {
        let mut accumulator = StreamAccumulator::new();
        let mut states = Vec::new();
        for chunk in ["Hel", "", "lo", " world"] {
            if let Some(partial) = accumulator.push(chunk.as_bytes()) {
                states.push(partial.to_string());
            }
        }

        assert_eq!(states, vec!["Hel", "Hello", "Hello world"]);
        for pair in states.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
    }

    #[tokio::test]
    async fn accumulate_reports_partials_and_returns_final_text() {
        let source = stream::iter(chunks(&["Sure, ", "adding ", "demo work."]));
        let cancel = CancellationToken::new();
        let mut partials = Vec::new();

        let text = accumulate(source, &cancel, |partial| partials.push(partial.to_string()))
            .await
            .expect("stream completes");

        assert_eq!(text, "Sure, adding demo work.");
        assert_eq!(partials.last().map(String::as_str), Some("Sure, adding demo work."));
        assert_eq!(partials.len(), 3);
    }

    #[tokio::test]
    async fn transport_error_surfaces_with_partial_text() {
        let mut items = chunks(&["Working on it"]);
        items.push(Err(TransportError::Request("connection reset".to_string())));
        let cancel = CancellationToken::new();

        let interrupted = accumulate(stream::iter(items), &cancel, |_| {})
            .await
            .expect_err("stream should fail");

        assert!(matches!(interrupted.error, TransportError::Request(_)));
        assert_eq!(interrupted.partial_text, "Working on it");
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_reading() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let interrupted = accumulate(stream::iter(chunks(&["never"])), &cancel, |_| {})
            .await
            .expect_err("cancelled stream should not complete");

        assert!(matches!(interrupted.error, TransportError::Cancelled));
        assert_eq!(interrupted.partial_text, "");
    }

    #[tokio::test]
    async fn empty_stream_completes_with_empty_text() {
        let cancel = CancellationToken::new();
        let text = accumulate(stream::iter(chunks(&[])), &cancel, |_| {})
            .await
            .expect("empty stream completes");
        assert_eq!(text, "");
    }
}
