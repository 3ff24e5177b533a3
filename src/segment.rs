//! Streaming delta aggregation - re-chunking model output for transport
//!
//! Chat surfaces cap outbound message size and charge per edit, so raw model
//! deltas (a few characters each) can't be forwarded one-to-one. The
//! [`SegmentWriter`] accumulates deltas into [`Segment`]s and hands a segment
//! to the transport channel whenever a send threshold fires. The first
//! threshold is small (fast first paint), then each emission raises it by a
//! fixed step so long replies settle into fewer, larger messages.
//!
//! Lengths are measured in UTF-16 code units rather than bytes: transport
//! limits (and the original 3896 cap) are expressed in UTF-16, and byte
//! counting would cut multi-byte languages short.

use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

/// Hard cap on one outbound segment, in UTF-16 code units.
pub const SEGMENT_HARD_CAP: usize = 3896;

/// Send threshold for the first segment of a trip.
pub const FIRST_SEND_THRESHOLD: usize = 30;

/// Amount each emission raises the send threshold.
pub const SEND_THRESHOLD_STEP: usize = 500;

/// Length of a string in UTF-16 code units.
///
/// # Example
/// ```
/// use chatrelay::segment::utf16_len;
///
/// assert_eq!(utf16_len("abc"), 3);
/// assert_eq!(utf16_len("héllo"), 5);
/// assert_eq!(utf16_len("𝄞"), 2); // astral plane: surrogate pair
/// ```
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Split `s` at the last char boundary whose prefix fits in `max_units`
/// UTF-16 code units.
fn split_at_utf16(s: &str, max_units: usize) -> (&str, &str) {
    let mut units = 0;
    for (byte_idx, ch) in s.char_indices() {
        let width = ch.len_utf16();
        if units + width > max_units {
            return s.split_at(byte_idx);
        }
        units += width;
    }
    (s, "")
}

/// A transport-ready chunk of assistant output.
///
/// `content` is this chunk only; `full_content` is the cumulative round text
/// up to and including this chunk, so a consumer that edits one growing
/// message instead of sending many can use it directly.
#[derive(Debug, Clone)]
pub struct Segment {
    /// This chunk's text. Never exceeds [`SEGMENT_HARD_CAP`] UTF-16 units.
    pub content: String,
    /// Cumulative round text, including `content`.
    pub full_content: String,
    /// The threshold (UTF-16 units) in effect when this segment was emitted.
    pub send_threshold: usize,
    /// Cumulative token usage reported so far.
    pub token_cost: u64,
}

/// Accumulates streamed deltas and emits [`Segment`]s to an ordered channel.
///
/// One writer serves one round and lives across its tool trips; thresholds
/// reset at each [`begin_trip`](SegmentWriter::begin_trip) while
/// `full_content` and token accounting stay cumulative.
pub struct SegmentWriter {
    active: Segment,
    sender: mpsc::Sender<Segment>,
    emitted: usize,
}

impl SegmentWriter {
    /// Create a writer emitting into `sender`.
    pub fn new(sender: mpsc::Sender<Segment>) -> Self {
        Self {
            active: Segment {
                content: String::new(),
                full_content: String::new(),
                send_threshold: FIRST_SEND_THRESHOLD,
                token_cost: 0,
            },
            sender,
            emitted: 0,
        }
    }

    /// Append one delta, emitting segments as thresholds or the hard cap
    /// fire.
    ///
    /// A delta longer than the cap headroom is split at a char boundary so no
    /// emitted segment ever exceeds [`SEGMENT_HARD_CAP`] UTF-16 units; the
    /// cap-triggered fresh segment keeps the current threshold bookkeeping.
    ///
    /// # Errors
    ///
    /// [`RelayError::Cancelled`] when the consumer dropped the receiving end.
    pub async fn push(&mut self, delta: &str) -> Result<()> {
        let mut rest = delta;
        while !rest.is_empty() {
            let room = SEGMENT_HARD_CAP - utf16_len(&self.active.content);
            let (head, tail) = split_at_utf16(rest, room);
            self.active.content.push_str(head);
            self.active.full_content.push_str(head);
            rest = tail;
            if !rest.is_empty() {
                // Cap reached mid-delta: flush and keep filling.
                let threshold = self.active.send_threshold;
                self.emit(threshold).await?;
            }
        }

        if utf16_len(&self.active.content) > self.active.send_threshold {
            let raised = self.active.send_threshold + SEND_THRESHOLD_STEP;
            self.emit(raised).await?;
        }
        Ok(())
    }

    /// Record token usage reported by the stream. Cumulative for the round.
    pub fn add_tokens(&mut self, tokens: u64) {
        self.active.token_cost += tokens;
    }

    /// Emit the active segment if it carries any non-whitespace content.
    ///
    /// Called at the end of every trip so trailing output below the threshold
    /// is never dropped.
    pub async fn flush_trailing(&mut self) -> Result<()> {
        if !self.active.content.trim_end().is_empty() {
            let threshold = self.active.send_threshold;
            self.emit(threshold).await?;
        } else {
            // Whitespace-only residue is not worth a transport message.
            self.active.content.clear();
        }
        Ok(())
    }

    /// Start a new trip: reset the threshold for a fast first chunk after the
    /// tool-execution pause. Cumulative counters are untouched.
    pub fn begin_trip(&mut self) {
        self.active.send_threshold = FIRST_SEND_THRESHOLD;
    }

    /// Flush any trailing content and consume the writer, returning the
    /// round's cumulative text and token cost.
    pub async fn finish(mut self) -> Result<(String, u64)> {
        self.flush_trailing().await?;
        Ok((self.active.full_content, self.active.token_cost))
    }

    /// Cumulative round text so far.
    pub fn full_content(&self) -> &str {
        &self.active.full_content
    }

    /// Cumulative token usage so far.
    pub fn token_cost(&self) -> u64 {
        self.active.token_cost
    }

    /// Number of segments emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Hand the active segment to the transport and start a fresh one
    /// inheriting the cumulative counters, with `next_threshold` in effect.
    async fn emit(&mut self, next_threshold: usize) -> Result<()> {
        let fresh = Segment {
            content: String::new(),
            full_content: self.active.full_content.clone(),
            send_threshold: next_threshold,
            token_cost: self.active.token_cost,
        };
        let outgoing = std::mem::replace(&mut self.active, fresh);
        self.sender
            .send(outgoing)
            .await
            .map_err(|_| RelayError::Cancelled)?;
        self.emitted += 1;
        Ok(())
    }
}
