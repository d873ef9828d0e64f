//! Frame detection over a directional byte stream
//!
//! Bytes read from a socket carry no framing meaning: a logical message may
//! arrive in several reads, several messages may arrive in one. The
//! [`ByteAccumulator`] keeps the unresolved suffix of a direction's stream
//! and repeatedly asks a protocol's [`FrameDetector`] whether the buffered
//! bytes start with a complete message.
//!
//! # Example
//!
//! ```rust
//! use linetap::framing::{ByteAccumulator, NoExchange};
//! use linetap::protocol::pop3::Pop3;
//! use linetap::Direction;
//! use std::sync::Arc;
//!
//! let mut client = ByteAccumulator::new(Direction::ClientToServer, Arc::new(Pop3), 1024);
//! assert!(client.accumulate(b"CA", &NoExchange).is_empty());
//! assert!(client.accumulate(b"PA", &NoExchange).is_empty());
//! let frames = client.accumulate(b"\r\nQUIT\r\n", &NoExchange);
//! assert_eq!(frames.len(), 2);
//! assert_eq!(&frames[0].bytes[..], b"CAPA\r\n");
//! ```
use crate::node::MessageNode;
use crate::record::{Direction, FrameRole};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Grammar state a detector leaves behind for the next frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Continuation {
  /// the next frame is a banner the server sends unprompted
  Greeting,
  /// the next frame is a body that ends with `terminator`
  Body {
    /// closing byte sequence, part of the frame
    terminator: &'static [u8],
  },
  /// the next frame is one line of opaque data (SASL exchange)
  DataLine,
  /// what follows depends on how the peer answers the previous frame
  AwaitingReply,
}

/// Outcome of one detector call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameDecision {
  /// not enough bytes yet
  Incomplete,
  /// the first `n` bytes are one message
  Complete(usize),
  /// the first `n` bytes are one message and the next one is special
  CompleteWithContinuation(usize, Continuation),
}

/// What to do with buffered bytes when the stream ends mid-frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOfStream {
  /// emit them as a fragment frame
  Flush,
  /// drop them
  Discard,
}

/// Read access to the requests still waiting for an answer
pub trait ExchangeView {
  /// The `skip`-th oldest unanswered request, `0` being the oldest
  fn unanswered(&self, skip: usize) -> Option<Arc<MessageNode>>;
  /// The most recently answered request and its answer
  fn last_exchange(&self) -> Option<(Arc<MessageNode>, Arc<MessageNode>)> {
    None
  }
}

/// Exchange view for detectors used without a pairing engine
#[derive(Clone, Copy, Debug, Default)]
pub struct NoExchange;

impl ExchangeView for NoExchange {
  fn unanswered(&self, _skip: usize) -> Option<Arc<MessageNode>> {
    None
  }
}

/// Everything a detector may consult besides the buffered bytes
pub struct DetectContext<'a> {
  /// direction being framed
  pub direction: Direction,
  /// state left by the previous frame
  pub continuation: Option<&'a Continuation>,
  exchange: &'a dyn ExchangeView,
  responses_ahead: usize,
}

impl<'a> DetectContext<'a> {
  /// Context for a standalone detector call
  pub fn new(
    direction: Direction,
    continuation: Option<&'a Continuation>,
    exchange: &'a dyn ExchangeView,
  ) -> Self {
    Self {
      direction,
      continuation,
      exchange,
      responses_ahead: 0,
    }
  }

  /// The request the frame being detected will answer, if it is a response.
  ///
  /// Responses framed earlier in the same read are not paired yet; they are
  /// skipped so that each one looks at its own request.
  pub fn pending_request(&self) -> Option<Arc<MessageNode>> {
    self.exchange.unanswered(self.responses_ahead)
  }

  /// Whether any request is still waiting for its answer
  pub fn awaiting_answers(&self) -> bool {
    self.exchange.unanswered(0).is_some()
  }

  /// The most recently answered request and its answer
  pub fn last_exchange(&self) -> Option<(Arc<MessageNode>, Arc<MessageNode>)> {
    self.exchange.last_exchange()
  }
}

/// How a frame too large to buffer continues after its head is flushed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resumption {
  /// buffered bytes to flush now; `0` flushes everything
  pub flush: usize,
  /// state the rest of the frame is detected under
  pub continuation: Option<Continuation>,
}

/// Protocol-specific frame boundary detection
pub trait FrameDetector: Send + Sync {
  /// Activation name of the protocol
  fn name(&self) -> &str;

  /// State a fresh stream starts in
  fn initial_continuation(&self, _direction: Direction) -> Option<Continuation> {
    None
  }

  /// Resolve a state that waits on the peer before the next detection.
  ///
  /// The returned state replaces the current one.
  fn settle(&self, context: &DetectContext<'_>) -> Option<Continuation> {
    context.continuation.cloned()
  }

  /// Decide whether `buffer` starts with a complete message
  fn detect(&self, buffer: &[u8], context: &DetectContext<'_>) -> FrameDecision;

  /// Where to cut an incomplete frame that outgrew the size limit, and how
  /// to frame what follows the cut
  fn resume_after_flush(&self, _buffer: &[u8], context: &DetectContext<'_>) -> Resumption {
    Resumption {
      flush: 0,
      continuation: context.continuation.cloned(),
    }
  }

  /// End-of-stream policy for leftover bytes
  fn end_of_stream(&self, _direction: Direction) -> EndOfStream {
    EndOfStream::Flush
  }
}

/// Detector for unframed traffic: whatever has been read is one frame
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkDetector;

impl FrameDetector for ChunkDetector {
  fn name(&self) -> &str {
    "raw"
  }
  fn detect(&self, buffer: &[u8], _context: &DetectContext<'_>) -> FrameDecision {
    FrameDecision::Complete(buffer.len())
  }
}

/// A contiguous byte range recognised as one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
  /// the message bytes
  pub bytes: Bytes,
  /// position of the first byte in the received stream
  pub offset: u64,
  /// direction it was read in
  pub direction: Direction,
  /// part it plays in the conversation
  pub role: FrameRole,
  /// state the frame was detected under
  pub continuation: Option<Continuation>,
  /// the head of the message went out earlier as fragments
  pub head_flushed: bool,
}

impl Frame {
  /// Whether the frame was emitted without a complete message
  pub fn is_fragment(&self) -> bool {
    self.role == FrameRole::Fragment
  }
}

/// Unresolved suffix of a stream and the grammar state that goes with it
#[derive(Debug, Default)]
pub struct PendingFrame {
  buffer: BytesMut,
  continuation: Option<Continuation>,
  overflow: Option<Overflow>,
}

/// A message whose head was flushed before its end was seen
#[derive(Debug)]
struct Overflow {
  started_under: Option<Continuation>,
}

impl PendingFrame {
  /// Buffered bytes
  pub fn bytes(&self) -> &[u8] {
    &self.buffer
  }
  /// State the next frame will be detected under
  pub fn continuation(&self) -> Option<&Continuation> {
    self.continuation.as_ref()
  }
  /// Whether the buffered bytes continue a message flushed for its size
  pub fn is_overflowing(&self) -> bool {
    self.overflow.is_some()
  }
}

/// Per-direction buffer turning arbitrary reads into frames
pub struct ByteAccumulator {
  direction: Direction,
  detector: Arc<dyn FrameDetector>,
  pending: PendingFrame,
  max_frame_size: usize,
  consumed: u64,
}

impl ByteAccumulator {
  /// Create an accumulator; `max_frame_size` bounds how much may stay pending
  pub fn new(direction: Direction, detector: Arc<dyn FrameDetector>, max_frame_size: usize) -> Self {
    let continuation = detector.initial_continuation(direction);
    Self {
      direction,
      detector,
      pending: PendingFrame {
        buffer: BytesMut::with_capacity(8 * 1024),
        continuation,
        overflow: None,
      },
      max_frame_size: max_frame_size.max(1),
      consumed: 0,
    }
  }

  /// Direction this accumulator frames
  pub fn direction(&self) -> Direction {
    self.direction
  }
  /// The unresolved suffix
  pub fn pending(&self) -> &PendingFrame {
    &self.pending
  }
  /// Total bytes handed out as frames so far
  pub fn consumed(&self) -> u64 {
    self.consumed
  }

  /// Append `new_bytes` and extract every frame now complete, in stream order
  pub fn accumulate(&mut self, new_bytes: &[u8], exchange: &dyn ExchangeView) -> Vec<Frame> {
    self.pending.buffer.extend_from_slice(new_bytes);
    let mut frames = Vec::new();
    let mut responses_ahead = 0;
    while !self.pending.buffer.is_empty() {
      let settled = self.detector.settle(&self.context(exchange, responses_ahead));
      if settled != self.pending.continuation {
        tracing::trace!(
          "[linetap] {} state settled from {:?} to {:?}",
          self.direction,
          self.pending.continuation,
          settled
        );
        self.pending.continuation = settled;
      }
      let decision = self
        .detector
        .detect(&self.pending.buffer, &self.context(exchange, responses_ahead));
      let (length, next) = match decision {
        FrameDecision::Incomplete => break,
        FrameDecision::Complete(length) => (length, None),
        FrameDecision::CompleteWithContinuation(length, next) => (length, Some(next)),
      };
      if length == 0 || length > self.pending.buffer.len() {
        tracing::warn!(
          "[linetap] {} detector returned length {} for {} buffered bytes; waiting for more",
          self.detector.name(),
          length,
          self.pending.buffer.len()
        );
        break;
      }
      let frame = self.extract(length, next);
      if frame.role == FrameRole::Response {
        responses_ahead += 1;
      }
      frames.push(frame);
    }
    if self.pending.buffer.len() > self.max_frame_size {
      frames.push(self.flush_oversized(exchange, responses_ahead));
    }
    frames
  }

  /// Resolve what is left when the stream ends
  pub fn finish(&mut self) -> Option<Frame> {
    if self.pending.buffer.is_empty() {
      return None;
    }
    match self.detector.end_of_stream(self.direction) {
      EndOfStream::Flush => self.fragment(),
      EndOfStream::Discard => {
        tracing::debug!(
          "[linetap] discarding {} unframed {} bytes at end of stream",
          self.pending.buffer.len(),
          self.direction
        );
        self.consumed += self.pending.buffer.len() as u64;
        self.pending.buffer.clear();
        self.pending.continuation = None;
        self.pending.overflow = None;
        None
      }
    }
  }

  fn context<'a>(&'a self, exchange: &'a dyn ExchangeView, responses_ahead: usize) -> DetectContext<'a> {
    DetectContext {
      direction: self.direction,
      continuation: self.pending.continuation.as_ref(),
      exchange,
      responses_ahead,
    }
  }

  fn extract(&mut self, length: usize, next: Option<Continuation>) -> Frame {
    let bytes = self.pending.buffer.split_to(length).freeze();
    let detected_under = std::mem::replace(&mut self.pending.continuation, next);
    let (continuation, head_flushed) = match self.pending.overflow.take() {
      Some(overflow) => (overflow.started_under, true),
      None => (detected_under, false),
    };
    let role = match continuation {
      Some(Continuation::Greeting) => FrameRole::Unsolicited,
      _ => FrameRole::for_direction(self.direction),
    };
    let frame = Frame {
      bytes,
      offset: self.consumed,
      direction: self.direction,
      role,
      continuation,
      head_flushed,
    };
    self.consumed += length as u64;
    frame
  }

  /// Forward the head of a message too large to buffer.
  ///
  /// The grammar state survives the cut: the frame that finally completes
  /// the message keeps the role the message started with.
  fn flush_oversized(&mut self, exchange: &dyn ExchangeView, responses_ahead: usize) -> Frame {
    let resumption = self
      .detector
      .resume_after_flush(&self.pending.buffer, &self.context(exchange, responses_ahead));
    let buffered = self.pending.buffer.len();
    let length = match resumption.flush {
      0 => buffered,
      n => n.min(buffered),
    };
    tracing::warn!(
      "[linetap] {} bytes pending in {} direction exceed the frame limit of {}; forwarding {} ahead of the frame end",
      buffered,
      self.direction,
      self.max_frame_size,
      length
    );
    let started_under = match self.pending.overflow.take() {
      Some(overflow) => overflow.started_under,
      None => self.pending.continuation.clone(),
    };
    let bytes = self.pending.buffer.split_to(length).freeze();
    let continuation = std::mem::replace(&mut self.pending.continuation, resumption.continuation);
    self.pending.overflow = Some(Overflow { started_under });
    let frame = Frame {
      bytes,
      offset: self.consumed,
      direction: self.direction,
      role: FrameRole::Fragment,
      continuation,
      head_flushed: false,
    };
    self.consumed += length as u64;
    frame
  }

  fn fragment(&mut self) -> Option<Frame> {
    if self.pending.buffer.is_empty() {
      return None;
    }
    let length = self.pending.buffer.len();
    let mut frame = self.extract(length, None);
    frame.role = FrameRole::Fragment;
    Some(frame)
  }
}
