//! Turning frames into message trees
use crate::framing::{Continuation, Frame};
use crate::node::{Capability, MessageNode};
use crate::record::{Direction, FrameRole};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Nesting limit for content parsers descending into bodies
const MAX_DEPTH: usize = 8;

/// Content could be framed but not interpreted
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("{parser}: {reason}")]
pub struct ParseError {
  /// parser that gave up
  pub parser: String,
  /// what it tripped over
  pub reason: String,
}

impl ParseError {
  /// Create a parse error
  pub fn new(parser: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      parser: parser.into(),
      reason: reason.into(),
    }
  }
}

/// What a content parser knows about the frame it is looking at
#[derive(Clone, Copy, Debug)]
pub struct ParseContext<'a> {
  /// travel direction
  pub direction: Direction,
  /// role assigned by framing
  pub role: FrameRole,
  /// state the frame was detected under
  pub continuation: Option<&'a Continuation>,
  /// only the tail of the message is present, its head went out earlier
  pub partial: bool,
}

impl<'a> ParseContext<'a> {
  /// Context describing `frame`
  pub fn of(frame: &'a Frame) -> Self {
    Self {
      direction: frame.direction,
      role: frame.role,
      continuation: frame.continuation.as_ref(),
      partial: frame.head_flushed,
    }
  }
}

/// Sub-parser adding typed children to a node
pub trait ContentParser: Send + Sync {
  /// Activation name of the protocol the parser belongs to
  fn name(&self) -> &str;
  /// Structure `node` in place.
  ///
  /// `Ok(false)` means the content is not for this parser. Children must be
  /// built from slices of `node` so they never leave its byte range.
  fn parse(&self, node: &mut MessageNode, context: &ParseContext<'_>) -> Result<bool, ParseError>;
}

/// Builds message trees from framed bytes
#[derive(Clone, Default)]
pub struct MessageBuilder {
  message_parser: Option<Arc<dyn ContentParser>>,
  body_parsers: Vec<Arc<dyn ContentParser>>,
}

impl MessageBuilder {
  /// Create a builder; `message_parser` structures whole frames,
  /// `body_parsers` are offered every node tagged as body.
  pub fn new(
    message_parser: Option<Arc<dyn ContentParser>>,
    body_parsers: Vec<Arc<dyn ContentParser>>,
  ) -> Self {
    Self {
      message_parser,
      body_parsers,
    }
  }

  /// Build the tree for `frame`
  pub fn build_frame(&self, frame: &Frame) -> MessageNode {
    self.build(frame.bytes.clone(), frame.offset, &ParseContext::of(frame))
  }

  /// Build the tree for `bytes` starting at stream position `offset`.
  ///
  /// Never fails: content nothing could be made of comes back as a root node
  /// tagged [`Capability::UNPARSED`].
  pub fn build(&self, bytes: Bytes, offset: u64, context: &ParseContext<'_>) -> MessageNode {
    let mut root = MessageNode::new(bytes, offset);
    let parser = match (&self.message_parser, context.role) {
      (Some(parser), role) if role != FrameRole::Fragment && !context.partial => parser,
      _ => {
        root.tag(Capability::UNPARSED);
        return root;
      }
    };
    match parser.parse(&mut root, context) {
      Ok(true) => self.descend(&mut root, context, 0),
      Ok(false) => {
        root.clear_structure();
        root.tag(Capability::UNPARSED);
      }
      Err(e) => {
        tracing::debug!("[linetap] {} frame left unparsed: {}", context.direction, e);
        root.clear_structure();
        root.tag(Capability::UNPARSED);
      }
    }
    root
  }

  fn descend(&self, node: &mut MessageNode, context: &ParseContext<'_>, depth: usize) {
    if depth >= MAX_DEPTH {
      return;
    }
    for child in node.children_mut() {
      if child.has(Capability::BODY) {
        self.parse_body(child, context, depth + 1);
      } else {
        self.descend(child, context, depth);
      }
    }
  }

  fn parse_body(&self, body: &mut MessageNode, context: &ParseContext<'_>, depth: usize) {
    for parser in &self.body_parsers {
      let mut candidate = body.clone();
      match parser.parse(&mut candidate, context) {
        Ok(true) => {
          *body = candidate;
          self.descend(body, context, depth);
          return;
        }
        Ok(false) => {}
        Err(e) => tracing::debug!("[linetap] body left as is: {}", e),
      }
    }
  }
}
