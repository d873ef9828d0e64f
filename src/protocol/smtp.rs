//! SMTP framing and parsing
//!
//! Replies may span several `ddd-text` lines closed by a `ddd text` line.
//! Once the server accepts `DATA` with `354`, the client sends a
//! dot-terminated message body.
use super::line::{complete_lines_end, dot_line_end, line_end, lines, split_word, trim_eol, unstuff, DOT_TERMINATOR};
use crate::builder::{ContentParser, ParseContext, ParseError};
use crate::errors::Result;
use crate::framing::{Continuation, DetectContext, FrameDecision, FrameDetector, Resumption};
use crate::node::{Capability, MessageNode, NodeValue};
use crate::record::{Direction, FrameRole};
use bytes::Bytes;

/// Activation name
pub const NAME: &str = "smtp";

/// End of a message body
pub const BODY_TERMINATOR: &[u8] = DOT_TERMINATOR;

/// Reply code inviting the message body
pub const START_MAIL_INPUT: u16 = 354;

/// a parsed SMTP command
pub const SMTP_COMMAND: Capability = Capability::new("smtp-command");
/// a parsed SMTP reply
pub const SMTP_REPLY: Capability = Capability::new("smtp-reply");
/// a message body sent after `DATA`
pub const SMTP_DATA: Capability = Capability::new("smtp-data");

/// SMTP detector and parser
#[derive(Clone, Copy, Debug, Default)]
pub struct Smtp;

/// Typed view of a node tagged [`SMTP_REPLY`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpReply {
  /// three digit reply code
  pub code: u16,
  /// text of every line, without code and separator
  pub lines: Vec<String>,
}

impl SmtpReply {
  /// Read the reply out of a parsed node
  pub fn from_node(node: &MessageNode) -> Result<Self> {
    let node = node.require(SMTP_REPLY)?;
    let code = node
      .child("smtpStatus")
      .and_then(|s| s.integer())
      .and_then(|c| u16::try_from(c).ok())
      .ok_or(crate::Error::MissingCapability(SMTP_REPLY.name()))?;
    let lines = node
      .child("smtpLines")
      .map(|l| l.children().map(|(_, line)| line.string_content()).collect())
      .unwrap_or_default();
    Ok(Self { code, lines })
  }

  /// 2xx
  pub fn is_positive(&self) -> bool {
    (200..300).contains(&self.code)
  }
}

fn reply_code(line: &[u8]) -> Option<u16> {
  if line.len() < 3 || !line[..3].iter().all(u8::is_ascii_digit) {
    return None;
  }
  std::str::from_utf8(&line[..3]).ok()?.parse().ok()
}

fn is_data_command(line: &[u8]) -> bool {
  line.eq_ignore_ascii_case(b"DATA")
}

impl Smtp {
  fn parse_command(&self, node: &mut MessageNode) -> std::result::Result<bool, ParseError> {
    let raw = node.raw().clone();
    let content = trim_eol(&raw);
    let (word_end, args_start) = split_word(content);
    let keyword = &content[..word_end];
    if !(4..=8).contains(&keyword.len()) || !keyword.iter().all(u8::is_ascii_alphabetic) {
      return Err(ParseError::new(NAME, "not a command keyword"));
    }
    if let Some(command) = node.add_slice("smtpCommand", 0, word_end) {
      command.set_value(NodeValue::Text(
        String::from_utf8_lossy(keyword).to_ascii_uppercase(),
      ));
    }
    if args_start < content.len() {
      node.add_slice("smtpArguments", args_start, content.len());
    }
    node.tag(Capability::COMMAND).tag(SMTP_COMMAND);
    Ok(true)
  }

  fn parse_body(&self, node: &mut MessageNode) -> std::result::Result<bool, ParseError> {
    let raw = node.raw().clone();
    let body_end = match lines(&raw).last() {
      Some(&(start, end)) if trim_eol(&raw[start..end]) == b"." => start,
      _ => return Err(ParseError::new(NAME, "body without terminator")),
    };
    if let Some(body) = node.add_slice("smtpBody", 0, body_end) {
      body.set_value(NodeValue::Bytes(Bytes::from(unstuff(&raw[..body_end]))));
      body.tag(Capability::BODY);
    }
    node.tag(SMTP_DATA);
    Ok(true)
  }

  fn parse_reply(&self, node: &mut MessageNode, greeting: bool) -> std::result::Result<bool, ParseError> {
    let raw = node.raw().clone();
    let spans = lines(&raw);
    let mut code = None;
    for &(start, end) in &spans {
      let line = trim_eol(&raw[start..end]);
      let line_code = reply_code(line).ok_or_else(|| ParseError::new(NAME, "missing reply code"))?;
      match code {
        None => code = Some(line_code),
        Some(first) if first != line_code => {
          return Err(ParseError::new(NAME, "reply code changes between lines"))
        }
        Some(_) => {}
      }
    }
    let code = code.ok_or_else(|| ParseError::new(NAME, "empty reply"))?;
    if let Some(status) = node.add_slice("smtpStatus", 0, 3) {
      status.set_value(NodeValue::Integer(i64::from(code)));
    }
    if let Some(texts) = node.add_slice("smtpLines", 0, raw.len()) {
      for &(start, end) in &spans {
        let text_end = start + trim_eol(&raw[start..end]).len();
        let text_start = (start + 4).min(text_end);
        texts.push_slice(text_start, text_end);
      }
    }
    node.tag(Capability::RESPONSE).tag(SMTP_REPLY);
    if greeting {
      node.tag(Capability::GREETING);
    }
    Ok(true)
  }
}

impl FrameDetector for Smtp {
  fn name(&self) -> &str {
    NAME
  }

  fn initial_continuation(&self, direction: Direction) -> Option<Continuation> {
    match direction {
      Direction::ServerToClient => Some(Continuation::Greeting),
      Direction::ClientToServer => None,
    }
  }

  fn settle(&self, context: &DetectContext<'_>) -> Option<Continuation> {
    match (context.direction, context.continuation) {
      (Direction::ClientToServer, Some(Continuation::AwaitingReply)) => {
        if context.awaiting_answers() {
          return Some(Continuation::AwaitingReply);
        }
        let accepted = context.last_exchange().is_some_and(|(request, reply)| {
          is_data_command(trim_eol(request.raw())) && reply_code(reply.raw()) == Some(START_MAIL_INPUT)
        });
        accepted.then_some(Continuation::Body {
          terminator: BODY_TERMINATOR,
        })
      }
      (_, continuation) => continuation.cloned(),
    }
  }

  fn detect(&self, buffer: &[u8], context: &DetectContext<'_>) -> FrameDecision {
    match (context.direction, context.continuation) {
      (Direction::ClientToServer, Some(Continuation::Body { .. })) => match dot_line_end(buffer, 0) {
        Some(end) => FrameDecision::Complete(end),
        None => FrameDecision::Incomplete,
      },
      (Direction::ClientToServer, _) => match line_end(buffer, 0) {
        Some(end) if is_data_command(trim_eol(&buffer[..end])) => {
          FrameDecision::CompleteWithContinuation(end, Continuation::AwaitingReply)
        }
        Some(end) => FrameDecision::Complete(end),
        None => FrameDecision::Incomplete,
      },
      (Direction::ServerToClient, _) => {
        let mut start = 0;
        while let Some(end) = line_end(buffer, start) {
          let line = trim_eol(&buffer[start..end]);
          if line.len() < 4 || line[3] != b'-' {
            return FrameDecision::Complete(end);
          }
          start = end;
        }
        FrameDecision::Incomplete
      }
    }
  }

  fn resume_after_flush(&self, buffer: &[u8], context: &DetectContext<'_>) -> Resumption {
    let line_aligned = match (context.direction, context.continuation) {
      (Direction::ClientToServer, Some(Continuation::Body { .. })) => true,
      (Direction::ServerToClient, _) => true,
      _ => false,
    };
    Resumption {
      flush: if line_aligned { complete_lines_end(buffer) } else { 0 },
      continuation: context.continuation.cloned(),
    }
  }
}

impl ContentParser for Smtp {
  fn name(&self) -> &str {
    NAME
  }

  fn parse(&self, node: &mut MessageNode, context: &ParseContext<'_>) -> std::result::Result<bool, ParseError> {
    match context.role {
      FrameRole::Request => match context.continuation {
        Some(Continuation::Body { .. }) => self.parse_body(node),
        _ => self.parse_command(node),
      },
      FrameRole::Response => self.parse_reply(node, false),
      FrameRole::Unsolicited => self.parse_reply(node, true),
      FrameRole::Fragment => Ok(false),
    }
  }
}
