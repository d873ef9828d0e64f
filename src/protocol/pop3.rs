//! POP3 framing and parsing
//!
//! Requests are single lines. A response is a status line, followed by a
//! dot-terminated block when the request asked for one (`CAPA`, `RETR`,
//! `TOP`, `LIST` and `UIDL` without argument). The detector learns which
//! request it is answering from the pairing queue.
use super::line::{complete_lines_end, dot_line_end, line_end, lines, split_word, trim_eol, unstuff, DOT_TERMINATOR};
use crate::builder::{ContentParser, ParseContext, ParseError};
use crate::errors::Result;
use crate::framing::{Continuation, DetectContext, FrameDecision, FrameDetector, Resumption};
use crate::node::{Capability, MessageNode, NodeValue};
use crate::record::{Direction, FrameRole};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::fmt;

/// Activation name
pub const NAME: &str = "pop3";

/// a parsed POP3 command
pub const POP3_COMMAND: Capability = Capability::new("pop3-command");
/// a parsed POP3 status response
pub const POP3_RESPONSE: Capability = Capability::new("pop3-response");
/// a client line sent during a SASL exchange
pub const POP3_AUTH_DATA: Capability = Capability::new("pop3-auth-data");

/// POP3 detector and parser
#[derive(Clone, Copy, Debug, Default)]
pub struct Pop3;

/// Command keywords understood by the parser
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pop3Verb {
  /// `USER name`
  User,
  /// `PASS secret`
  Pass,
  /// `APOP name digest`
  Apop,
  /// `AUTH mechanism [initial-response]`
  Auth,
  /// `STAT`
  Stat,
  /// `LIST [msg]`
  List,
  /// `RETR msg`
  Retr,
  /// `DELE msg`
  Dele,
  /// `NOOP`
  Noop,
  /// `RSET`
  Rset,
  /// `QUIT`
  Quit,
  /// `TOP msg n`
  Top,
  /// `UIDL [msg]`
  Uidl,
  /// `CAPA`
  Capa,
  /// `STLS`
  Stls,
  /// `UTF8`
  Utf8,
}

impl Pop3Verb {
  const ALL: [Pop3Verb; 16] = [
    Pop3Verb::User,
    Pop3Verb::Pass,
    Pop3Verb::Apop,
    Pop3Verb::Auth,
    Pop3Verb::Stat,
    Pop3Verb::List,
    Pop3Verb::Retr,
    Pop3Verb::Dele,
    Pop3Verb::Noop,
    Pop3Verb::Rset,
    Pop3Verb::Quit,
    Pop3Verb::Top,
    Pop3Verb::Uidl,
    Pop3Verb::Capa,
    Pop3Verb::Stls,
    Pop3Verb::Utf8,
  ];

  /// Canonical keyword
  pub fn as_str(self) -> &'static str {
    match self {
      Pop3Verb::User => "USER",
      Pop3Verb::Pass => "PASS",
      Pop3Verb::Apop => "APOP",
      Pop3Verb::Auth => "AUTH",
      Pop3Verb::Stat => "STAT",
      Pop3Verb::List => "LIST",
      Pop3Verb::Retr => "RETR",
      Pop3Verb::Dele => "DELE",
      Pop3Verb::Noop => "NOOP",
      Pop3Verb::Rset => "RSET",
      Pop3Verb::Quit => "QUIT",
      Pop3Verb::Top => "TOP",
      Pop3Verb::Uidl => "UIDL",
      Pop3Verb::Capa => "CAPA",
      Pop3Verb::Stls => "STLS",
      Pop3Verb::Utf8 => "UTF8",
    }
  }

  /// Case-insensitive keyword lookup
  pub fn from_keyword(keyword: &[u8]) -> Option<Pop3Verb> {
    Self::ALL
      .iter()
      .copied()
      .find(|verb| verb.as_str().as_bytes().eq_ignore_ascii_case(keyword))
  }

  /// Whether a positive answer carries a dot-terminated block
  pub fn multi_line_answer(self, has_arguments: bool) -> bool {
    match self {
      Pop3Verb::Capa | Pop3Verb::Retr | Pop3Verb::Top => true,
      Pop3Verb::List | Pop3Verb::Uidl => !has_arguments,
      _ => false,
    }
  }
}

impl fmt::Display for Pop3Verb {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Typed view of a node tagged [`POP3_COMMAND`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pop3Command {
  /// command keyword
  pub verb: Pop3Verb,
  /// everything after the keyword
  pub arguments: Option<String>,
}

impl Pop3Command {
  /// Read the command out of a parsed node
  pub fn from_node(node: &MessageNode) -> Result<Self> {
    let node = node.require(POP3_COMMAND)?;
    let verb = node
      .child("pop3Command")
      .and_then(|c| c.text())
      .and_then(|keyword| Pop3Verb::from_keyword(keyword.as_bytes()))
      .ok_or(crate::Error::MissingCapability(POP3_COMMAND.name()))?;
    let arguments = node.child("pop3Arguments").map(|a| a.string_content());
    Ok(Self { verb, arguments })
  }
}

/// Status indicator of a response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pop3Status {
  /// `+OK`
  Ok,
  /// `-ERR`
  Err,
  /// `+` SASL challenge
  Continue,
}

impl Pop3Status {
  /// Indicator as sent
  pub fn as_str(self) -> &'static str {
    match self {
      Pop3Status::Ok => "+OK",
      Pop3Status::Err => "-ERR",
      Pop3Status::Continue => "+",
    }
  }

  fn parse(line: &[u8]) -> Option<(Pop3Status, usize)> {
    let (word_end, _) = split_word(line);
    let word = &line[..word_end];
    if word.eq_ignore_ascii_case(b"+OK") {
      Some((Pop3Status::Ok, word_end))
    } else if word.eq_ignore_ascii_case(b"-ERR") {
      Some((Pop3Status::Err, word_end))
    } else if word == b"+" {
      Some((Pop3Status::Continue, word_end))
    } else {
      None
    }
  }
}

/// Typed view of a node tagged [`POP3_RESPONSE`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pop3Reply {
  /// status indicator
  pub status: Pop3Status,
  /// text after the indicator on the first line
  pub header: Option<String>,
  /// dot-unstuffed block of a multi-line answer
  pub body: Option<Bytes>,
}

impl Pop3Reply {
  /// Read the reply out of a parsed node
  pub fn from_node(node: &MessageNode) -> Result<Self> {
    let node = node.require(POP3_RESPONSE)?;
    let status = node
      .child("pop3Status")
      .and_then(|s| Pop3Status::parse(s.raw()))
      .map(|(status, _)| status)
      .ok_or(crate::Error::MissingCapability(POP3_RESPONSE.name()))?;
    let header = node.child("pop3Header").map(|h| h.string_content());
    let body = node.child("pop3Body").and_then(|b| match b.value() {
      Some(NodeValue::Bytes(bytes)) => Some(bytes.clone()),
      _ => None,
    });
    Ok(Self { status, header, body })
  }
}

fn is_status_line(line: &[u8]) -> bool {
  line.starts_with(b"+") || line.starts_with(b"-")
}

impl Pop3 {
  fn expects_block(&self, buffer: &[u8], first_line: usize, context: &DetectContext<'_>) -> bool {
    match context.pending_request() {
      Some(request) => match Pop3Command::from_node(&request) {
        Ok(command) => command.verb.multi_line_answer(command.arguments.is_some()),
        Err(_) => false,
      },
      None => match line_end(buffer, first_line) {
        Some(end) => !is_status_line(&buffer[first_line..end]),
        None => false,
      },
    }
  }

  fn parse_command(&self, node: &mut MessageNode) -> std::result::Result<bool, ParseError> {
    let raw = node.raw().clone();
    let content = trim_eol(&raw);
    let (word_end, args_start) = split_word(content);
    let verb = Pop3Verb::from_keyword(&content[..word_end]).ok_or_else(|| {
      ParseError::new(
        NAME,
        format!("unknown command `{}`", String::from_utf8_lossy(&content[..word_end])),
      )
    })?;
    if let Some(command) = node.add_slice("pop3Command", 0, word_end) {
      command.set_value(NodeValue::Text(verb.as_str().to_string()));
    }
    if args_start < content.len() {
      node.add_slice("pop3Arguments", args_start, content.len());
      if verb == Pop3Verb::Auth {
        self.parse_initial_response(node, &content[args_start..], args_start);
      }
    }
    node.tag(Capability::COMMAND).tag(POP3_COMMAND);
    Ok(true)
  }

  fn parse_initial_response(&self, node: &mut MessageNode, arguments: &[u8], offset: usize) {
    let (mechanism_end, response_start) = split_word(arguments);
    if !arguments[..mechanism_end].eq_ignore_ascii_case(b"PLAIN") || response_start == arguments.len() {
      return;
    }
    let encoded = &arguments[response_start..];
    let Ok(decoded) = BASE64_STANDARD.decode(encoded) else {
      tracing::debug!("[linetap] AUTH PLAIN initial response is not base64");
      return;
    };
    let fields: Vec<&[u8]> = decoded.split(|b| *b == 0).collect();
    if fields.len() != 3 {
      return;
    }
    let start = offset + response_start;
    let end = offset + arguments.len();
    let names = ["authorizationId", "authenticationId", "password"];
    let values: Vec<String> = fields
      .iter()
      .map(|f| String::from_utf8_lossy(f).into_owned())
      .collect();
    let Some(credentials) = node.add_slice("pop3Credentials", start, end) else {
      return;
    };
    credentials.set_value(NodeValue::Bytes(Bytes::from(decoded)));
    let length = end - start;
    for (name, value) in names.iter().zip(values) {
      if let Some(field) = credentials.add_slice(*name, 0, length) {
        field.set_value(NodeValue::Text(value));
      }
    }
  }

  fn parse_auth_data(&self, node: &mut MessageNode) -> std::result::Result<bool, ParseError> {
    let raw = node.raw().clone();
    let content = trim_eol(&raw);
    if let Some(data) = node.add_slice("pop3AuthData", 0, content.len()) {
      if let Ok(decoded) = BASE64_STANDARD.decode(content) {
        data.set_value(NodeValue::Bytes(Bytes::from(decoded)));
      }
    }
    node.tag(POP3_AUTH_DATA);
    Ok(true)
  }

  fn parse_response(&self, node: &mut MessageNode, greeting: bool) -> std::result::Result<bool, ParseError> {
    let raw = node.raw().clone();
    let first_end = line_end(&raw, 0).unwrap_or(raw.len());
    let first = trim_eol(&raw[..first_end]);
    let (status, status_end) =
      Pop3Status::parse(first).ok_or_else(|| ParseError::new(NAME, "missing status indicator"))?;
    if let Some(indicator) = node.add_slice("pop3Status", 0, status_end) {
      indicator.set_value(NodeValue::Text(status.as_str().to_string()));
    }
    let (_, header_start) = split_word(first);
    if header_start < first.len() {
      node.add_slice("pop3Header", header_start, first.len());
      if greeting {
        if let (Some(open), Some(close)) = (
          first.iter().position(|b| *b == b'<'),
          first.iter().rposition(|b| *b == b'>'),
        ) {
          if open < close {
            node.add_slice("pop3Timestamp", open, close + 1);
          }
        }
      }
    }
    if first_end < raw.len() {
      let body_end = match lines(&raw).last() {
        Some(&(start, end)) if start >= first_end && trim_eol(&raw[start..end]) == b"." => start,
        _ => raw.len(),
      };
      let unstuffed = unstuff(&raw[first_end..body_end]);
      if let Some(body) = node.add_slice("pop3Body", first_end, body_end) {
        body.set_value(NodeValue::Bytes(Bytes::from(unstuffed)));
        body.tag(Capability::BODY);
      }
    }
    node.tag(Capability::RESPONSE).tag(POP3_RESPONSE);
    if greeting {
      node.tag(Capability::GREETING);
    }
    Ok(true)
  }
}

impl FrameDetector for Pop3 {
  fn name(&self) -> &str {
    NAME
  }

  fn initial_continuation(&self, direction: Direction) -> Option<Continuation> {
    match direction {
      Direction::ServerToClient => Some(Continuation::Greeting),
      Direction::ClientToServer => None,
    }
  }

  fn detect(&self, buffer: &[u8], context: &DetectContext<'_>) -> FrameDecision {
    if let Some(Continuation::Body { .. }) = context.continuation {
      return match dot_line_end(buffer, 0) {
        Some(end) => FrameDecision::Complete(end),
        None => FrameDecision::Incomplete,
      };
    }
    let Some(first_line) = line_end(buffer, 0) else {
      return FrameDecision::Incomplete;
    };
    match context.direction {
      Direction::ClientToServer => {
        if context.continuation == Some(&Continuation::DataLine) {
          return FrameDecision::Complete(first_line);
        }
        let line = trim_eol(&buffer[..first_line]);
        let (word_end, args_start) = split_word(line);
        let awaits_data = line[..word_end].eq_ignore_ascii_case(b"AUTH")
          && args_start < line.len()
          && !line[args_start..].contains(&b' ');
        if awaits_data {
          FrameDecision::CompleteWithContinuation(first_line, Continuation::DataLine)
        } else {
          FrameDecision::Complete(first_line)
        }
      }
      Direction::ServerToClient => {
        if context.continuation == Some(&Continuation::Greeting) {
          return FrameDecision::Complete(first_line);
        }
        let line = trim_eol(&buffer[..first_line]);
        let positive = matches!(Pop3Status::parse(line), Some((Pop3Status::Ok, _)));
        if !positive || !self.expects_block(buffer, first_line, context) {
          return FrameDecision::Complete(first_line);
        }
        match dot_line_end(buffer, first_line) {
          Some(end) => FrameDecision::Complete(end),
          None => FrameDecision::Incomplete,
        }
      }
    }
  }

  fn resume_after_flush(&self, buffer: &[u8], context: &DetectContext<'_>) -> Resumption {
    let in_block = match (context.direction, context.continuation) {
      (Direction::ServerToClient, Some(Continuation::Body { .. })) => true,
      (Direction::ServerToClient, None) => line_end(buffer, 0).is_some_and(|first_line| {
        matches!(
          Pop3Status::parse(trim_eol(&buffer[..first_line])),
          Some((Pop3Status::Ok, _))
        ) && self.expects_block(buffer, first_line, context)
      }),
      _ => false,
    };
    let aligned = complete_lines_end(buffer);
    if in_block && aligned > 0 {
      // the cut lands on a line start, where the terminating dot line is recognised
      return Resumption {
        flush: aligned,
        continuation: Some(Continuation::Body {
          terminator: DOT_TERMINATOR,
        }),
      };
    }
    Resumption {
      flush: 0,
      continuation: context.continuation.cloned(),
    }
  }
}

impl ContentParser for Pop3 {
  fn name(&self) -> &str {
    NAME
  }

  fn parse(&self, node: &mut MessageNode, context: &ParseContext<'_>) -> std::result::Result<bool, ParseError> {
    match context.role {
      FrameRole::Request if context.continuation == Some(&Continuation::DataLine) => {
        self.parse_auth_data(node)
      }
      FrameRole::Request => self.parse_command(node),
      FrameRole::Response => self.parse_response(node, false),
      FrameRole::Unsolicited => self.parse_response(node, true),
      FrameRole::Fragment => Ok(false),
    }
  }
}
