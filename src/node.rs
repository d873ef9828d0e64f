//! Message tree
//!
//! A [`MessageNode`] is one logical protocol unit (a command, a response) or
//! a sub-part of one (a status code, an argument, a body). Every node carries
//! the raw bytes it was built from and the position of those bytes in the
//! forwarded stream; children are always slices of their parent.
//!
//! Structural roles are expressed with [`Capability`] markers instead of
//! node subtypes. Protocol plugins define their own markers next to the
//! generic ones declared here.
use crate::errors::{Error, Result};
use crate::record::{Direction, Transmission};
use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// Marker naming a structural role a node plays
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability(&'static str);

impl Capability {
  /// a request the client issued
  pub const COMMAND: Capability = Capability::new("command");
  /// an answer from the server
  pub const RESPONSE: Capability = Capability::new("response");
  /// the unsolicited server banner
  pub const GREETING: Capability = Capability::new("greeting");
  /// opaque payload that content parsers may descend into
  pub const BODY: Capability = Capability::new("body");
  /// nothing could be made of the content
  pub const UNPARSED: Capability = Capability::new("unparsed");
  /// a response that was matched to its request
  pub const PAIRED: Capability = Capability::new("paired-request-response");

  /// Declare a capability
  pub const fn new(name: &'static str) -> Self {
    Capability(name)
  }
  /// Marker name
  pub fn name(&self) -> &'static str {
    self.0
  }
}

impl fmt::Debug for Capability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Capability({})", self.0)
  }
}

impl fmt::Display for Capability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.0)
  }
}

/// Position of a node's bytes in the forwarded stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
  /// first byte
  pub offset: u64,
  /// number of bytes
  pub length: usize,
}

impl ByteRange {
  /// One past the last byte
  pub fn end(&self) -> u64 {
    self.offset + self.length as u64
  }
  /// Whether `other` lies entirely within this range
  pub fn contains(&self, other: &ByteRange) -> bool {
    other.offset >= self.offset && other.end() <= self.end()
  }
}

/// Interpreted content of a node, when it differs from the raw bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeValue {
  /// normalised text (upper-cased keyword, unfolded header, ...)
  Text(String),
  /// numeric field such as a reply code
  Integer(i64),
  /// decoded binary content (base64, dot-unstuffed body)
  Bytes(Bytes),
}

/// Typed, navigable protocol message tree
#[derive(Clone, Debug, PartialEq)]
pub struct MessageNode {
  range: ByteRange,
  raw: Bytes,
  children: Vec<(String, MessageNode)>,
  capabilities: Vec<Capability>,
  value: Option<NodeValue>,
  transmission: Option<Transmission>,
}

impl MessageNode {
  /// Create a node covering `raw`, which starts at `offset` in the stream
  pub fn new(raw: Bytes, offset: u64) -> Self {
    Self {
      range: ByteRange {
        offset,
        length: raw.len(),
      },
      raw,
      children: Vec::new(),
      capabilities: Vec::new(),
      value: None,
      transmission: None,
    }
  }

  /// Stream position of the node
  pub fn range(&self) -> ByteRange {
    self.range
  }
  /// Raw bytes of the node
  pub fn raw(&self) -> &Bytes {
    &self.raw
  }
  /// Raw bytes decoded lossily as UTF-8
  pub fn raw_str(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.raw)
  }

  /// The content a reader is interested in: the value if one was set,
  /// otherwise the raw bytes.
  pub fn string_content(&self) -> String {
    match &self.value {
      Some(NodeValue::Text(text)) => text.clone(),
      Some(NodeValue::Integer(number)) => number.to_string(),
      Some(NodeValue::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
      None => self.raw_str().into_owned(),
    }
  }

  /// Interpreted value
  pub fn value(&self) -> Option<&NodeValue> {
    self.value.as_ref()
  }
  /// Set the interpreted value
  pub fn set_value(&mut self, value: NodeValue) {
    self.value = Some(value);
  }
  /// Text value, if the value is text
  pub fn text(&self) -> Option<&str> {
    match &self.value {
      Some(NodeValue::Text(text)) => Some(text),
      _ => None,
    }
  }
  /// Integer value, if the value is an integer
  pub fn integer(&self) -> Option<i64> {
    match self.value {
      Some(NodeValue::Integer(number)) => Some(number),
      _ => None,
    }
  }

  /// Build a detached node from `raw[start..end]` of this node
  pub fn slice(&self, start: usize, end: usize) -> Option<MessageNode> {
    if start > end || end > self.raw.len() {
      return None;
    }
    Some(MessageNode::new(
      self.raw.slice(start..end),
      self.range.offset + start as u64,
    ))
  }

  /// Attach a child built from `raw[start..end]` of this node
  pub fn add_slice(
    &mut self,
    name: impl Into<String>,
    start: usize,
    end: usize,
  ) -> Option<&mut MessageNode> {
    let child = self.slice(start, end)?;
    self.children.push((name.into(), child));
    self.children.last_mut().map(|(_, c)| c)
  }

  /// Attach a child positionally, named after its index
  pub fn push_slice(&mut self, start: usize, end: usize) -> Option<&mut MessageNode> {
    let name = self.children.len().to_string();
    self.add_slice(name, start, end)
  }

  /// Attach a prepared child; its range must lie within this node
  pub fn add_child(&mut self, name: impl Into<String>, child: MessageNode) -> Result<&mut MessageNode> {
    if !self.range.contains(&child.range) {
      return Err(Error::other(format!(
        "child range {:?} outside parent range {:?}",
        child.range, self.range
      )));
    }
    self.children.push((name.into(), child));
    self
      .children
      .last_mut()
      .map(|(_, c)| c)
      .ok_or_else(|| Error::other("child vanished"))
  }

  /// Children in insertion order
  pub fn children(&self) -> impl Iterator<Item = (&str, &MessageNode)> {
    self.children.iter().map(|(n, c)| (n.as_str(), c))
  }
  /// Children in insertion order, mutably
  pub fn children_mut(&mut self) -> impl Iterator<Item = &mut MessageNode> {
    self.children.iter_mut().map(|(_, c)| c)
  }
  /// First child called `name`
  pub fn child(&self, name: &str) -> Option<&MessageNode> {
    self.children.iter().find(|(n, _)| n == name).map(|(_, c)| c)
  }
  /// All children called `name`
  pub fn children_named<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a MessageNode> + 'n
  where
    'a: 'n,
  {
    self
      .children
      .iter()
      .filter(move |(n, _)| n == name)
      .map(|(_, c)| c)
  }
  /// Drop every child and value, keeping raw bytes and metadata
  pub fn clear_structure(&mut self) {
    self.children.clear();
    self.capabilities.clear();
    self.value = None;
  }

  /// Add a capability marker (no duplicates)
  pub fn tag(&mut self, capability: Capability) -> &mut Self {
    if !self.capabilities.contains(&capability) {
      self.capabilities.push(capability);
    }
    self
  }
  /// Whether the node carries `capability`
  pub fn has(&self, capability: Capability) -> bool {
    self.capabilities.contains(&capability)
  }
  /// Markers in the order they were added
  pub fn capabilities(&self) -> &[Capability] {
    &self.capabilities
  }
  /// Typed access guard: fails with [`Error::MissingCapability`]
  pub fn require(&self, capability: Capability) -> Result<&Self> {
    if self.has(capability) {
      Ok(self)
    } else {
      Err(Error::MissingCapability(capability.name()))
    }
  }

  /// Transmission metadata of a top-level node
  pub fn transmission(&self) -> Option<&Transmission> {
    self.transmission.as_ref()
  }
  pub(crate) fn set_transmission(&mut self, transmission: Transmission) {
    self.transmission = Some(transmission);
  }
  pub(crate) fn transmission_mut(&mut self) -> Option<&mut Transmission> {
    self.transmission.as_mut()
  }
  /// Travel direction of a top-level node
  pub fn direction(&self) -> Option<Direction> {
    self.transmission.as_ref().map(|t| t.direction)
  }
  /// Transmission timestamp of a top-level node, unix millis
  pub fn timestamp(&self) -> Option<u64> {
    self.transmission.as_ref().map(|t| t.timestamp)
  }

  /// Every node matching `path`
  ///
  /// ```rust
  /// # use linetap::MessageNode;
  /// # fn run() -> linetap::Result<()> {
  /// let mut node = MessageNode::new(bytes::Bytes::from_static(b"RETR 1\r\n"), 0);
  /// node.add_slice("pop3Arguments", 5, 6);
  /// assert_eq!(node.find_first("$.pop3Arguments")?.unwrap().raw_str(), "1");
  /// # Ok(())
  /// # }
  /// ```
  pub fn find_all(&self, path: &str) -> Result<Vec<&MessageNode>> {
    let segments = parse_path(path)?;
    let mut current = vec![self];
    for segment in &segments {
      let mut next: Vec<&MessageNode> = Vec::new();
      for node in current {
        match segment {
          Segment::Child(name) => next.extend(
            node
              .children
              .iter()
              .filter(|(n, _)| n == name)
              .map(|(_, c)| c),
          ),
          Segment::AnyChild => next.extend(node.children.iter().map(|(_, c)| c)),
          Segment::Descendant(name) => node.collect_descendants(Some(name), &mut next),
          Segment::AnyDescendant => node.collect_descendants(None, &mut next),
        }
      }
      let mut unique: Vec<&MessageNode> = Vec::with_capacity(next.len());
      for node in next {
        if !unique.iter().any(|seen| std::ptr::eq(*seen, node)) {
          unique.push(node);
        }
      }
      current = unique;
    }
    Ok(current)
  }

  /// First node matching `path`
  pub fn find_first(&self, path: &str) -> Result<Option<&MessageNode>> {
    Ok(self.find_all(path)?.into_iter().next())
  }

  fn collect_descendants<'a>(&'a self, name: Option<&str>, out: &mut Vec<&'a MessageNode>) {
    for (child_name, child) in &self.children {
      if name.map_or(true, |n| n == child_name.as_str()) {
        out.push(child);
      }
      child.collect_descendants(name, out);
    }
  }

  /// Indented outline of the tree, one node per line
  pub fn print_tree(&self) -> String {
    let mut out = String::new();
    self.write_tree("$", 0, &mut out);
    out
  }

  fn write_tree(&self, name: &str, depth: usize, out: &mut String) {
    let caps: Vec<&str> = self.capabilities.iter().map(|c| c.name()).collect();
    let content = self.string_content();
    let preview: String = content.escape_debug().take(60).collect();
    out.push_str(&format!(
      "{}{} [{}..{}] {{{}}} \"{}\"\n",
      "  ".repeat(depth),
      name,
      self.range.offset,
      self.range.end(),
      caps.join(","),
      preview
    ));
    for (child_name, child) in &self.children {
      child.write_tree(child_name, depth + 1, out);
    }
  }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
  Child(String),
  AnyChild,
  Descendant(String),
  AnyDescendant,
}

fn parse_path(path: &str) -> Result<Vec<Segment>> {
  let rest = path
    .trim()
    .strip_prefix('$')
    .ok_or_else(|| Error::invalid_path(path, "must start with `$`"))?;
  let mut segments = Vec::new();
  let mut remaining = rest;
  while !remaining.is_empty() {
    let (recursive, tail) = if let Some(tail) = remaining.strip_prefix("..") {
      (true, tail)
    } else if let Some(tail) = remaining.strip_prefix('.') {
      (false, tail)
    } else {
      return Err(Error::invalid_path(path, "expected `.` between segments"));
    };
    let end = tail.find('.').unwrap_or(tail.len());
    let name = &tail[..end];
    if name.is_empty() {
      return Err(Error::invalid_path(path, "empty segment"));
    }
    segments.push(match (recursive, name) {
      (false, "*") => Segment::AnyChild,
      (true, "*") => Segment::AnyDescendant,
      (false, n) => Segment::Child(n.to_string()),
      (true, n) => Segment::Descendant(n.to_string()),
    });
    remaining = &tail[end..];
  }
  Ok(segments)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> MessageNode {
    let mut root = MessageNode::new(Bytes::from_static(b"250-first\r\n250 second\r\n"), 100);
    root.tag(Capability::RESPONSE);
    let lines = root.add_slice("lines", 0, 22).unwrap();
    lines.push_slice(4, 9).unwrap().set_value(NodeValue::Text("first".into()));
    lines.push_slice(15, 21).unwrap();
    root.add_slice("status", 0, 3).unwrap().set_value(NodeValue::Integer(250));
    root.add_slice("status", 11, 14).unwrap();
    root
  }

  #[test]
  fn slices_keep_stream_offsets() {
    let root = sample();
    let status = root.child("status").unwrap();
    assert_eq!(status.range(), ByteRange { offset: 100, length: 3 });
    assert!(root.range().contains(&status.range()));
    assert!(root.slice(5, 100).is_none());
    assert!(root.slice(6, 5).is_none());
  }

  #[test]
  fn duplicate_names_are_all_returned() {
    let root = sample();
    let statuses = root.find_all("$.status").unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].integer(), Some(250));
    assert_eq!(statuses[1].raw_str(), "250");
  }

  #[test]
  fn lookups_by_name_outlive_the_name() {
    let root = sample();
    let found = {
      let name = String::from("status");
      let second = root.children_named(&name).nth(1).unwrap();
      (root.child(&name).unwrap(), second)
    };
    assert_eq!(found.0.integer(), Some(250));
    assert_eq!(found.1.range().offset, 111);
    assert!(root.child("missing").is_none());
  }

  #[test]
  fn positional_and_recursive_paths() {
    let root = sample();
    assert_eq!(root.find_first("$.lines.1").unwrap().unwrap().raw_str(), "second");
    assert_eq!(root.find_all("$.lines.*").unwrap().len(), 2);
    assert_eq!(root.find_all("$..0").unwrap().len(), 1);
    assert_eq!(root.find_all("$..*").unwrap().len(), 5);
    assert!(root.find_first("$.missing").unwrap().is_none());
    assert_eq!(root.find_all("$").unwrap().len(), 1);
  }

  #[test]
  fn malformed_paths_are_rejected() {
    let root = sample();
    assert!(matches!(root.find_all("lines"), Err(Error::InvalidPath { .. })));
    assert!(matches!(root.find_all("$.lines..."), Err(Error::InvalidPath { .. })));
    assert!(matches!(root.find_all("$lines"), Err(Error::InvalidPath { .. })));
  }

  #[test]
  fn capability_guard_fails_explicitly() {
    let root = sample();
    assert!(root.require(Capability::RESPONSE).is_ok());
    match root.require(Capability::COMMAND) {
      Err(Error::MissingCapability(name)) => assert_eq!(name, "command"),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn foreign_children_are_refused() {
    let mut root = sample();
    let outsider = MessageNode::new(Bytes::from_static(b"x"), 5);
    assert!(root.add_child("x", outsider).is_err());
    let insider = root.slice(0, 3).unwrap();
    assert!(root.add_child("code", insider).is_ok());
  }

  #[test]
  fn string_content_prefers_value() {
    let root = sample();
    assert_eq!(root.find_first("$.lines.0").unwrap().unwrap().string_content(), "first");
    assert_eq!(root.find_first("$.lines.1").unwrap().unwrap().string_content(), "second");
    assert!(root.print_tree().contains("{response}"));
  }
}
