//! Internet message headers inside bodies
use super::line::{lines, trim_eol};
use crate::builder::{ContentParser, ParseContext, ParseError};
use crate::node::{Capability, MessageNode, NodeValue};
use mime::Mime;

/// Activation name
pub const NAME: &str = "mime";

/// a body split into header block and content
pub const MIME_MESSAGE: Capability = Capability::new("mime-message");

/// Header and body splitter for message bodies
#[derive(Clone, Copy, Debug, Default)]
pub struct MimeParser;

fn is_header_name(name: &[u8]) -> bool {
  !name.is_empty() && name.iter().all(|b| b.is_ascii_graphic() && *b != b':')
}

struct Header {
  name: String,
  value_start: usize,
  value_end: usize,
  unfolded: String,
}

impl MimeParser {
  /// Header fields and the offset where the content starts
  fn split(raw: &[u8]) -> Option<(Vec<Header>, usize, usize)> {
    let mut headers: Vec<Header> = Vec::new();
    for (start, end) in lines(raw) {
      let line = trim_eol(&raw[start..end]);
      if line.is_empty() {
        return if headers.is_empty() { None } else { Some((headers, start, end)) };
      }
      if line[0] == b' ' || line[0] == b'\t' {
        let header = headers.last_mut()?;
        header.value_end = start + line.len();
        header.unfolded.push(' ');
        header.unfolded.push_str(String::from_utf8_lossy(line).trim());
        continue;
      }
      let colon = line.iter().position(|b| *b == b':')?;
      if !is_header_name(&line[..colon]) {
        return None;
      }
      let mut value_start = colon + 1;
      while value_start < line.len() && (line[value_start] == b' ' || line[value_start] == b'\t') {
        value_start += 1;
      }
      headers.push(Header {
        name: String::from_utf8_lossy(&line[..colon]).to_ascii_lowercase(),
        value_start: start + value_start,
        value_end: start + line.len(),
        unfolded: String::from_utf8_lossy(&line[value_start..]).trim_end().to_string(),
      });
    }
    None
  }
}

impl ContentParser for MimeParser {
  fn name(&self) -> &str {
    NAME
  }

  fn parse(&self, node: &mut MessageNode, _context: &ParseContext<'_>) -> Result<bool, ParseError> {
    let raw = node.raw().clone();
    let Some((headers, separator, content_start)) = Self::split(&raw) else {
      return Ok(false);
    };
    let mut nested = false;
    if let Some(block) = node.add_slice("mimeHeader", 0, separator) {
      for header in headers {
        let Some(field) = block.add_slice(header.name.as_str(), header.value_start, header.value_end) else {
          continue;
        };
        if header.name == "content-type" {
          match header.unfolded.parse::<Mime>() {
            Ok(media) => {
              nested = media.essence_str() == "message/rfc822";
              field.set_value(NodeValue::Text(media.essence_str().to_string()));
              continue;
            }
            Err(e) => tracing::debug!("[linetap] unusable content type {:?}: {}", header.unfolded, e),
          }
        }
        field.set_value(NodeValue::Text(header.unfolded));
      }
    }
    if let Some(content) = node.add_slice("mimeBody", content_start, raw.len()) {
      if nested {
        content.tag(Capability::BODY);
      }
    }
    node.tag(MIME_MESSAGE);
    Ok(true)
  }
}
