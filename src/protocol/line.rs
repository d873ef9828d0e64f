//! Line helpers shared by the text protocols

/// End of a dot-terminated block
pub(crate) const DOT_TERMINATOR: &[u8] = b"\r\n.\r\n";

/// Index just past the first `\n` at or after `from`
pub(crate) fn line_end(buffer: &[u8], from: usize) -> Option<usize> {
  buffer
    .get(from..)?
    .iter()
    .position(|b| *b == b'\n')
    .map(|at| from + at + 1)
}

/// Index just past the last `\n` in `buffer`, `0` without one
pub(crate) fn complete_lines_end(buffer: &[u8]) -> usize {
  buffer.iter().rposition(|b| *b == b'\n').map_or(0, |at| at + 1)
}

/// Length of the line ending at the end of `line` (`\r\n`, `\n` or none)
pub(crate) fn eol_len(line: &[u8]) -> usize {
  if line.ends_with(b"\r\n") {
    2
  } else if line.ends_with(b"\n") {
    1
  } else {
    0
  }
}

/// `line` without its line ending
pub(crate) fn trim_eol(line: &[u8]) -> &[u8] {
  &line[..line.len() - eol_len(line)]
}

/// Start and end of every line in `buffer`, ends including the line ending
pub(crate) fn lines(buffer: &[u8]) -> Vec<(usize, usize)> {
  let mut out = Vec::new();
  let mut start = 0;
  while start < buffer.len() {
    let end = line_end(buffer, start).unwrap_or(buffer.len());
    out.push((start, end));
    start = end;
  }
  out
}

/// End of the first line at or after `from` that is a lone `.`
pub(crate) fn dot_line_end(buffer: &[u8], from: usize) -> Option<usize> {
  let mut start = from;
  while let Some(end) = line_end(buffer, start) {
    if trim_eol(&buffer[start..end]) == b"." {
      return Some(end);
    }
    start = end;
  }
  None
}

/// Remove transparency dots: a leading `..` on a line becomes `.`
pub(crate) fn unstuff(body: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(body.len());
  for (start, end) in lines(body) {
    let line = &body[start..end];
    if line.starts_with(b"..") {
      out.extend_from_slice(&line[1..]);
    } else {
      out.extend_from_slice(line);
    }
  }
  out
}

/// Split the first word off `line`: (word end, argument start)
///
/// The argument start equals `line.len()` when nothing follows the word.
pub(crate) fn split_word(line: &[u8]) -> (usize, usize) {
  let word_end = line.iter().position(|b| *b == b' ').unwrap_or(line.len());
  let mut args = word_end;
  while args < line.len() && line[args] == b' ' {
    args += 1;
  }
  (word_end, args)
}
