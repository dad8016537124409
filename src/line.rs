//! Byte-at-a-time line editing for an interactive channel.
//!
//! `LineEditor` holds no I/O. Each input byte is turned into the bytes to echo
//! back to the peer and, eventually, a finished line.

const DELETE: u8 = 127;
const CARRIAGE_RETURN: u8 = b'\r';

/// The result of feeding one byte.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
  /// Bytes to write back to the peer.
  pub echo: Vec<u8>,
  /// True once a carriage return terminated the line.
  pub done: bool,
}

#[derive(Debug)]
pub struct LineEditor {
  buffer: Vec<u8>,
  /// Total buffer size. At most `capacity - 2` characters are kept.
  capacity: usize,
}

impl LineEditor {
  pub fn new(capacity: usize) -> Self {
    Self {
      buffer: Vec::new(),
      capacity,
    }
  }

  pub fn feed(&mut self, byte: u8) -> Feed {
    match byte {
      DELETE => {
        // Blank out the line as it was, then redraw the corrected buffer.
        let mut echo = Vec::with_capacity(self.buffer.len() * 2 + 2);
        echo.push(b'\r');
        echo.resize(1 + self.buffer.len(), b' ');
        echo.push(b'\r');
        self.buffer.pop();
        echo.extend_from_slice(&self.buffer);
        Feed { echo, done: false }
      }
      CARRIAGE_RETURN => Feed {
        echo: b"\r\n".to_vec(),
        done: true,
      },
      // Control characters are echoed raw but never buffered.
      0..=31 => Feed {
        echo: vec![byte],
        done: false,
      },
      _ => {
        if self.buffer.len() < self.capacity.saturating_sub(2) {
          self.buffer.push(byte);
        }
        Feed {
          echo: vec![byte],
          done: false,
        }
      }
    }
  }

  pub fn into_string(self) -> String {
    String::from_utf8_lossy(&self.buffer).into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Feed `input` and return (line, concatenated echo, done).
  fn run(capacity: usize, input: &[u8]) -> (String, Vec<u8>, bool) {
    let mut editor = LineEditor::new(capacity);
    let mut echo = Vec::new();
    for &byte in input {
      let feed = editor.feed(byte);
      echo.extend(feed.echo);
      if feed.done {
        return (editor.into_string(), echo, true);
      }
    }
    (editor.into_string(), echo, false)
  }

  #[test]
  fn backspace_redraws_corrected_line() {
    let (line, echo, done) = run(1024, b"ab\x7fc\r");
    assert!(done);
    assert_eq!(line, "ac");
    assert_eq!(echo, b"ab\r  \rac\r\n");
  }

  #[test]
  fn backspace_on_empty_buffer() {
    let (line, echo, _) = run(1024, b"\x7f\r");
    assert_eq!(line, "");
    assert_eq!(echo, b"\r\r\r\n");
  }

  #[test]
  fn control_bytes_are_echoed_but_not_buffered() {
    let (line, echo, done) = run(1024, b"a\x03\x1bb\r");
    assert!(done);
    assert_eq!(line, "ab");
    assert_eq!(echo, b"a\x03\x1bb\r\n");
  }

  #[test]
  fn empty_line() {
    let (line, echo, done) = run(1024, b"\r");
    assert!(done);
    assert_eq!(line, "");
    assert_eq!(echo, b"\r\n");
  }

  #[test]
  fn overlong_input_is_truncated_but_echoed() {
    let (line, echo, _) = run(10, b"yesyesyesyes\r");
    assert_eq!(line, "yesyesye");
    assert_eq!(&echo[..12], b"yesyesyesyes");
  }

  #[test]
  fn unterminated_input_is_not_done() {
    let (line, _, done) = run(1024, b"web");
    assert!(!done);
    assert_eq!(line, "web");
  }
}
