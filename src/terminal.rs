use crate::error::SessionError;
use crate::line::LineEditor;
use crate::transport::{Endpoint, Frame};
use std::collections::VecDeque;

/// A line read from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
  pub text: String,
  /// False when the channel ended before a carriage return. Callers treat an
  /// unterminated line as "no answer".
  pub terminated: bool,
}

/// Text-mode view of the client channel used before the relay starts: menu
/// output, prompts, and line input with echo.
pub struct Terminal<E> {
  endpoint: E,
  /// Bytes received but not consumed by `read_line` yet.
  pending: VecDeque<u8>,
  closed: bool,
}

impl<E: Endpoint> Terminal<E> {
  pub fn new(endpoint: E) -> Self {
    Self {
      endpoint,
      pending: VecDeque::new(),
      closed: false,
    }
  }

  pub async fn write(&mut self, text: &str) -> Result<(), SessionError> {
    self.endpoint.send(text.as_bytes()).await
  }

  pub async fn write_error(&mut self, text: &str) -> Result<(), SessionError> {
    self.endpoint.send_stderr(text.as_bytes()).await
  }

  /// True once the client has sent EOF or closed the channel.
  pub fn is_closed(&self) -> bool {
    self.closed
  }

  /// Read one line, echoing as the user types. Echo is flushed every time
  /// the buffered input runs out, so the user sees each keystroke.
  pub async fn read_line(&mut self, capacity: usize) -> Result<Line, SessionError> {
    let mut editor = LineEditor::new(capacity);
    let mut echo = Vec::new();
    loop {
      while let Some(byte) = self.pending.pop_front() {
        let feed = editor.feed(byte);
        echo.extend(feed.echo);
        if feed.done {
          self.endpoint.send(&echo).await?;
          return Ok(Line {
            text: editor.into_string(),
            terminated: true,
          });
        }
      }
      if !echo.is_empty() {
        self.endpoint.send(&echo).await?;
        echo.clear();
      }
      if self.closed {
        return Ok(Line {
          text: editor.into_string(),
          terminated: false,
        });
      }
      match self.endpoint.recv().await {
        Frame::Data(data) => self.pending.extend(data),
        Frame::Stderr(_) => {}
        Frame::Eof | Frame::Closed => self.closed = true,
      }
    }
  }

  /// Give back the channel together with any bytes typed ahead of the last
  /// prompt.
  pub fn into_parts(self) -> (E, Vec<u8>) {
    (self.endpoint, self.pending.into_iter().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::testing::endpoint;

  #[tokio::test]
  async fn reads_line_across_frames() {
    let (client, mut remote) = endpoint();
    let mut terminal = Terminal::new(client);
    remote.type_bytes(b"we");
    remote.type_bytes(b"b\r");
    let line = terminal.read_line(1024).await.unwrap();
    assert_eq!(line.text, "web");
    assert!(line.terminated);
    assert_eq!(remote.stdout_text(), "web\r\n");
  }

  #[tokio::test]
  async fn keeps_typed_ahead_bytes() {
    let (client, mut remote) = endpoint();
    let mut terminal = Terminal::new(client);
    remote.type_bytes(b"yes\rls -la\r");
    let line = terminal.read_line(10).await.unwrap();
    assert_eq!(line.text, "yes");
    let (_, typed_ahead) = terminal.into_parts();
    assert_eq!(typed_ahead, b"ls -la\r");
    assert_eq!(remote.stdout_text(), "yes\r\n");
  }

  #[tokio::test]
  async fn eof_returns_unterminated_line() {
    let (client, remote) = endpoint();
    let mut terminal = Terminal::new(client);
    remote.type_bytes(b"ye");
    remote.input.send(Frame::Eof).unwrap();
    let line = terminal.read_line(10).await.unwrap();
    assert_eq!(line.text, "ye");
    assert!(!line.terminated);
    assert!(terminal.is_closed());
  }

  #[tokio::test]
  async fn dropped_channel_counts_as_closed() {
    let (client, remote) = endpoint();
    let mut terminal = Terminal::new(client);
    drop(remote.input);
    let line = terminal.read_line(1024).await.unwrap();
    assert_eq!(line.text, "");
    assert!(!line.terminated);
  }
}
