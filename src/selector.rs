use crate::directory::{Directory, Target};
use crate::error::SessionError;
use crate::terminal::Terminal;
use crate::transport::Endpoint;
use std::time::{Duration, Instant};

pub const WELCOME: &str = "welcome to spatch\r\n";
pub const SELECT: &str = "select an endpoint\r\n";
pub const NO_ENDPOINT: &str = "no valid endpoint\r\n";
pub const EXIT: &str = "exit";

const MENU_LINE_CAPACITY: usize = 1024;
const STATUS_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, PartialEq, Eq)]
pub enum Selection {
  Connect(Target),
  /// The user typed `exit`.
  Exit,
  /// The client went away at the menu.
  Closed,
}

/// Show `username` the backends it may reach and loop until it picks one,
/// types `exit`, or closes the channel. A user without grants gets the
/// "no valid endpoint" message and `NoAuthorizedBackend`.
#[tracing::instrument(level = "debug", skip(terminal, directory))]
pub async fn choose<E: Endpoint>(
  terminal: &mut Terminal<E>,
  directory: &Directory,
  username: &str,
) -> Result<Selection, SessionError> {
  terminal.write(WELCOME).await?;
  let mut next_status = Instant::now();
  loop {
    if Instant::now() >= next_status {
      tracing::info!("{username} is connected to spatch");
      next_status = Instant::now() + STATUS_INTERVAL;
    }

    terminal.write(SELECT).await?;
    let backends = directory.allowed_backends(username);
    if backends.is_empty() {
      terminal.write(NO_ENDPOINT).await?;
      return Err(SessionError::NoAuthorizedBackend);
    }
    let mut menu = String::new();
    for backend in backends {
      menu.push_str(&backend.address);
      menu.push_str("\r\n");
    }
    menu.push_str(EXIT);
    menu.push_str("\r\n");
    terminal.write(&menu).await?;

    let line = terminal.read_line(MENU_LINE_CAPACITY).await?;
    if !line.terminated {
      return Ok(Selection::Closed);
    }
    if let Some(target) = directory.resolve(username, &line.text) {
      return Ok(Selection::Connect(target));
    }
    if line.text == EXIT {
      return Ok(Selection::Exit);
    }
    tracing::debug!(answer = %line.text, "no backend matches menu answer");
  }
}
