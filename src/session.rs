use crate::directory::Directory;
use crate::error::SessionError;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use std::sync::Arc;
use tokio::sync::oneshot;

pub const PASSWORD_ATTEMPTS: u32 = 3;

/// What the authenticator hands to the supervisor once the client is logged
/// in and has a shell channel.
pub struct Ready {
  pub username: String,
  pub channel: Channel<Msg>,
}

/// Drives one inbound connection from key exchange up to a granted shell.
///
/// SSH flow for an interactive login (eg `ssh alice@gateway`):
/// 1. auth_password, up to `PASSWORD_ATTEMPTS` times
/// 2. channel_open_session
/// 3. pty_request and/or shell_request
///
/// As soon as all three have happened the channel is handed over through
/// `ready` and the handler only answers the requests that keep arriving on
/// it: resizes are refused, signals are logged.
pub struct GatewayHandler {
  tracing_span: tracing::Span,

  directory: Arc<Directory>,

  attempts_left: u32,

  /// Only `Some` after a successful authentication.
  username: Option<String>,

  /// The client channel, between `channel_open_session` and the handoff.
  channel: Option<Channel<Msg>>,

  /// Set once a channel has been accepted. A session gets exactly one.
  channel_accepted: bool,

  shell_granted: bool,

  ready: Option<oneshot::Sender<Ready>>,
}

impl GatewayHandler {
  pub fn new(tracing_span: tracing::Span, directory: Arc<Directory>, ready: oneshot::Sender<Ready>) -> Self {
    Self {
      tracing_span,
      directory,
      attempts_left: PASSWORD_ATTEMPTS,
      username: None,
      channel: None,
      channel_accepted: false,
      shell_granted: false,
      ready: Some(ready),
    }
  }

  fn reject() -> Auth {
    Auth::Reject {
      proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
      partial_success: false,
    }
  }

  /// Hand the channel over once authenticated, channel-open and
  /// shell-granted all hold.
  fn handoff(&mut self) {
    if !self.shell_granted {
      return;
    }
    let Some(username) = self.username.clone() else {
      return;
    };
    let Some(channel) = self.channel.take() else {
      return;
    };
    if let Some(ready) = self.ready.take() {
      tracing::info!(%username, "session ready");
      if ready.send(Ready { username, channel }).is_err() {
        tracing::debug!("supervisor went away before handoff");
      }
    }
  }
}

impl russh::server::Handler for GatewayHandler {
  type Error = SessionError;

  // NOTE: we don't log `password`.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, password))]
  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    if let Some(gateway_user) = self.directory.authenticate(user, password) {
      tracing::info!("password accepted");
      self.username = Some(gateway_user.username.clone());
      return Ok(Auth::Accept);
    }
    self.attempts_left = self.attempts_left.saturating_sub(1);
    tracing::info!(attempts_left = self.attempts_left, "password rejected");
    if self.attempts_left == 0 {
      return Err(SessionError::AuthExhausted);
    }
    Ok(Self::reject())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self))]
  async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
    Ok(Self::reject())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, channel, _session))]
  async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
    if self.username.is_none() || self.channel_accepted {
      tracing::warn!("refusing session channel");
      return Ok(false);
    }
    self.channel_accepted = true;
    self.channel = Some(channel);
    self.handoff();
    Ok(true)
  }

  // The client's terminal settings are irrelevant: the backend pty has a
  // fixed size.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, session, _modes))]
  async fn pty_request(
    &mut self,
    channel: ChannelId,
    term: &str,
    col_width: u32,
    row_height: u32,
    _pix_width: u32,
    _pix_height: u32,
    _modes: &[(Pty, u32)],
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.shell_granted = true;
    session.channel_success(channel)?;
    self.handoff();
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    self.shell_granted = true;
    session.channel_success(channel)?;
    self.handoff();
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, command, session))]
  async fn exec_request(&mut self, channel: ChannelId, command: &[u8], session: &mut Session) -> Result<(), Self::Error> {
    tracing::warn!(command = ?String::from_utf8_lossy(command), "exec requests are not supported");
    session.channel_failure(channel)?;
    Err(SessionError::ChannelSetupFailed("channel type not supported".into()))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn subsystem_request(&mut self, channel: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
    tracing::warn!("subsystems are not supported");
    session.channel_failure(channel)?;
    Err(SessionError::ChannelSetupFailed("channel type not supported".into()))
  }

  /// Resizes are never applied to the backend, whose size is fixed.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn window_change_request(
    &mut self,
    channel: ChannelId,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    tracing::info!("rejecting resize");
    session.channel_failure(channel)?;
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn signal(&mut self, channel: ChannelId, signal: Sig, _session: &mut Session) -> Result<(), Self::Error> {
    tracing::info!(?signal, "signal from client not forwarded");
    Ok(())
  }
}
