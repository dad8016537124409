use thiserror::Error;

/// Everything that can end a session. Nothing here ever reaches the listener
/// except as the `reason` of a `SessionResult`.
#[derive(Error, Debug)]
pub enum SessionError {
  /// The password retry budget hit zero. No channel was opened and no backend
  /// was contacted.
  #[error("authentication attempts exhausted")]
  AuthExhausted,

  /// Channel open / pty / shell negotiation on the gateway side failed.
  #[error("channel setup failed: {0}")]
  ChannelSetupFailed(String),

  #[error("no authorized backend")]
  NoAuthorizedBackend,

  #[error("backend connection failed: {0}")]
  BackendConnectFailed(String),

  /// Changed, other-type or unverifiable backend host key.
  #[error("host key verification failed: {0}")]
  TrustViolation(String),

  #[error("host key not trusted by user")]
  TrustDeclined,

  #[error("i/o failure: {0}")]
  Io(#[from] std::io::Error),

  #[error("transport error: {0}")]
  Transport(#[from] russh::Error),

  #[error("gateway shutting down")]
  Shutdown,
}

impl SessionError {
  /// Outcomes that end the session normally rather than as a failure.
  pub fn is_clean(&self) -> bool {
    matches!(
      self,
      SessionError::NoAuthorizedBackend | SessionError::TrustDeclined | SessionError::Shutdown
    )
  }
}
