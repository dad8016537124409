use crate::connector::{BackendLink, Connector};
use crate::directory::{Directory, Target};
use crate::error::SessionError;
use crate::relay::relay;
use crate::selector::{choose, Selection};
use crate::session::{GatewayHandler, Ready};
use crate::terminal::Terminal;
use crate::transport::{Endpoint, Frame};
use crate::trust::TrustStore;
use russh::server::{self, Msg};
use russh::{Channel, Disconnect};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_MESSAGE: &str = "gateway shutting down";

/// Everything a session needs from the process. Shared by all sessions; the
/// directory is read-only and the trust store serializes its own writes.
pub struct Gateway {
  pub directory: Arc<Directory>,
  pub trust: TrustStore,
  pub server_config: Arc<server::Config>,
  pub connector: Connector,
  /// Flips to `true` once when the gateway is asked to stop.
  pub shutdown: watch::Receiver<bool>,
}

/// The only thing the listener learns about a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
  pub ok: bool,
  pub reason: String,
}

impl SessionResult {
  fn finished(reason: &str) -> Self {
    Self {
      ok: true,
      reason: reason.to_owned(),
    }
  }

  fn failed(error: SessionError) -> Self {
    Self {
      ok: error.is_clean(),
      reason: error.to_string(),
    }
  }
}

impl From<Result<&'static str, SessionError>> for SessionResult {
  fn from(outcome: Result<&'static str, SessionError>) -> Self {
    match outcome {
      Ok(reason) => Self::finished(reason),
      Err(error) => Self::failed(error),
    }
  }
}

/// Run one inbound connection from key exchange to teardown. Never panics on
/// session failures and never touches state belonging to other sessions.
pub async fn start_session<S>(gateway: Arc<Gateway>, stream: S, peer: Option<SocketAddr>) -> SessionResult
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let session_id = Uuid::new_v4();
  let span = tracing::info_span!("connection", %session_id, ?peer);
  supervise(gateway, stream, span.clone()).instrument(span).await
}

async fn supervise<S>(gateway: Arc<Gateway>, stream: S, span: tracing::Span) -> SessionResult
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let mut shutdown = gateway.shutdown.clone();
  let (ready_tx, ready_rx) = oneshot::channel();
  let handler = GatewayHandler::new(span, gateway.directory.clone(), ready_tx);

  let mut running = match server::run_stream(gateway.server_config.clone(), stream, handler).await {
    Ok(running) => running,
    Err(error) => {
      tracing::warn!(?error, "ssh handshake failed");
      return SessionResult::failed(error);
    }
  };
  let handle = running.handle();

  // Until the handler hands over a shell channel the connection is russh's
  // alone: key exchange, authentication and channel negotiation.
  let ready = tokio::select! {
    ready = ready_rx => ready,
    ended = &mut running => {
      return match ended {
        Ok(()) => SessionResult::finished("client left before opening a shell"),
        Err(error) => SessionResult::failed(error),
      };
    }
    _ = shutting_down(&mut shutdown) => {
      disconnect(&handle, SHUTDOWN_MESSAGE).await;
      finish(running).await;
      return SessionResult::failed(SessionError::Shutdown);
    }
  };
  let Ok(Ready { username, channel }) = ready else {
    // The handler is gone without handing anything over.
    return match running.await {
      Ok(()) => SessionResult::finished("client left before opening a shell"),
      Err(error) => SessionResult::failed(error),
    };
  };

  // A client that drops the whole connection ends the session here even if
  // the backend is stuck and the relay never notices.
  let mut ended = None;
  let outcome = tokio::select! {
    outcome = serve(&gateway, channel, &username) => outcome,
    result = &mut running => {
      ended = Some(result);
      Ok("client disconnected")
    }
    _ = shutting_down(&mut shutdown) => Err(SessionError::Shutdown),
  };
  tracing::info!("{username} disconnected");

  match ended {
    None => {
      let description = match &outcome {
        Err(SessionError::Shutdown) => SHUTDOWN_MESSAGE,
        _ => "",
      };
      disconnect(&handle, description).await;
      finish(running).await;
    }
    Some(Err(error)) => tracing::debug!(?error, "ssh session ended with error"),
    Some(Ok(())) => {}
  }
  outcome.into()
}

/// Menu, backend connection and relay for an authenticated user. The client
/// channel is closed on every path out of here.
async fn serve(gateway: &Gateway, channel: Channel<Msg>, username: &str) -> Result<&'static str, SessionError> {
  let mut terminal = Terminal::new(channel);
  let selected = select_backend(gateway, &mut terminal, username).await;
  let (mut client, typed_ahead) = terminal.into_parts();

  let outcome = match selected {
    Ok(Some((target, link))) => bridge(&mut client, link, &typed_ahead, username, &target).await,
    Ok(None) => Ok("user left the menu"),
    Err(error) => Err(error),
  };
  if let Err(error) = Endpoint::close(&mut client).await {
    tracing::debug!(?error, "closing client channel failed");
  }
  outcome
}

async fn select_backend<E: Endpoint>(
  gateway: &Gateway,
  terminal: &mut Terminal<E>,
  username: &str,
) -> Result<Option<(Target, BackendLink)>, SessionError> {
  let target = match choose(terminal, &gateway.directory, username).await? {
    Selection::Connect(target) => target,
    Selection::Exit | Selection::Closed => return Ok(None),
  };
  let link = gateway
    .connector
    .connect(terminal, &gateway.trust, &target, username)
    .await?;
  Ok(Some((target, link)))
}

async fn bridge(
  client: &mut Channel<Msg>,
  mut link: BackendLink,
  typed_ahead: &[u8],
  username: &str,
  target: &Target,
) -> Result<&'static str, SessionError> {
  let host = &target.backend.host;
  let label = format!("{username} is connected to shell on {host}");
  let early = std::mem::take(&mut link.early);
  let outcome = forward(client, &mut link.channel, &early, typed_ahead, &label).await;
  tracing::info!("{username} is disconnected from {host}");
  link.shutdown().await;
  outcome
}

/// Relay after handing over what each side sent before the relay existed:
/// `early` backend output to the client, `typed_ahead` input to the backend.
async fn forward<C: Endpoint, B: Endpoint>(
  client: &mut C,
  backend: &mut B,
  early: &[Frame],
  typed_ahead: &[u8],
  label: &str,
) -> Result<&'static str, SessionError> {
  for frame in early {
    match frame {
      Frame::Data(data) => client.send(data).await?,
      Frame::Stderr(data) => client.send_stderr(data).await?,
      Frame::Eof | Frame::Closed => {}
    }
  }
  if !typed_ahead.is_empty() {
    backend.send(typed_ahead).await?;
  }
  let end = relay(client, backend, label).await?;
  tracing::debug!(?end, "relay finished");
  Ok("relay finished")
}

/// Resolves once shutdown is requested. A gateway whose sender is gone can no
/// longer be shut down this way, so that case never resolves.
async fn shutting_down(shutdown: &mut watch::Receiver<bool>) {
  if shutdown.wait_for(|stop| *stop).await.is_err() {
    std::future::pending::<()>().await;
  }
}

async fn disconnect(handle: &server::Handle, description: &str) {
  if let Err(error) = handle
    .disconnect(Disconnect::ByApplication, description.to_owned(), "en".to_owned())
    .await
  {
    tracing::debug!(?error, "disconnecting client failed");
  }
}

async fn finish(running: server::RunningSession<GatewayHandler>) {
  match tokio::time::timeout(TEARDOWN_TIMEOUT, running).await {
    Ok(Ok(())) => {}
    Ok(Err(error)) => tracing::debug!(?error, "ssh session ended with error"),
    Err(_) => tracing::warn!("ssh session did not finish within {TEARDOWN_TIMEOUT:?}"),
  }
}
