use crate::error::SessionError;
use crate::transport::{Endpoint, Frame};
use std::time::Duration;

const STATUS_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
  ClientClosed,
  BackendClosed,
}

/// Pump bytes between `client` and `backend` until either side sends EOF or
/// closes. Data and error streams are forwarded to the same stream on the
/// other side. Order is kept per direction; the two directions interleave
/// freely.
///
/// `label` only feeds the heartbeat status line.
pub async fn relay<C, B>(client: &mut C, backend: &mut B, label: &str) -> Result<RelayEnd, SessionError>
where
  C: Endpoint,
  B: Endpoint,
{
  let mut heartbeat = tokio::time::interval(STATUS_INTERVAL);
  heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      frame = client.recv() => match frame {
        Frame::Data(data) => backend.send(&data).await?,
        Frame::Stderr(data) => backend.send_stderr(&data).await?,
        Frame::Eof | Frame::Closed => return Ok(RelayEnd::ClientClosed),
      },
      frame = backend.recv() => match frame {
        Frame::Data(data) => client.send(&data).await?,
        Frame::Stderr(data) => client.send_stderr(&data).await?,
        Frame::Eof | Frame::Closed => return Ok(RelayEnd::BackendClosed),
      },
      _ = heartbeat.tick() => {
        tracing::info!("{label}");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::testing::{endpoint, Remote, Written};

  /// Collect `len` bytes of one stream from `remote`'s captured writes.
  async fn collect(remote: &mut Remote, len: usize, stderr: bool) -> Vec<u8> {
    let mut bytes = Vec::new();
    while bytes.len() < len {
      match remote.written.recv().await.unwrap() {
        Written::Stdout(data) if !stderr => bytes.extend(data),
        Written::Stderr(data) if stderr => bytes.extend(data),
        other => panic!("unexpected write {other:?}"),
      }
    }
    bytes
  }

  #[tokio::test]
  async fn forwards_both_directions_in_order() {
    let (mut client, mut client_remote) = endpoint();
    let (mut backend, mut backend_remote) = endpoint();
    let task = tokio::spawn(async move {
      let end = relay(&mut client, &mut backend, "alice is connected to shell on web").await;
      (end, client, backend)
    });

    let upstream: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    for chunk in upstream.chunks(100) {
      client_remote.type_bytes(chunk);
    }
    assert_eq!(collect(&mut backend_remote, upstream.len(), false).await, upstream);

    backend_remote.type_bytes(b"alice@web:~$ ");
    backend_remote.input.send(Frame::Stderr(b"bash: warning\r\n".to_vec())).unwrap();
    assert_eq!(collect(&mut client_remote, 13, false).await, b"alice@web:~$ ");
    assert_eq!(collect(&mut client_remote, 15, true).await, b"bash: warning\r\n");

    client_remote.input.send(Frame::Stderr(b"e".to_vec())).unwrap();
    assert_eq!(collect(&mut backend_remote, 1, true).await, b"e");

    client_remote.input.send(Frame::Eof).unwrap();
    let (end, _, _) = task.await.unwrap();
    assert_eq!(end.unwrap(), RelayEnd::ClientClosed);
  }

  #[tokio::test]
  async fn backend_close_ends_relay_promptly() {
    let (mut client, _client_remote) = endpoint();
    let (mut backend, backend_remote) = endpoint();
    drop(backend_remote.input);
    let end = tokio::time::timeout(Duration::from_millis(100), relay(&mut client, &mut backend, "status"))
      .await
      .expect("relay should stop as soon as the backend closes");
    assert_eq!(end.unwrap(), RelayEnd::BackendClosed);
  }

  #[tokio::test]
  async fn write_failure_ends_relay_with_error() {
    let (mut client, client_remote) = endpoint();
    let (mut backend, backend_remote) = endpoint();
    // Nobody is listening on the backend side any more.
    drop(backend_remote.written);
    client_remote.type_bytes(b"ls\r");
    let result = relay(&mut client, &mut backend, "status").await;
    assert!(matches!(result, Err(SessionError::Io(_))));
    drop(backend_remote.input);
  }
}
