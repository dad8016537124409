use crate::error::SessionError;
use async_trait::async_trait;
use russh::{Channel, ChannelId, ChannelMsg};

/// RFC 4254 extended data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// One inbound event on a channel, as far as the gateway cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  Data(Vec<u8>),
  Stderr(Vec<u8>),
  Eof,
  Closed,
}

/// The operations the gateway needs from either end of a relayed session:
/// the client channel on the gateway side and the shell channel on the
/// backend side.
#[async_trait]
pub trait Endpoint: Send {
  /// Wait for the next frame. `Eof` and `Closed` both mean the peer is done
  /// sending.
  async fn recv(&mut self) -> Frame;

  async fn send(&mut self, data: &[u8]) -> Result<(), SessionError>;

  async fn send_stderr(&mut self, data: &[u8]) -> Result<(), SessionError>;

  async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
impl<S> Endpoint for Channel<S>
where
  S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
  async fn recv(&mut self) -> Frame {
    loop {
      match self.wait().await {
        Some(ChannelMsg::Data { data }) => return Frame::Data(data.to_vec()),
        Some(ChannelMsg::ExtendedData { data, ext }) => {
          if ext == SSH_EXTENDED_DATA_STDERR {
            return Frame::Stderr(data.to_vec());
          }
          tracing::debug!(ext, "dropping extended data of unknown type");
        }
        Some(ChannelMsg::Eof) => return Frame::Eof,
        Some(ChannelMsg::Close) | None => return Frame::Closed,
        Some(ChannelMsg::ExitStatus { exit_status }) => {
          tracing::debug!(exit_status, "channel exit status");
        }
        Some(msg) => {
          tracing::trace!(?msg, "ignoring channel message");
        }
      }
    }
  }

  async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
    self.data(data).await?;
    Ok(())
  }

  async fn send_stderr(&mut self, data: &[u8]) -> Result<(), SessionError> {
    self.extended_data(SSH_EXTENDED_DATA_STDERR, data).await?;
    Ok(())
  }

  async fn close(&mut self) -> Result<(), SessionError> {
    // The peer may already be gone; closing twice is not an error for us.
    if let Err(error) = self.eof().await {
      tracing::debug!(?error, "sending eof failed");
    }
    Channel::close(self).await?;
    Ok(())
  }
}
