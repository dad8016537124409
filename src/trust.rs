//! Trust-on-first-use store for backend host keys.
//!
//! The store is a plain-text file with one record per line:
//!
//! ```text
//! [10.0.0.5]:2222 ssh-ed25519 SHA256:4EXAMPLEn3aiNWAOeZGUvJxsbCTQaTEJjRMDUw0v8mY
//! ```
//!
//! It is shared by every session. Queries take a shared lock and appends an
//! exclusive one, so a query never sees half of a record.

use crate::error::SessionError;
use crate::terminal::Terminal;
use crate::transport::Endpoint;
use russh::keys::{HashAlg, PublicKey};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// The answer to "do you trust this host?" fits in this many bytes.
const TRUST_ANSWER_CAPACITY: usize = 10;

/// What the store knows about a backend host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
  /// SSH algorithm name, eg `ssh-ed25519`.
  pub algorithm: String,
  /// `SHA256:<base64>`.
  pub fingerprint: String,
}

impl From<&PublicKey> for HostKey {
  fn from(key: &PublicKey) -> Self {
    Self {
      algorithm: key.algorithm().to_string(),
      fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
  Known,
  /// A different key of the same type is on record.
  Changed,
  /// Only keys of other types are on record for this host.
  FoundOtherKeyType,
  FileNotFound,
  Unknown,
  Error(String),
}

/// `host` for the default port, `[host]:port` otherwise.
pub fn host_identity(host: &str, port: u16) -> String {
  let host = host.to_lowercase();
  if port == 22 {
    host
  } else {
    format!("[{host}]:{port}")
  }
}

fn classify(records: &str, identity: &str, key: &HostKey) -> Verification {
  let mut changed = false;
  let mut other_type = false;
  for (number, line) in records.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let mut fields = line.split_whitespace();
    let (Some(host), Some(algorithm), Some(fingerprint)) = (fields.next(), fields.next(), fields.next()) else {
      tracing::warn!(line = number + 1, "skipping malformed trust record");
      continue;
    };
    if host != identity {
      continue;
    }
    if algorithm != key.algorithm {
      other_type = true;
    } else if fingerprint == key.fingerprint {
      return Verification::Known;
    } else {
      changed = true;
    }
  }
  if changed {
    Verification::Changed
  } else if other_type {
    Verification::FoundOtherKeyType
  } else {
    Verification::Unknown
  }
}

#[derive(Debug)]
pub struct TrustStore {
  path: PathBuf,
  lock: RwLock<()>,
}

impl TrustStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: RwLock::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  async fn read(&self) -> io::Result<Option<String>> {
    match tokio::fs::read_to_string(&self.path).await {
      Ok(records) => Ok(Some(records)),
      Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(error) => Err(error),
    }
  }

  #[tracing::instrument(level = "debug", skip(self))]
  pub async fn verify(&self, identity: &str, key: &HostKey) -> Verification {
    let _guard = self.lock.read().await;
    match self.read().await {
      Ok(Some(records)) => classify(&records, identity, key),
      Ok(None) => Verification::FileNotFound,
      Err(error) => Verification::Error(error.to_string()),
    }
  }

  /// Record `key` for `identity`. Does nothing if the exact key is already on
  /// record, which happens when two sessions approve the same new host at
  /// once. Refuses if a conflicting key was recorded in the meantime.
  #[tracing::instrument(level = "debug", skip(self))]
  pub async fn learn(&self, identity: &str, key: &HostKey) -> io::Result<()> {
    let _guard = self.lock.write().await;
    let records = self.read().await?;
    let mut record = String::new();
    if let Some(records) = &records {
      match classify(records, identity, key) {
        Verification::Known => return Ok(()),
        Verification::Unknown => {}
        _ => {
          return Err(io::Error::other(format!(
            "another host key was recorded for {identity} in the meantime"
          )))
        }
      }
      if !records.is_empty() && !records.ends_with('\n') {
        record.push('\n');
      }
    } else if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent).await?;
      }
    }
    record.push_str(&format!("{identity} {} {}\n", key.algorithm, key.fingerprint));

    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await?;
    file.write_all(record.as_bytes()).await?;
    file.flush().await?;
    tracing::info!(identity, fingerprint = %key.fingerprint, "host key recorded");
    Ok(())
  }
}

fn is_yes(answer: &str) -> bool {
  answer.len() >= 3 && answer.as_bytes()[..3].eq_ignore_ascii_case(b"yes")
}

/// Check a backend host key against the store, asking the user on the
/// client's error stream when the host is new. Returns `Ok` only when the key
/// is known or the user approved it and it was recorded.
pub async fn verify_host<E: Endpoint>(
  terminal: &mut Terminal<E>,
  store: &TrustStore,
  identity: &str,
  key: &HostKey,
) -> Result<(), SessionError> {
  match store.verify(identity, key).await {
    Verification::Known => Ok(()),
    Verification::Changed => {
      tracing::warn!(identity, fingerprint = %key.fingerprint, "backend host key changed");
      terminal
        .write_error(&format!(
          "Host key for server changed: it is now: {}\r\n\
           For security reasons, connection will be stopped\r\n",
          key.fingerprint
        ))
        .await?;
      Err(SessionError::TrustViolation(format!("host key for {identity} changed")))
    }
    Verification::FoundOtherKeyType => {
      tracing::warn!(identity, algorithm = %key.algorithm, "backend presented a key of another type");
      terminal
        .write_error(
          "The host key for this server was not found but an other type of key exists.\r\n\
           An attacker might change the default server key to confuse your client into thinking the key does not exist\r\n",
        )
        .await?;
      Err(SessionError::TrustViolation(format!(
        "{identity} is on record with another key type"
      )))
    }
    Verification::FileNotFound => {
      terminal
        .write_error(
          "Could not find known host file.\r\n\
           If you accept the host key here, the file will be automatically created.\r\n",
        )
        .await?;
      confirm(terminal, store, identity, key).await
    }
    Verification::Unknown => confirm(terminal, store, identity, key).await,
    Verification::Error(error) => {
      terminal.write_error(&format!("Error {error}\r\n")).await?;
      Err(SessionError::TrustViolation(error))
    }
  }
}

async fn confirm<E: Endpoint>(
  terminal: &mut Terminal<E>,
  store: &TrustStore,
  identity: &str,
  key: &HostKey,
) -> Result<(), SessionError> {
  terminal
    .write_error(&format!(
      "The server is unknown. Do you trust the host key?\r\nPublic key hash: {}\r\n",
      key.fingerprint
    ))
    .await?;
  let answer = terminal.read_line(TRUST_ANSWER_CAPACITY).await?;
  if !answer.terminated || !is_yes(&answer.text) {
    tracing::info!(identity, "user declined backend host key");
    return Err(SessionError::TrustDeclined);
  }
  if let Err(error) = store.learn(identity, key).await {
    terminal.write_error(&format!("Error {error}\r\n")).await?;
    return Err(SessionError::Io(error));
  }
  Ok(())
}
