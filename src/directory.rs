//! The credential directory: who may log in to the gateway, which backends
//! they may reach, and with which upstream credentials.
//!
//! The directory is loaded once at startup and is read-only afterwards. Every
//! session gets it through an `Arc`.

use crate::selector::EXIT;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
  #[error("failed to read directory file: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to parse directory file: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("user {0:?} is declared more than once")]
  DuplicateUser(String),

  #[error("backend {0:?} is declared more than once")]
  DuplicateBackend(String),

  /// Empty, containing whitespace or control characters, or the menu's own
  /// `exit` entry.
  #[error("backend address {0:?} cannot be typed at the menu")]
  InvalidAddress(String),

  #[error("user {user:?} has a grant for unknown backend {backend:?}")]
  UnknownBackend { user: String, backend: String },

  #[error("user {user:?} has more than one grant for backend {backend:?}")]
  DuplicateGrant { user: String, backend: String },
}

/// An upstream SSH server reachable through the gateway.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Backend {
  /// The name shown in the menu and typed by the user to select this backend.
  /// Never the real address.
  pub address: String,
  /// The real host to connect to.
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
}

fn default_port() -> u16 {
  22
}

/// Authorizes one gateway user to reach one backend with specific upstream
/// credentials.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Grant {
  /// The `address` of the backend this grant is for.
  pub backend: String,
  /// Username on the backend.
  pub username: String,
  /// Password on the backend.
  pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GatewayUser {
  pub username: String,
  pub password: String,
  #[serde(default)]
  pub grants: Vec<Grant>,
}

impl GatewayUser {
  pub fn grant_for(&self, backend: &str) -> Option<&Grant> {
    self.grants.iter().find(|grant| grant.backend == backend)
  }
}

#[derive(Deserialize)]
struct DirectoryFile {
  backends: Vec<Backend>,
  users: Vec<GatewayUser>,
}

/// A backend the gateway has resolved for one user, together with that
/// user's credentials for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  pub backend: Backend,
  pub username: String,
  pub password: String,
}

#[derive(Debug)]
pub struct Directory {
  /// In declaration order. The menu lists backends in this order.
  backends: Vec<Backend>,
  users: Vec<GatewayUser>,
}

fn is_menu_entry(address: &str) -> bool {
  !address.is_empty() && address != EXIT && !address.chars().any(|c| c.is_whitespace() || c.is_control())
}

impl Directory {
  pub fn new(backends: Vec<Backend>, users: Vec<GatewayUser>) -> Result<Self, DirectoryError> {
    let mut addresses = HashSet::new();
    for backend in &backends {
      if !is_menu_entry(&backend.address) {
        return Err(DirectoryError::InvalidAddress(backend.address.clone()));
      }
      if !addresses.insert(backend.address.as_str()) {
        return Err(DirectoryError::DuplicateBackend(backend.address.clone()));
      }
    }

    let mut usernames = HashSet::new();
    for user in &users {
      if !usernames.insert(user.username.as_str()) {
        return Err(DirectoryError::DuplicateUser(user.username.clone()));
      }
      let mut granted = HashSet::new();
      for grant in &user.grants {
        if !addresses.contains(grant.backend.as_str()) {
          return Err(DirectoryError::UnknownBackend {
            user: user.username.clone(),
            backend: grant.backend.clone(),
          });
        }
        if !granted.insert(grant.backend.as_str()) {
          return Err(DirectoryError::DuplicateGrant {
            user: user.username.clone(),
            backend: grant.backend.clone(),
          });
        }
      }
    }

    Ok(Self { backends, users })
  }

  pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
    let file: DirectoryFile = serde_json::from_str(json)?;
    Self::new(file.backends, file.users)
  }

  #[tracing::instrument(level = "debug")]
  pub fn load(path: &Path) -> Result<Self, DirectoryError> {
    let json = std::fs::read_to_string(path)?;
    let directory = Self::from_json(&json)?;
    tracing::debug!(
      backends = directory.backends.len(),
      users = directory.users.len(),
      "directory loaded"
    );
    Ok(directory)
  }

  /// Look up a gateway user by username and password.
  // NOTE: nothing here is logged since `password` is a secret.
  pub fn authenticate(&self, username: &str, password: &str) -> Option<&GatewayUser> {
    self
      .users
      .iter()
      .find(|user| user.username == username && user.password == password)
  }

  pub fn user(&self, username: &str) -> Option<&GatewayUser> {
    self.users.iter().find(|user| user.username == username)
  }

  /// Backends `username` holds a grant for, in declaration order.
  pub fn allowed_backends(&self, username: &str) -> Vec<&Backend> {
    let Some(user) = self.user(username) else {
      return Vec::new();
    };
    self
      .backends
      .iter()
      .filter(|backend| user.grant_for(&backend.address).is_some())
      .collect()
  }

  /// Match a menu answer against `username`'s grants. Returns `None` unless
  /// `address` is exactly the display address of a backend the user holds a
  /// grant for.
  pub fn resolve(&self, username: &str, address: &str) -> Option<Target> {
    let user = self.user(username)?;
    let backend = self.backends.iter().find(|backend| backend.address == address)?;
    let grant = user.grant_for(&backend.address)?;
    Some(Target {
      backend: backend.clone(),
      username: grant.username.clone(),
      password: grant.password.clone(),
    })
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) const SAMPLE: &str = r#"{
    "backends": [
      { "address": "web", "host": "10.0.0.5", "port": 2222 },
      { "address": "db", "host": "10.0.0.6" },
      { "address": "ci", "host": "10.0.0.7" }
    ],
    "users": [
      {
        "username": "alice",
        "password": "wonderland",
        "grants": [
          { "backend": "db", "username": "postgres", "password": "alice-db" },
          { "backend": "web", "username": "deploy", "password": "alice-web" }
        ]
      },
      {
        "username": "bob",
        "password": "builder",
        "grants": [
          { "backend": "web", "username": "www", "password": "bob-web" }
        ]
      },
      { "username": "mallory", "password": "nope" }
    ]
  }"#;

  pub(crate) fn sample() -> Directory {
    Directory::from_json(SAMPLE).unwrap()
  }

  #[test]
  fn authenticate_requires_matching_password() {
    let directory = sample();
    assert_eq!(directory.authenticate("alice", "wonderland").unwrap().username, "alice");
    assert!(directory.authenticate("alice", "builder").is_none());
    assert!(directory.authenticate("carol", "wonderland").is_none());
  }

  #[test]
  fn allowed_backends_follow_declaration_order() {
    let directory = sample();
    let allowed: Vec<_> = directory
      .allowed_backends("alice")
      .into_iter()
      .map(|b| b.address.as_str())
      .collect();
    // Grants are declared db-then-web but backends web-then-db.
    assert_eq!(allowed, ["web", "db"]);
    assert!(directory.allowed_backends("mallory").is_empty());
    assert!(directory.allowed_backends("nobody").is_empty());
  }

  #[test]
  fn resolve_uses_the_callers_own_grant() {
    let directory = sample();
    let alice = directory.resolve("alice", "web").unwrap();
    assert_eq!(alice.username, "deploy");
    assert_eq!(alice.password, "alice-web");
    assert_eq!(alice.backend.port, 2222);

    let bob = directory.resolve("bob", "web").unwrap();
    assert_eq!(bob.username, "www");
    assert_eq!(bob.password, "bob-web");

    assert!(directory.resolve("bob", "db").is_none());
    assert!(directory.resolve("alice", "10.0.0.5").is_none());
    assert!(directory.resolve("alice", "web ").is_none());
  }

  #[test]
  fn port_defaults_to_22() {
    let directory = sample();
    assert_eq!(directory.resolve("alice", "db").unwrap().backend.port, 22);
  }

  #[test]
  fn rejects_grant_for_unknown_backend() {
    let json = r#"{
      "backends": [{ "address": "web", "host": "h" }],
      "users": [{ "username": "a", "password": "p",
                  "grants": [{ "backend": "db", "username": "u", "password": "p" }] }]
    }"#;
    assert!(matches!(
      Directory::from_json(json),
      Err(DirectoryError::UnknownBackend { backend, .. }) if backend == "db"
    ));
  }

  #[test]
  fn rejects_duplicate_grant() {
    let json = r#"{
      "backends": [{ "address": "web", "host": "h" }],
      "users": [{ "username": "a", "password": "p", "grants": [
        { "backend": "web", "username": "u1", "password": "p" },
        { "backend": "web", "username": "u2", "password": "p" }
      ] }]
    }"#;
    assert!(matches!(
      Directory::from_json(json),
      Err(DirectoryError::DuplicateGrant { .. })
    ));
  }

  #[test]
  fn rejects_duplicate_users_and_backends() {
    let users = r#"{ "backends": [], "users": [
      { "username": "a", "password": "p" }, { "username": "a", "password": "q" }
    ] }"#;
    assert!(matches!(Directory::from_json(users), Err(DirectoryError::DuplicateUser(_))));

    let backends = r#"{ "backends": [
      { "address": "web", "host": "h1" }, { "address": "web", "host": "h2" }
    ], "users": [] }"#;
    assert!(matches!(
      Directory::from_json(backends),
      Err(DirectoryError::DuplicateBackend(_))
    ));
  }

  #[test]
  fn rejects_addresses_that_clash_with_the_menu() {
    for address in ["exit", "", "web server", "web\t"] {
      let backends = vec![Backend {
        address: address.into(),
        host: "h".into(),
        port: 22,
      }];
      assert!(
        matches!(
          Directory::new(backends, Vec::new()),
          Err(DirectoryError::InvalidAddress(rejected)) if rejected == address
        ),
        "{address:?} should be rejected"
      );
    }
  }

  #[test]
  fn load_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("directory.json");
    std::fs::write(&path, SAMPLE).unwrap();
    let directory = Directory::load(&path).unwrap();
    assert_eq!(directory.allowed_backends("bob").len(), 1);
    assert!(matches!(
      Directory::load(&dir.path().join("missing.json")),
      Err(DirectoryError::Io(_))
    ));
  }
}
