use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use russh::{MethodKind, MethodSet};
use spatch::connector::Connector;
use spatch::{start_session, Directory, Gateway, TrustStore};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// An SSH bastion: users log in with their gateway password, pick a backend
/// from a menu, and get a shell there.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Path to private key files for the gateway. Can be specified multiple times, and at least one is required.
  #[arg(long, required = true)]
  host_key_path: Vec<PathBuf>,

  /// Addresses to listen on. [default: [::]:22, 0.0.0.0:22]
  // Default value logic is handled in `main` since it can't be done with
  // multiple values in `Args`.
  #[arg(long)]
  listen: Vec<SocketAddr>,

  /// JSON file with the backends and the users allowed to reach them.
  #[arg(long)]
  directory: PathBuf,

  /// Known hosts file for backend host keys. Created on first accepted key.
  #[arg(long, default_value = "known_hosts")]
  known_hosts: PathBuf,

  /// Optionally drop privileges to this user after binding to the socket.
  #[arg(long)]
  setuid: Option<u32>,

  /// Optionally drop privileges to this group after binding to the socket.
  #[arg(long)]
  setgid: Option<u32>,

  /// Optionally send keepalive messages at this interval.
  #[arg(long)]
  keepalive_interval_seconds: Option<u64>,

  /// Close connections after this many unanswered keepalive messages.
  #[arg(long, default_value_t = 3)]
  keepalive_max_unanswered: usize,

  /// Give up on a backend that doesn't finish connecting within this many seconds.
  #[arg(long, default_value_t = 10)]
  backend_connect_timeout_seconds: u64,
}

/// Accept connections on `socket` until shutdown, one task per session.
async fn serve(socket: TcpListener, gateway: Arc<Gateway>, mut shutdown: watch::Receiver<bool>) {
  let mut sessions = JoinSet::new();
  loop {
    tokio::select! {
      accepted = socket.accept() => match accepted {
        Ok((stream, peer)) => {
          let gateway = gateway.clone();
          sessions.spawn(async move {
            let result = start_session(gateway, stream, Some(peer)).await;
            tracing::info!(%peer, ok = result.ok, reason = %result.reason, "session finished");
          });
        }
        Err(error) => tracing::warn!(?error, "accept failed"),
      },
      // Resolves on the flag flipping and also if the sender is gone.
      _ = shutdown.wait_for(|stop| *stop) => break,
      Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
        if let Err(error) = joined {
          tracing::error!(?error, "session task failed");
        }
      }
    }
  }
  // Live sessions see the same flag and wind down on their own.
  while let Some(joined) = sessions.join_next().await {
    if let Err(error) = joined {
      tracing::error!(?error, "session task failed");
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .pretty()
        // Use span events to automatically log each of the SSH handlers.
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NEW),
    )
    .with(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  let directory = Directory::load(&args.directory)
    .with_context(|| format!("failed to load directory {}", args.directory.display()))?;

  let keys = args
    .host_key_path
    .iter()
    // NOTE: we don't support encrypted keys or "~/foo" paths yet.
    .map(|path| {
      russh::keys::load_secret_key(path, None).with_context(|| format!("failed to load host key {}", path.display()))
    })
    .collect::<anyhow::Result<Vec<_>>>()?;

  let server_config = russh::server::Config {
    auth_rejection_time: Duration::from_secs(1),
    methods: MethodSet::from([MethodKind::Password].as_slice()),
    keys,
    keepalive_interval: args.keepalive_interval_seconds.map(Duration::from_secs),
    keepalive_max: args.keepalive_max_unanswered,
    ..Default::default()
  };

  let addresses = if args.listen.is_empty() {
    vec![
      SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 22),
      SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0)), 22),
    ]
  } else {
    args.listen
  };
  tracing::debug!(?addresses, "binding to sockets");
  let sockets: Vec<TcpListener> = join_all(addresses.iter().map(TcpListener::bind))
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .context("failed to bind sockets")?;

  // setgid before setuid, since generally speaking we won't have permission to
  // setgid after setuid.
  if let Some(gid) = args.setgid {
    tracing::info!(gid, "dropping gid privileges");
    nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).context("failed to drop privileges with setgid")?;
  }
  if let Some(uid) = args.setuid {
    tracing::info!(uid, "dropping uid privileges");
    nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).context("failed to drop privileges with setuid")?;
  }

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => tracing::info!("shutting down"),
      Err(error) => tracing::error!(?error, "failed to listen for ctrl-c, shutting down"),
    }
    // Nobody is left to tell only if every listener is already gone.
    let _ = shutdown_tx.send(true);
  });

  let gateway = Arc::new(Gateway {
    directory: Arc::new(directory),
    trust: TrustStore::new(args.known_hosts),
    server_config: Arc::new(server_config),
    connector: Connector::new(
      Arc::new(russh::client::Config::default()),
      Duration::from_secs(args.backend_connect_timeout_seconds),
    ),
    shutdown: shutdown_rx.clone(),
  });

  tracing::info!(?addresses, "listening on sockets");
  join_all(
    sockets
      .into_iter()
      .map(|socket| serve(socket, gateway.clone(), shutdown_rx.clone())),
  )
  .await;

  Ok(())
}
