//! Listener — binds the port, accepts connections, spawns one worker per
//! session, and shuts down cleanly on SIGINT/SIGTERM.
//!
//! Each worker owns its session and runs to completion under the single
//! connection deadline; workers never communicate and their errors never
//! escape the worker boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::secret::SecretSource;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not load host key {path}: {source}")]
    HostKey {
        path: String,
        source: russh_keys::Error,
    },
    #[error("could not bind port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error("config error: {0}")]
    Config(String),
}

/// Start the drop server and run until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let authenticator = Arc::new(Authenticator::from_config(&config));
    let secret = Arc::new(
        config
            .secret_source()
            .ok_or_else(|| ServerError::Config("no secret source configured".into()))?,
    );

    let host_key =
        russh_keys::load_secret_key(&config.host_key, None).map_err(|e| ServerError::HostKey {
            path: config.host_key.clone(),
            source: e,
        })?;

    // In requires-both mode only PUBKEY is advertised up front; the
    // handler re-advertises PASSWORD once a valid signature has passed.
    let supported = authenticator.supported_methods();
    let initial = if supported == russh::MethodSet::PUBLICKEY | russh::MethodSet::PASSWORD {
        russh::MethodSet::PUBLICKEY
    } else {
        supported
    };

    let ssh_config = Arc::new(russh::server::Config {
        methods: initial,
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: None,
        ..Default::default()
    });

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| ServerError::Bind {
            port: config.port,
            source: e,
        })?;

    info!(
        port = config.port,
        auth_method = %config.auth_method,
        auth_timeout = config.auth_timeout_secs,
        "ssh-drop listening"
    );

    let auth_timeout = Duration::from_secs(config.auth_timeout_secs);
    let mut workers = JoinSet::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(conn_id, peer = %peer, "new connection");

                let ssh_config = Arc::clone(&ssh_config);
                let authenticator = Arc::clone(&authenticator);
                let secret = Arc::clone(&secret);
                workers.spawn(async move {
                    handle_connection(
                        socket,
                        ssh_config,
                        authenticator,
                        secret,
                        auth_timeout,
                        conn_id,
                    )
                    .await;
                });
            }
            // Reap finished workers as we go.
            Some(_) = workers.join_next(), if !workers.is_empty() => {}
        }
    }

    // In-flight deliveries finish under their own deadline; don't wait
    // longer than that for them.
    let drain = async {
        while workers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(auth_timeout, drain).await.is_err() {
        warn!("shutdown grace period elapsed with workers still running");
    }

    Ok(())
}

/// Drive one accepted session to completion. Every error path ends here:
/// log, and let the accept loop carry on.
async fn handle_connection(
    socket: TcpStream,
    ssh_config: Arc<russh::server::Config>,
    authenticator: Arc<Authenticator>,
    secret: Arc<SecretSource>,
    auth_timeout: Duration,
    conn_id: u64,
) {
    let delivered = Arc::new(AtomicBool::new(false));
    let handler = ConnectionHandler::new(authenticator, secret, Arc::clone(&delivered), conn_id);

    // One deadline spans the whole interaction: key exchange, auth, shell
    // request, passphrase read, and the secret write. `run_stream` runs the
    // session to completion; on expiry the future is dropped, which closes
    // the socket.
    let session = russh::server::run_stream(ssh_config, socket, handler);
    match tokio::time::timeout(auth_timeout, session).await {
        Ok(Ok(_)) => debug!(conn_id, "connection closed"),
        Ok(Err(e)) => debug!(conn_id, error = %e, "connection ended"),
        Err(_) if delivered.load(Ordering::Relaxed) => {
            // Secret went out but the client never hung up.
            debug!(conn_id, "client lingered after delivery, closing");
        }
        Err(_) => warn!(conn_id, "Authentication timed out"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
