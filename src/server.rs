//! Process wiring: bind the gateway, start the background tasks, and tear
//! everything down on shutdown.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::registry::{spawn_sweeper, SessionRegistry};
use crate::tailer::{LogTailer, TailSettings};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Poll the sessions directory. Tests that drive the registry directly
    /// turn this off.
    pub start_tailer: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { start_tailer: true }
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    registry: SessionRegistry,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address; the real port when the config asked for port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Stop the scan and sweep timers, close open push channels with a normal
    /// close, stop accepting connections, and drop all session state.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "background task ended abnormally");
            }
        }
        self.registry.clear();
        tracing::info!("server stopped");
    }
}

/// Bind `config.host:config.port` and start serving.
///
/// A bind failure is the only fatal error. Everything after that absorbs its
/// own failures.
pub async fn start(
    config: &Config,
    registry: SessionRegistry,
    options: StartOptions,
) -> Result<ServerHandle, ServerError> {
    let requested = SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(requested)
        .await
        .map_err(|source| ServerError::Bind {
            addr: requested,
            source,
        })?;
    let addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if options.start_tailer {
        let tailer = LogTailer::new(
            config.sessions_dir.clone(),
            registry.clone(),
            TailSettings::from(config),
        );
        tasks.push(tailer.spawn(config.scan_interval(), cancel.clone()));
    }
    tasks.push(spawn_sweeper(
        registry.clone(),
        config.sweep_interval(),
        cancel.clone(),
    ));

    let state = AppState::new(registry.clone(), config, cancel.clone());
    let app = api::router(state).into_make_service_with_connect_info::<SocketAddr>();
    let serve_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
        }
    }));

    tracing::info!(
        http = %format_args!("http://{addr}"),
        ws = %format_args!("ws://{addr}/ws"),
        sessions_dir = %config.sessions_dir.display(),
        "codex-blocker server listening",
    );

    Ok(ServerHandle {
        addr,
        registry,
        cancel,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            sessions_dir: dir.path().join("sessions"),
            token_path: dir.path().join("token"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(&test_config(&dir), SessionRegistry::new(), StartOptions::default())
            .await
            .unwrap();
        assert_ne!(handle.addr().port(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            port: taken.local_addr().unwrap().port(),
            ..test_config(&dir)
        };
        let err = start(&config, SessionRegistry::new(), StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn shutdown_clears_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let handle = start(
            &test_config(&dir),
            registry.clone(),
            StartOptions { start_tailer: false },
        )
        .await
        .unwrap();
        registry.mark_seen("s1", None);
        let _sub = registry.subscribe(|_| {});
        assert_eq!(registry.len(), 1);

        handle.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(registry.subscriber_count(), 0);
    }
}
