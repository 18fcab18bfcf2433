//! Async TCP gateway using Tokio.
//!
//! Accepts TCP connections and hands each one to a [`ConnectionSupervisor`]
//! running on its own task. Sessions outlive connections: they are tracked by
//! the gateway's [`SessionRegistry`] and evicted after inactivity.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, GatewayConfig};
use crate::handler::HandlerFactory;
use crate::session::SessionRegistry;

pub mod connection;
pub mod emitter;

pub use connection::{ConnectionId, ConnectionSupervisor};

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The session gateway.
///
/// # Examples
///
/// ```rust,no_run
/// use sessiongate::config::GatewayConfig;
/// use sessiongate::handler::{HandlerFuture, SessionHandler};
/// use sessiongate::http::{Request, Response, StatusCode};
/// use sessiongate::server::Gateway;
/// use sessiongate::session::SessionLink;
///
/// struct Hello(SessionLink);
///
/// impl SessionHandler for Hello {
///     fn handle(&self, _req: Request) -> HandlerFuture<'_> {
///         Box::pin(async move {
///             self.0.establish();
///             Ok(Response::new(StatusCode::Ok).body("Hello!"))
///         })
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let gateway = Gateway::bind(GatewayConfig::default()).await?;
///     gateway.run(Hello).await?;
///     Ok(())
/// }
/// ```
pub struct Gateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: GatewayConfig,
    registry: SessionRegistry,
}

impl Gateway {
    /// Validates `config` and binds its listen address.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] for an invalid configuration and
    /// [`GatewayError::Bind`] if the address cannot be bound.
    pub async fn bind(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let registry = SessionRegistry::new(config.session_timeout());
        Ok(Self {
            listener,
            local_addr,
            config,
            registry,
        })
    }

    /// Returns the local address the gateway is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The registry holding this gateway's sessions; subscribe to observe them.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Serves connections until the process is terminated.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and skipped.
    pub async fn run<F>(self, factory: F) -> Result<(), GatewayError>
    where
        F: HandlerFactory,
    {
        self.run_until(factory, std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves, then clears every session.
    ///
    /// Connections already being served keep running on their own tasks.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and skipped.
    pub async fn run_until<F, S>(self, factory: F, shutdown: S) -> Result<(), GatewayError>
    where
        F: HandlerFactory,
        S: Future<Output = ()>,
    {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            &self.config,
            self.registry.clone(),
            Arc::new(factory),
        ));
        info!(
            address = %self.local_addr,
            base_path = %self.config.base_path,
            timeout_secs = self.config.session_timeout_secs,
            "sessiongate listening"
        );

        tokio::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer_addr, error = %e, "failed to disable Nagle");
            }
            debug!(peer = %peer_addr, "connection accepted");
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                supervisor.serve(stream, peer_addr).await;
            });
        }

        info!(sessions = self.registry.len(), "shutting down");
        supervisor.router().shutdown();
        Ok(())
    }
}
