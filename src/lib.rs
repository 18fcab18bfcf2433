//! # sessiongate
//!
//! An async HTTP/1.1 gateway that multiplexes long-lived logical sessions
//! over short-lived connections.
//!
//! Each session gets its own handler instance. A request without a session
//! header starts a handshake; once the handler establishes it, the gateway
//! registers the session and returns its id in the session header. Later
//! requests carrying that id reach the same handler, whatever connection they
//! arrive on. Idle sessions are evicted after a configurable timeout.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessiongate::{Gateway, GatewayConfig, Request, Response, SessionLink, StatusCode};
//! use sessiongate::handler::{HandlerFuture, SessionHandler};
//!
//! struct Greeter(SessionLink);
//!
//! impl SessionHandler for Greeter {
//!     fn handle(&self, _req: Request) -> HandlerFuture<'_> {
//!         Box::pin(async move {
//!             self.0.establish();
//!             Ok(Response::new(StatusCode::Ok).body("Hello, World!"))
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::bind(GatewayConfig::default()).await?;
//!     println!("Listening on http://{}/mcp", gateway.local_addr());
//!     gateway.run(Greeter).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod handler;
pub mod http;
pub mod router;
pub mod server;
pub mod session;

pub use config::{ConfigError, GatewayConfig};
pub use handler::{HandlerError, HandlerFactory, SessionHandler};
pub use http::{EventSender, Headers, Method, Request, Response, SseEvent, StatusCode};
pub use server::{ConnectionSupervisor, Gateway, GatewayError};
pub use session::{ClientInfo, RemovalReason, SessionId, SessionInfo, SessionLink, SessionRegistry};
