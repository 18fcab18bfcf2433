//! Minimal session gateway: every session echoes what it receives.
//!
//! ```text
//! cargo run --example echo -- --port 3000
//!
//! # handshake: the response carries mcp-session-id
//! curl -i -X POST localhost:3000/mcp -d '{"op":"init","clientInfo":{"name":"curl","version":"8"}}'
//! # reuse the session
//! curl -i -X POST localhost:3000/mcp -H 'mcp-session-id: <id>' -d '{"op":"echo","text":"hi"}'
//! # open an event stream of five ticks
//! curl -N -X POST localhost:3000/mcp -H 'mcp-session-id: <id>' -d '{"op":"watch"}'
//! # end the session
//! curl -i -X DELETE localhost:3000/mcp -H 'mcp-session-id: <id>'
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use sessiongate::handler::{HandlerFuture, SessionHandler};
use sessiongate::{
    ClientInfo, Gateway, GatewayConfig, Method, RemovalReason, Request, Response, SessionLink, SseEvent, StatusCode,
};

#[derive(Debug, Parser)]
#[command(name = "echo", about = "Session-multiplexing echo gateway", version, long_about = None)]
struct Cli {
    /// Path to a TOML gateway configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Op {
    Init {
        #[serde(rename = "clientInfo")]
        client_info: Option<ClientInfo>,
    },
    Echo {
        text: String,
    },
    Watch,
}

struct Echo {
    link: SessionLink,
}

impl Echo {
    fn new(link: SessionLink) -> Self {
        info!(session = %link.id(), "handler created");
        Self { link }
    }
}

impl SessionHandler for Echo {
    fn handle(&self, request: Request) -> HandlerFuture<'_> {
        Box::pin(async move {
            if request.method() == &Method::Delete {
                self.link.close();
                return Ok(Response::new(StatusCode::NoContent));
            }
            if request.method() != &Method::Post {
                return Ok(Response::new(StatusCode::MethodNotAllowed).body("POST or DELETE"));
            }

            match serde_json::from_slice::<Op>(request.body())? {
                Op::Init { client_info } => {
                    if let Some(client) = client_info {
                        self.link.report_client(client);
                    }
                    self.link.establish();
                    Ok(Response::new(StatusCode::Ok).json(&serde_json::json!({ "session": self.link.id() }))?)
                }
                Op::Echo { text } => Ok(Response::new(StatusCode::Ok).body(text)),
                Op::Watch => {
                    let (tx, response) = Response::event_stream(8);
                    let session = self.link.id().clone();
                    tokio::spawn(async move {
                        for n in 1..=5u32 {
                            let event = SseEvent::new(format!("tick {n}")).event("tick").id(n.to_string());
                            if tx.send(event).await.is_err() {
                                warn!(%session, "watcher went away");
                                return;
                            }
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    });
                    Ok(response)
                }
            }
        })
    }

    fn closed(&self, reason: RemovalReason) {
        info!(session = %self.link.id(), %reason, "session ended");
    }
}

fn load_config(cli: &Cli) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sessiongate=debug"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let gateway = Gateway::bind(config).await?;
    info!("listening on http://{}", gateway.local_addr());

    let _subscription = gateway.registry().subscribe(|sessions| {
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        info!(count = sessions.len(), ?ids, "sessions changed");
    });

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "ctrl-c handler failed");
        }
    };
    gateway.run_until(Echo::new, shutdown).await?;
    info!("bye");
    Ok(())
}

