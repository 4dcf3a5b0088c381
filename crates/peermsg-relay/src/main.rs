//! PeerMessenger signaling relay
//!
//! Accepts WebSocket connections at `ws://<listen>/<any path>?room=<id>` and
//! forwards each text frame to the other members of the room. Each room
//! keeps a bounded backlog that is replayed to members who join later.
//! The relay only ever sees sealed control messages.
//!
//! ## Usage
//!
//! ```bash
//! peermsg-relay --listen 0.0.0.0:8787
//! peermsg-relay --max-backlog 100 --max-age-secs 300 -v
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use peermsg_core::relay::{DEFAULT_MAX_AGE, DEFAULT_MAX_BACKLOG};
use peermsg_core::RoomHub;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Room used when a client omits `?room=`
const DEFAULT_ROOM: &str = "default";

/// PeerMessenger signaling relay
#[derive(Parser)]
#[command(name = "peermsg-relay")]
#[command(version = "0.1.0")]
#[command(about = "PeerMessenger signaling relay - room fan-out with bounded backlog")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8787")]
    listen: String,

    /// Frames kept per room for late joiners
    #[arg(long, default_value_t = DEFAULT_MAX_BACKLOG)]
    max_backlog: usize,

    /// Seconds a backlog frame stays replayable
    #[arg(long, default_value_t = DEFAULT_MAX_AGE.as_secs())]
    max_age_secs: u64,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Room id from a request query string
fn room_param(query: Option<&str>) -> String {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("room="))
        .filter(|room| !room.is_empty())
        .unwrap_or(DEFAULT_ROOM)
        .to_string()
}

/// Serve one WebSocket connection until either side goes away.
async fn serve_connection(hub: Arc<RoomHub>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut room = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            room = Some(room_param(request.uri().query()));
            Ok(response)
        },
    )
    .await
    .context("WebSocket handshake failed")?;
    let room = room.unwrap_or_else(|| DEFAULT_ROOM.to_string());

    let (membership, mut frames) = hub.join(&room);
    debug!(%addr, room = %room, members = hub.member_count(&room), "Joined room");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                sink.send(Message::text(frame)).await?;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => membership.publish(text.as_str().to_owned()),
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }

    let _ = sink.close().await;
    debug!(%addr, room = %room, "Left room");
    Ok(())
}

/// Accept connections until the listener fails.
async fn run(listener: TcpListener, hub: Arc<RoomHub>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(hub, stream, addr).await {
                warn!(%addr, error = %e, "Connection ended with error");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let hub = Arc::new(RoomHub::new(
        cli.max_backlog,
        Duration::from_secs(cli.max_age_secs),
    ));
    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!(
        addr = %listener.local_addr()?,
        max_backlog = cli.max_backlog,
        max_age_secs = cli.max_age_secs,
        "Relay listening"
    );

    tokio::select! {
        result = run(listener, hub) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
