use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use rpc_webrtc::{DialWebRtcOptions, dial_webrtc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rpc-webrtc-dial", about = "Dial a peer over WebRTC through a signaling service")]
struct Cli {
    /// Target address, optionally with `?host=<peer>`.
    address: String,

    #[arg(long, env = "RPC_WEBRTC_INSECURE")]
    insecure: bool,

    #[arg(long, env = "RPC_WEBRTC_SIGNALING_SERVER")]
    signaling_server: Option<String>,

    #[arg(long, env = "RPC_WEBRTC_DISABLE_TRICKLE_ICE")]
    disable_trickle_ice: bool,

    #[arg(long, env = "RPC_WEBRTC_SIGNALING_TIMEOUT_MS", default_value_t = 20_000)]
    signaling_timeout_ms: u64,

    /// Message to send once the channel is open.
    #[arg(long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut options = DialWebRtcOptions::default()
        .insecure(cli.insecure)
        .disable_trickle_ice(cli.disable_trickle_ice)
        .signaling_timeout(Duration::from_millis(cli.signaling_timeout_ms));
    if let Some(server) = cli.signaling_server {
        options = options.signaling_server(server);
    }

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let channel = dial_webrtc(&ctx, &cli.address, &options)
        .await
        .with_context(|| format!("dialing {}", cli.address))?;
    let stats = channel.stats().await;
    info!(
        address = %cli.address,
        connection_id = %stats.id,
        remote_candidates = ?stats.remote_candidates,
        "channel ready"
    );
    println!("connected to {}", cli.address);

    if let Some(message) = cli.message {
        let mut incoming = channel.take_incoming();
        channel
            .send(Bytes::from(message))
            .await
            .context("sending message")?;
        if let Some(incoming) = incoming.as_mut() {
            tokio::select! {
                _ = ctx.cancelled() => {}
                reply = incoming.recv() => {
                    if let Some(reply) = reply {
                        println!("{}", String::from_utf8_lossy(&reply));
                    }
                }
            }
        }
    }

    channel.close().await.context("closing channel")?;
    Ok(())
}
