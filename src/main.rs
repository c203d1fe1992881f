use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use chorus::room::Rooms;
use chorus::sync::{dispatch_keyframes, KEYFRAME_INTERVAL};
use chorus::App;

/// Many-to-many audio conferencing server.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// http service address
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// STUN server handed to every peer connection
    #[arg(long, default_value = "stun:stun.l.google.com:19302")]
    stun: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = Arc::new(App {
        rooms: Rooms::new(),
        stun_url: args.stun,
    });

    // Ask every uploader for a keyframe on a fixed cadence so freshly
    // subscribed peers can start decoding.
    {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            let mut ticker = time::interval(KEYFRAME_INTERVAL);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                for room in app.rooms.snapshot().await {
                    dispatch_keyframes(&room).await;
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, chorus::router(app)).await?;

    Ok(())
}
