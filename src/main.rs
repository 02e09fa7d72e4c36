//! On-demand VOD gateway
//!
//! Serves source media files as adaptive-bitrate HLS plus full-file
//! progressive downloads, driving one external ffmpeg per (source, quality)
//! just-in-time: segments are produced slightly ahead of the playback
//! position and discarded once they fall behind.

mod config;
mod error;
mod http;
mod manager;
mod playlist;
mod probe;
mod stream;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::http::{create_router, Handler};

/// Application name on the wire; clients key their version checks on it.
const APP_NAME: &str = "go-vod";

#[tokio::main]
async fn main() {
    init_logging();

    let mut config = Config::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-version" => {
                println!("{} {}", APP_NAME, http::handler::VERSION);
                return;
            }
            "-version-monitor" => config.version_monitor = true,
            path => {
                if let Err(err) = config.load_file(path) {
                    tracing::error!(%path, %err, "error loading config file");
                    std::process::exit(1);
                }
            }
        }
    }

    if let Err(err) = config.auto_detect() {
        tracing::error!(%err, "startup failed");
        std::process::exit(1);
    }

    let handler = Handler::new(config);
    let router = create_router(handler.clone());

    let code = match handler.start(router).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "error running server");
            1
        }
    };

    tracing::info!(code, "exiting {}", APP_NAME);
    std::process::exit(code);
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vod_server=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
