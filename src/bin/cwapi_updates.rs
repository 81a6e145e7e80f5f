//! cwapi-updates: update and feed logger
//!
//! Connects with the configured credentials, subscribes to the configured
//! feeds, and logs every response and feed event until Ctrl-C.
//!
//! ## Configuration
//! - `cwapi.yaml`, the file given as first argument, or CWAPI_CONFIG
//! - CWAPI__USER, CWAPI__PASSWORD, CWAPI__SERVER, CWAPI__FEEDS=deals,duels
//! - CWAPI_LOG: log filter (default: info)

use std::fmt::Debug;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use cwapi::feeds::{AuctionDigest, Deal, Duel, Offer, SexDigest, YellowPages};
use cwapi::utils::bootstrap::{init_tracing, shutdown_signal};
use cwapi::{ClientConfig, Feed, FeedEvent, Session};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = ClientConfig::load(path.as_deref())?;

    let session = Session::connect(&config).await?;
    info!(user = %config.user, server = ?config.server, "cwapi-updates started");

    let mut tasks = Vec::new();

    if let Some(mut updates) = session.take_updates() {
        tasks.push(tokio::spawn(async move {
            while let Some(response) = updates.recv().await {
                info!(
                    uuid = %response.uuid,
                    action = %response.action,
                    result = %response.result,
                    payload = ?response.payload,
                    "Update"
                );
            }
        }));
    }

    for feed in &config.feeds {
        let task = match feed {
            Feed::Deals => log_feed::<Deal>(&session).await,
            Feed::Duels => log_feed::<Duel>(&session).await,
            Feed::Offers => log_feed::<Offer>(&session).await,
            Feed::SexDigest => log_feed::<SexDigest>(&session).await,
            Feed::YellowPages => log_feed::<YellowPages>(&session).await,
            Feed::AuDigest => log_feed::<AuctionDigest>(&session).await,
        };
        match task {
            Ok(task) => tasks.push(task),
            Err(e) => warn!(feed = %feed, error = %e, "Failed to subscribe"),
        }
    }

    shutdown_signal().await;
    session.shutdown().await;

    for task in tasks {
        let _ = task.await;
    }

    info!("cwapi-updates stopped");
    Ok(())
}

async fn log_feed<F: FeedEvent + Debug>(session: &Session) -> cwapi::Result<JoinHandle<()>> {
    let mut events = session.subscribe_feed::<F>().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(feed = %F::FEED, event = ?event, "Feed event");
        }
    }))
}
