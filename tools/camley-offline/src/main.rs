//! Command-line harness for the Camley offline cache worker.
//!
//! Runs the worker inside a container backed by the on-disk cache snapshot,
//! against a live origin or with the network switched off.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the install manifest from a running server
//! camley-offline --origin http://127.0.0.1:5000 warm
//!
//! # Serve a request the way a controlled page would, with no network
//! camley-offline --offline fetch /static/css/style.css --body
//!
//! # Inspect the snapshot
//! camley-offline list
//!
//! # Deliver a push and click the notification
//! camley-offline --offline push '{"title":"Ruta 5","url":"/dashboard"}' --click
//!
//! # Decommission: wipe every cache and unregister
//! camley-offline kill
//! ```

use anyhow::{Context, Result};
use camley_common::{init_logging, LogConfig, LogFormat, OfflineConfig};
use camley_net::{Fetcher, LoaderConfig, Request, ResourceLoader, Url};
use camley_sw::{
    CacheStore, KillSwitchWorker, OfflineCacheWorker, PersistentCacheStorage, PushEvent,
    RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent, WorkerScript,
};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

mod worker;

use worker::{ResumedWorker, Unreachable};

#[derive(Parser)]
#[command(name = "camley-offline")]
#[command(about = "Drive the Camley offline cache worker from the command line")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Origin the worker is registered on
    #[arg(long, default_value = "http://127.0.0.1:5000", global = true)]
    origin: Url,

    /// Fail every network request
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the worker, precaching the manifest
    Warm,

    /// Route one request through the active worker
    Fetch {
        /// Path or URL to request
        path: String,
        /// Issue it as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// List stores and entries in the snapshot
    List,

    /// Deliver a push message
    Push {
        /// Raw payload; JSON objects override notification fields
        payload: Option<String>,
        /// Click the notification afterwards
        #[arg(long)]
        click: bool,
    },

    /// Ask the worker to cache more URLs
    CacheAssets {
        urls: Vec<String>,
    },

    /// Fire a background sync
    Sync {
        #[arg(default_value = "sync-data")]
        tag: String,
    },

    /// Replace the worker with the kill switch
    Kill,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format));

    let config = match cli.config {
        Some(ref path) => {
            OfflineConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => OfflineConfig::default(),
    };
    config.validate()?;

    let store = Arc::new(PersistentCacheStorage::open(config.snapshot_path()).await?);
    if let Commands::List = cli.command {
        return list(&*store).await;
    }

    let fetcher: Arc<dyn Fetcher> = if cli.offline {
        Arc::new(Unreachable)
    } else {
        Arc::new(ResourceLoader::new(LoaderConfig::default())?)
    };
    let (container, mut events) = ServiceWorkerContainer::new(store.clone(), fetcher);

    let script_url = cli.origin.join("/service-worker.js")?;
    let home = cli.origin.join("/")?;
    let scope = home.to_string();
    let home_page = container.open_page(home.clone()).await;

    let script: Arc<dyn WorkerScript> = match cli.command {
        Commands::Kill => Arc::new(KillSwitchWorker::new()),
        Commands::Warm => Arc::new(OfflineCacheWorker::new(config.clone())),
        _ => Arc::new(ResumedWorker::new(OfflineCacheWorker::new(config.clone()))),
    };
    container
        .register(script_url.as_str(), script, RegistrationOptions::default())
        .await
        .with_context(|| format!("registering {}", script_url))?;

    match cli.command {
        Commands::Warm => {
            let entries = store.entries(&config.cache_version).await?;
            println!("{}: {} entries", config.cache_version, entries.len());
        }

        Commands::Fetch {
            path,
            navigate,
            body,
        } => {
            let url = cli.origin.join(&path)?;
            let (request, client) = if navigate {
                (Request::navigate(url), None)
            } else {
                (Request::get(url), Some(home_page.clone()))
            };
            let response = container.fetch(request, client).await;

            if response.is_network_error() {
                println!("network error");
            } else {
                println!("{} {}", response.status.as_u16(), response.status_text);
                if let Some(content_type) = response.content_type() {
                    println!("content-type: {}", content_type);
                }
                println!("{} bytes ({:?})", response.body.len(), response.response_type);
                if body {
                    println!();
                    println!("{}", String::from_utf8_lossy(&response.body));
                }
            }
        }

        Commands::Push { payload, click } => {
            let event = payload.map(PushEvent::text).unwrap_or_else(PushEvent::empty);
            container.push(&scope, event).await?;

            let shown = container
                .notifications()
                .read()
                .await
                .active()
                .last()
                .map(|n| (*n).clone())
                .context("worker showed no notification")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "title": shown.title,
                    "options": shown.options,
                }))?
            );

            if click {
                container
                    .notification_click(&scope, shown.id, Some("open".to_string()))
                    .await?;
            }
        }

        Commands::CacheAssets { urls } => {
            let reply = container
                .post_message(&scope, json!({ "type": "CACHE_ASSETS", "urls": urls }), None)
                .await?;
            let reply = reply.await.context("worker sent no reply")?;
            println!("{}", reply);
        }

        Commands::Sync { tag } => {
            container.sync(&scope, &tag).await?;
            println!("sync {} delivered", tag);
        }

        Commands::Kill => {
            println!("caches left: {}", store.keys().await?.len());
        }

        Commands::List => {}
    }

    let settled = container.drain().await;
    debug!(settled, "Background work finished");

    while let Ok(event) = events.try_recv() {
        match event {
            ServiceWorkerEvent::ClientMessage { client_id, data } => {
                println!("message to {}: {}", client_id, data)
            }
            ServiceWorkerEvent::WindowOpened { url, .. } => println!("opened {}", url),
            ServiceWorkerEvent::ClientFocused { client_id } => println!("focused {}", client_id),
            ServiceWorkerEvent::Unregistered { registration_scope } => {
                println!("unregistered {}", registration_scope)
            }
            other => debug!(event = ?other, "Worker event"),
        }
    }

    info!(snapshot = %store.path().display(), "Done");
    Ok(())
}

async fn list(store: &dyn CacheStore) -> Result<()> {
    let names = store.keys().await?;
    if names.is_empty() {
        println!("no caches");
    }
    for name in names {
        let entries = store.entries(&name).await?;
        println!("{} ({} entries)", name, entries.len());
        for entry in entries {
            println!(
                "  {} {} {} {} bytes",
                entry.method,
                entry.url,
                entry.status,
                entry.body.len()
            );
        }
    }
    Ok(())
}
