mod cli;
mod config;
mod output;

use anyhow::{Result, bail};
use clap::Parser;
#[cfg(feature = "colored-output")]
use colored::*;
use notify_stream::{
    HistoryCache, HistoryStore, LifecycleInputs, NotificationRecord, NotificationService,
    RestHistoryStore, UnreadCounts, merge,
};
use std::process;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    config::AppConfig,
    output::OutputManager,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        #[cfg(feature = "colored-output")]
        {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
        }
        #[cfg(not(feature = "colored-output"))]
        {
            eprintln!("Error: {:#}", e);
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet);

    let config = AppConfig::load(&args)?;
    let output = OutputManager::new(!args.no_color);

    match args.command {
        Commands::Watch {
            json,
            external_pending,
        } => watch(config, &output, json, external_pending).await,
        Commands::List { pages, json } => list(config, &output, pages, json).await,
        Commands::MarkRead { id } => {
            let store = rest_store(&config)?;
            store.mark_read(&config.identity()?, id).await?;
            println!("✓ Notification {id} marked as read");
            Ok(())
        }
        Commands::MarkAllRead => {
            let store = rest_store(&config)?;
            store.mark_all_read(&config.identity()?).await?;
            println!("✓ All notifications marked as read");
            Ok(())
        }
        Commands::Config { show } => {
            if show {
                println!("{}", config.show()?);
            } else {
                match AppConfig::default_path() {
                    Some(path) => println!("Default configuration file: {}", path.display()),
                    None => println!("No configuration directory on this platform"),
                }
                println!("Use --show to display the effective configuration");
            }
            Ok(())
        }
    }
}

fn rest_store(config: &AppConfig) -> Result<RestHistoryStore> {
    Ok(RestHistoryStore::new(
        &config.notify.base_url,
        config.notify.request_timeout,
    )?)
}

async fn watch(
    config: AppConfig,
    output: &OutputManager,
    json: bool,
    external_pending: u64,
) -> Result<()> {
    let identity = config.identity()?;
    let handle = NotificationService::spawn_default(config.notify)?;
    let mut events = handle.subscribe();

    handle.set_external_pending(external_pending).await?;
    handle
        .set_lifecycle(LifecycleInputs::new(true, Some(identity), true))
        .await?;
    info!("Watching notifications, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if json {
                        println!("{}", output.json(&event)?);
                    } else {
                        println!("{}", output.format_event(&event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn list(config: AppConfig, output: &OutputManager, pages: usize, json: bool) -> Result<()> {
    if pages == 0 {
        bail!("--pages must be at least 1");
    }

    let identity = config.identity()?;
    let store = rest_store(&config)?;
    let mut cache = HistoryCache::new();

    cache.replace_first(store.fetch_page(&identity, None).await?);
    while cache.page_count() < pages {
        let Some(cursor) = cache.next_cursor().map(str::to_owned) else {
            break;
        };
        cache.append(store.fetch_page(&identity, Some(&cursor)).await?);
    }

    let records = merge(cache.records(), std::iter::empty::<&NotificationRecord>());
    let unread = UnreadCounts {
        persisted: cache.persisted_unread(),
        ..UnreadCounts::default()
    }
    .total();

    if json {
        println!(
            "{}",
            output.json(&serde_json::json!({
                "notifications": records,
                "unread_count": unread,
                "has_more": cache.has_more(),
            }))?
        );
    } else {
        print!("{}", output.format_list(&records, unread));
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}
