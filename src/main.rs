use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use blogfeed::{Config, FeedItem, FeedItems, NetworkFlag, Session, SessionEvent};

/// Get the config directory path (~/.config/blogfeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("blogfeed"))
}

#[derive(Parser, Debug)]
#[command(name = "blogfeed", about = "Print a blog's RSS feed with its thumbnails")]
struct Args {
    /// Config file (defaults to ~/.config/blogfeed/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Refresh the feed after the first load and print the new copy
    #[arg(long)]
    refresh: bool,

    /// Download and decode every item's thumbnail
    #[arg(long)]
    images: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => get_config_dir()?.join("config.toml"),
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;
    tracing::debug!(feed_url = %config.feed_url, "Config loaded");

    let (tx, mut rx) = mpsc::channel(32);
    let session = Session::from_config(&config, Arc::new(NetworkFlag::default()), tx)
        .context("Failed to build HTTP client")?;

    let request_id = session.load_feed();
    let mut items = wait_for_feed(&mut rx, request_id).await?;

    if args.refresh {
        let request_id = session.refresh_feed();
        items = wait_for_feed(&mut rx, request_id).await?;
    }

    print_feed(session.feed_url(), &items);

    if args.images {
        load_images(&session, &mut rx, &items).await?;
    }

    Ok(())
}

/// Waits for the `FeedLoaded` event matching `request_id`.
async fn wait_for_feed(
    rx: &mut mpsc::Receiver<SessionEvent>,
    request_id: u64,
) -> Result<FeedItems> {
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::FeedLoaded {
                request_id: id,
                result,
                ..
            } if id == request_id => {
                return result.context("Failed to load feed");
            }
            other => tracing::debug!(request_id = other.request_id(), "Ignoring unrelated event"),
        }
    }
    bail!("Event channel closed before the feed arrived")
}

fn print_feed(feed_url: &str, items: &FeedItems) {
    println!("{} ({} posts)", feed_url, items.len());

    let Some(featured) = items.featured() else {
        println!("No posts.");
        return;
    };

    println!();
    println!("Featured:");
    print_item(featured);

    if !items.others().is_empty() {
        println!();
        println!("More posts:");
        for item in items.others() {
            print_item(item);
        }
    }
}

fn print_item(item: &FeedItem) {
    println!("  {}", item.title());
    let date = item.formatted_date();
    if !date.is_empty() {
        println!("    {}", date);
    }
    if !item.link().is_empty() {
        println!("    {}", item.link());
    }
}

async fn load_images(
    session: &Session,
    rx: &mut mpsc::Receiver<SessionEvent>,
    items: &FeedItems,
) -> Result<()> {
    let mut outstanding = 0usize;
    for item in items.iter().filter(|item| !item.image_url().is_empty()) {
        session.load_image(item.image_url());
        outstanding += 1;
    }

    if outstanding == 0 {
        println!();
        println!("No thumbnails.");
        return Ok(());
    }

    println!();
    println!("Thumbnails:");
    while outstanding > 0 {
        let Some(event) = rx.recv().await else {
            bail!("Event channel closed with {outstanding} thumbnails outstanding");
        };
        if let SessionEvent::ImageLoaded { url, result, .. } = event {
            outstanding -= 1;
            match result {
                Ok(image) => println!("  {}x{}  {}", image.width(), image.height(), url),
                Err(e) => println!("  failed  {}: {}", url, e),
            }
        }
    }
    Ok(())
}
