//! Command line interface for the geo client core. Derives geocells,
//! normalizes place payloads, and follows places and geochat on relays.

mod chat;
mod config;
mod enrichment;
mod entity;
mod event;
mod filter;
mod geocell;
mod normalize;
mod order;
mod relay;
mod session;
mod store;
mod subscription;

use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat::{ChatSession, ChatUpdate};
use config::Settings;
use entity::{ChatMessage, Entity, PlaceId};
use order::PinList;
use relay::RelayPool;
use session::{PlaceScope, PlacesSession, RenderedPlace, Update};

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "yondar", author, version, about = "Nostr places and geochat client")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print the geocell key of a point, its enclosing prefixes and the cell bounds.
    Geocell {
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, default_value_t = chat::DEFAULT_PRECISION)]
        precision: usize,
    },
    /// Validate and normalize event files, one JSON line per file.
    Normalize {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Fetch places and print them in draw order with their owners.
    Places {
        /// Show everyone's places regardless of `PLACE_SCOPE`.
        #[arg(long, conflicts_with = "author")]
        global: bool,
        /// Only show places by these authors.
        #[arg(long)]
        author: Vec<String>,
        /// Pin a place (`<d>-<pubkey>-<kind>`). Later pins are drawn on top.
        #[arg(long)]
        pin: Vec<PlaceId>,
        /// Unpin a place again. Applied after every `--pin`.
        #[arg(long)]
        unpin: Vec<PlaceId>,
        /// Keep streaming and print the full list as a JSON array on every change.
        #[arg(long)]
        follow: bool,
        /// How long to wait for owner profiles after the place backlog.
        #[arg(long, default_value_t = 1500)]
        grace_ms: u64,
    },
    /// Print geochat notes around a point.
    Chat {
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        /// Keep streaming after the backlog.
        #[arg(long)]
        follow: bool,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Geocell {
            lng,
            lat,
            precision,
        } => {
            let key = geocell::geocell_key(lng, lat, precision)?;
            let bounds = geocell::decode_bounds(&key)?;
            let (center_lng, center_lat) = bounds.center();
            println!(
                "{}",
                json!({
                    "key": key,
                    "prefixes": geocell::prefixes(&key),
                    "bounds": [bounds.min_lng, bounds.min_lat, bounds.max_lng, bounds.max_lat],
                    "center": [center_lng, center_lat],
                })
            );
        }
        Commands::Normalize { files } => {
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                println!("{}", normalize_file(&f, &data));
            }
        }
        Commands::Places {
            global,
            author,
            pin,
            unpin,
            follow,
            grace_ms,
        } => {
            ensure_env_file(&cli.env)?;
            let cfg = Settings::from_env(&cli.env)?;
            let scope = if global {
                PlaceScope::Global
            } else if !author.is_empty() {
                PlaceScope::Authors(author)
            } else {
                cfg.place_scope()
            };
            let mut pins = PinList::new();
            for id in pin {
                pins.pin(id);
            }
            for id in &unpin {
                pins.unpin(id);
            }
            run_places(&cfg, scope, &pins, follow, Duration::from_millis(grace_ms)).await;
        }
        Commands::Chat { lng, lat, follow } => {
            ensure_env_file(&cli.env)?;
            let cfg = Settings::from_env(&cli.env)?;
            run_chat(&cfg, lng, lat, follow).await?;
        }
    }
    Ok(())
}

/// One output line for an event file: the normalized entity or the rejection.
fn normalize_file(path: &str, data: &str) -> Value {
    let event = match serde_json::from_str::<event::Event>(data) {
        Ok(event) => event,
        Err(e) => return json!({ "file": path, "rejected": format!("not an event: {e}") }),
    };
    let kind = event.kind;
    match normalize::normalize(event, kind) {
        Ok(Entity::Place(place)) => json!({
            "file": path,
            "id": place.place_id().map(|id| id.to_string()),
            "place": place,
        }),
        Ok(Entity::Chat(message)) => json!({ "file": path, "chat": message }),
        Ok(Entity::Profile(profile)) => json!({ "file": path, "profile": profile }),
        Err(reason) => json!({ "file": path, "rejected": reason.to_string() }),
    }
}

async fn run_places(
    cfg: &Settings,
    scope: PlaceScope,
    pins: &PinList<PlaceId>,
    follow: bool,
    grace: Duration,
) {
    let pool = RelayPool::new(cfg.tor_socks.clone());
    let mut session =
        PlacesSession::new(Arc::new(pool), cfg.eose_timeout).close_on_backlog(!follow);
    session.set_scope(scope, &cfg.relays);

    let mut backlog_done = false;
    loop {
        let update = session.next_update().await;
        debug!(?update, "places update");
        match update {
            Update::Idle => break,
            Update::Backlog if !follow => break,
            Update::Backlog => {
                backlog_done = true;
                print_snapshot(&session.rendered(pins), pins);
            }
            Update::Place(applied) | Update::Profile(applied)
                if follow && backlog_done && applied.changed() =>
            {
                print_snapshot(&session.rendered(pins), pins);
            }
            _ => {}
        }
    }
    if follow {
        return;
    }

    // owners trickle in after the places; give them a moment
    let owners = async {
        while !session.owners_settled() {
            match session.next_update().await {
                Update::Idle => break,
                update => debug!(?update, "profile update"),
            }
        }
    };
    if tokio::time::timeout(grace, owners).await.is_err() {
        info!("gave up waiting for owner profiles");
    }
    for rendered in session.rendered(pins) {
        println!("{}", place_line(&rendered, pins));
    }
}

fn print_snapshot(rendered: &[RenderedPlace<'_>], pins: &PinList<PlaceId>) {
    let lines: Vec<Value> = rendered.iter().map(|r| place_line(r, pins)).collect();
    println!("{}", Value::Array(lines));
}

fn place_line(rendered: &RenderedPlace<'_>, pins: &PinList<PlaceId>) -> Value {
    let place = rendered.place;
    let id = place.place_id();
    json!({
        "id": id.as_ref().map(|id| id.to_string()),
        "name": place.content.name(),
        "coordinates": place.coordinates(),
        "owner": rendered.owner.and_then(|o| o.content.display_name()),
        "pinned": id.is_some_and(|id| pins.contains(&id)),
        "created_at": place.created_at,
    })
}

async fn run_chat(cfg: &Settings, lng: f64, lat: f64, follow: bool) -> anyhow::Result<()> {
    let pool = RelayPool::new(cfg.tor_socks.clone());
    let mut chat = ChatSession::new(Arc::new(pool), cfg.eose_timeout)
        .with_precision(cfg.chat_precision, cfg.chat_scope_precision);
    chat.set_center(lng, lat, &cfg.relays)?;
    info!(title = chat.title().unwrap_or_default(), "geochat");

    loop {
        match chat.next_update().await {
            ChatUpdate::Message => {
                if let Some(message) = chat.messages().last() {
                    println!("{}", chat_line(message));
                }
            }
            ChatUpdate::Backlog if !follow => break,
            ChatUpdate::Idle => break,
            ChatUpdate::Backlog | ChatUpdate::Rejected => {}
        }
    }
    Ok(())
}

fn chat_line(message: &ChatMessage) -> Value {
    json!({
        "id": message.id,
        "pubkey": message.pubkey,
        "created_at": message.created_at,
        "geohash": message.geohash(),
        "content": message.content,
    })
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("RELAYS=wss://relay.damus.io,wss://nos.lol\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("IDENTITY=\n");
    content.push_str("CONTACTS=\n");
    content.push_str("PLACE_SCOPE=global\n");
    content.push_str(&format!(
        "EOSE_TIMEOUT_MS={}\n",
        config::DEFAULT_EOSE_TIMEOUT_MS
    ));
    content.push_str(&format!("CHAT_PRECISION={}\n", chat::DEFAULT_PRECISION));
    content.push_str(&format!(
        "CHAT_SCOPE_PRECISION={}\n",
        chat::DEFAULT_SCOPE_PRECISION
    ));
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yondar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let cli = Cli::parse();
    run(cli).await
}
