use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pollbot::channel::console::ConsoleChannel;
use pollbot::config::Settings;
use pollbot::consts::default_db_path;
use pollbot::engine::{Engine, PollEngine};
use pollbot::feed::{FeedItem, InboundEvent};
use pollbot::guard::SystemClock;
use pollbot::render::PollRenderer;
use pollbot::store::{PollId, PollStore};

/// Posts handled concurrently before the batch is flushed.
const POST_BATCH: usize = 8;

#[derive(Parser)]
#[command(
    name = "pollbot",
    version,
    about = "Turns poll requests into live polls and tallies the votes."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// SQLite database path (use :memory: for ephemeral)
    #[arg(short, long)]
    db: Option<String>,

    /// Identity the bot posts as (overrides the stored setting)
    #[arg(long)]
    bot_name: Option<String>,

    /// Community assumed for locations the feed never mentioned
    #[arg(long, default_value = "general")]
    community: String,

    /// Seconds between vote passes
    #[arg(long, default_value_t = 60)]
    vote_interval: u64,

    /// Log as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Consume a JSON-lines feed and print outbound actions (default)
    Run {
        /// Feed file; stdin when omitted
        feed: Option<PathBuf>,
    },
    /// Render a stored poll with its current tally
    Show { poll_id: PollId },
    /// List banned communities
    Bans,
    /// Lift a ban so polls in the community are edited again
    Unban { community: String },
    /// Remove the creation limit for a community
    Exempt { community: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let db = match &cli.db {
        Some(db) => db.clone(),
        None => {
            let path = default_db_path();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            path.to_string_lossy().into_owned()
        }
    };

    let store = Arc::new(PollStore::open(&db).with_context(|| format!("failed to open {db}"))?);
    let settings = Settings::open(&db)?;

    match &cli.command {
        None => run(&cli, None, store, &settings).await,
        Some(Command::Run { feed }) => run(&cli, feed.clone(), store, &settings).await,
        Some(Command::Show { poll_id }) => show(&store, &settings, cli.bot_name.clone(), *poll_id),
        Some(Command::Bans) => {
            for community in store.lock().bans()? {
                println!("{community}");
            }
            Ok(())
        }
        Some(Command::Unban { community }) => {
            if store.lock().remove_ban(community)? {
                println!("unbanned {community}");
            } else {
                println!("{community} was not banned");
            }
            Ok(())
        }
        Some(Command::Exempt { community }) => {
            if settings.add_exempt(community)? {
                println!("{community} is now exempt from creation limits");
            } else {
                println!("{community} was already exempt");
            }
            Ok(())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "pollbot=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn show(
    store: &PollStore,
    settings: &Settings,
    bot_name: Option<String>,
    poll_id: PollId,
) -> anyhow::Result<()> {
    let config = settings.engine_config(bot_name)?;
    let db = store.lock();
    let poll = db
        .get_poll(poll_id)?
        .with_context(|| format!("no poll with id {poll_id}"))?;
    let options: Vec<String> = db.get_options(poll_id)?.into_iter().map(|o| o.text).collect();
    let tally = db.get_votes(poll_id)?;
    drop(db);

    println!(
        "{}",
        PollRenderer::new(config.bot_name).render(poll.id, &poll.title, &options, &tally)
    );
    match poll.rendered_location_id {
        Some(location) => println!(
            "posted at {location}, requested at {}",
            poll.request_location_id
        ),
        None => println!("never posted, requested at {}", poll.request_location_id),
    }
    Ok(())
}

async fn run(
    cli: &Cli,
    feed: Option<PathBuf>,
    store: Arc<PollStore>,
    settings: &Settings,
) -> anyhow::Result<()> {
    let config = settings.engine_config(cli.bot_name.clone())?;
    tracing::info!(bot = %config.bot_name, community = %cli.community, "starting");

    let channel = Arc::new(ConsoleChannel::stdout(cli.community.clone()));
    let engine = Arc::new(PollEngine::new(
        config,
        store,
        channel.clone(),
        Arc::new(SystemClock),
    ));

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(?event, "engine event"),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match feed {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open feed {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.vote_interval.max(1)));
    // The first tick completes immediately.
    ticker.tick().await;

    let mut posts: Vec<InboundEvent> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<FeedItem>(line) {
                            Ok(FeedItem::Post(event)) => {
                                channel.observe(&event.location);
                                posts.push(event);
                                if posts.len() >= POST_BATCH {
                                    flush_posts(&*engine, &mut posts).await;
                                }
                            }
                            Ok(FeedItem::Message(message)) => channel.push_message(message),
                            Err(e) => tracing::warn!(error = %e, "skipping malformed feed line"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read feed");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                flush_posts(&*engine, &mut posts).await;
                engine.run_vote_pass().await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    flush_posts(&*engine, &mut posts).await;
    let pass = engine.run_vote_pass().await;
    tracing::info!(
        votes = pass.recorded(),
        edited = pass.edited.len(),
        "final vote pass done"
    );
    Ok(())
}

/// Handle buffered posts concurrently.
async fn flush_posts(engine: &dyn Engine, posts: &mut Vec<InboundEvent>) {
    if posts.is_empty() {
        return;
    }
    let batch = std::mem::take(posts);
    let outcomes =
        futures::future::join_all(batch.iter().map(|event| engine.handle_post(event))).await;
    for (event, outcome) in batch.iter().zip(outcomes) {
        tracing::debug!(event = %event.id, ?outcome, "post handled");
    }
}
