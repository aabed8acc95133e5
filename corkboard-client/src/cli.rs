/// `corkboard-sync` command line.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use corkboard_core::store::{CommitOutcome, StoreEvent, SyncError};
use corkboard_core::types::{EntityKind, Mutation};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::config;
use crate::session::{Session, SessionError};

#[derive(Parser, Debug)]
#[command(name = "corkboard-sync", about = "Headless Corkboard board sync client")]
pub struct Args {
    /// Config file (default: ~/.config/corkboard/client.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server base URL, overrides the config file
    #[arg(long)]
    pub server: Option<String>,

    /// Board to open
    #[arg(long)]
    pub board: String,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stay connected, apply remote changes and replay queued writes until Ctrl-C
    Watch,
    /// Print lists and cards in display order
    Show,
    /// Print writes waiting in the offline queue
    Status,
    /// Replay the offline queue once
    Drain,
    /// Add a card to the end of a list
    Add {
        #[arg(long)]
        list: String,
        #[arg(long)]
        title: String,
    },
    /// Add a list to the end of the board
    AddList {
        #[arg(long)]
        title: String,
    },
    /// Change the title of a list or card
    Rename {
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
    },
    /// Move a card (or list) to an index within a collection
    Move {
        #[arg(long)]
        id: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        index: usize,
    },
    /// Delete a list or card
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Signal error: {0}")]
    Signal(#[from] std::io::Error),
}

pub async fn run(args: Args) -> Result<(), CliError> {
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut client_config = config::load_config(&config_path);
    if client_config.ensure_client_id() {
        if let Err(e) = config::save_config(&config_path, &client_config) {
            log::warn!(
                "[corkboard.cli] Could not persist client id to {}: {}",
                config_path.display(),
                e
            );
        }
    }
    if let Some(server) = args.server {
        client_config.server_url = server;
    }

    let mut session = Session::open(client_config, &args.board)?;
    if let Command::Status = args.command {
        print_queue(&session)?;
        return Ok(());
    }

    let source = session.load().await?;
    log::info!("[corkboard.cli] Board {} loaded from {:?}", args.board, source);

    match args.command {
        Command::Watch => {
            let events = session.store().subscribe();
            session.start();
            watch(events).await?;
        }
        Command::Show => print_board(&session),
        Command::Status => {}
        Command::Drain => {
            let report = session.store().drain().await?;
            println!(
                "delivered {}, lost {}, remaining {}{}",
                report.delivered,
                report.lost,
                report.remaining,
                if report.interrupted { " (offline)" } else { "" }
            );
        }
        Command::Add { list, title } => {
            let outcome = session
                .store()
                .apply_and_commit(Mutation::Create {
                    kind: EntityKind::Card,
                    parent_id: Some(list),
                    fields: title_fields(title),
                })
                .await?;
            print_outcome(&outcome);
        }
        Command::AddList { title } => {
            let outcome = session
                .store()
                .apply_and_commit(Mutation::Create {
                    kind: EntityKind::List,
                    parent_id: None,
                    fields: title_fields(title),
                })
                .await?;
            print_outcome(&outcome);
        }
        Command::Rename { id, title } => {
            let outcome = session
                .store()
                .apply_and_commit(Mutation::Update {
                    id,
                    fields: title_fields(title),
                })
                .await?;
            print_outcome(&outcome);
        }
        Command::Move {
            id,
            from,
            to,
            index,
        } => {
            let outcome = session.store().move_entity(&id, &from, &to, index).await?;
            print_outcome(&outcome);
        }
        Command::Delete { id } => {
            let outcome = session
                .store()
                .apply_and_commit(Mutation::Delete { id })
                .await?;
            print_outcome(&outcome);
        }
    }

    session.shutdown()?;
    Ok(())
}

fn title_fields(title: String) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("title".into(), Value::String(title));
    fields
}

fn print_outcome(outcome: &CommitOutcome) {
    match outcome {
        CommitOutcome::Confirmed(Some(entity)) => println!("saved {}", entity.id),
        CommitOutcome::Confirmed(None) => println!("saved"),
        CommitOutcome::Queued(action) => {
            println!("server unreachable, queued as {}", action.id)
        }
    }
}

fn print_board(session: &Session) {
    let store = session.store();
    for list in store.lists() {
        println!("{} [{}]", list.title().unwrap_or("(untitled)"), list.id);
        for card in store.cards_in(&list.id) {
            println!(
                "  {:>3} {} [{}]",
                card.position,
                card.title().unwrap_or("(untitled)"),
                card.id
            );
        }
    }
}

fn print_queue(session: &Session) -> Result<(), CliError> {
    let pending = session
        .store()
        .queue()
        .pending()
        .map_err(SyncError::from)?;
    if pending.is_empty() {
        println!("queue empty");
    }
    for action in pending {
        println!(
            "{} {:?} {} (attempt {}/{}, queued {})",
            action.id,
            action.kind,
            action.target,
            action.attempts,
            action.max_attempts,
            action.enqueued_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn watch(mut events: broadcast::Receiver<StoreEvent>) -> Result<(), CliError> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StoreEvent::Changed { origin, ids }) => {
                    log::debug!("[corkboard.cli.watch] {:?} change: {}", origin, ids.join(", "));
                }
                Ok(StoreEvent::Rejected { entity_id, error }) => {
                    println!("rejected {}: {}", entity_id, error);
                }
                Ok(StoreEvent::Replayed { action, .. }) => {
                    println!("replayed {:?} {}", action.kind, action.target);
                }
                Ok(StoreEvent::WriteLost { action, error, discarded }) => {
                    println!("lost write {:?} {}: {}", action.kind, action.target, error);
                    for dependent in discarded {
                        println!("  dropped with it: {:?} {}", dependent.kind, dependent.target);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[corkboard.cli.watch] Skipped {} notifications", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
        }
    }
}
