use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use inquire::error::InquireResult;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod app;
mod cli;
mod config;
mod dedup;
mod profile;
mod progress;
mod projector;
mod retry;
mod session_id;
mod stage_bars;
mod storage;
mod vector_cache;

use app::{
    session::{SearchMode, SearchSessionOrchestrator},
    AppFactory,
};
use cli::CollectionArgs;
use dedup::{DropReport, UploadFile};
use stage_bars::StageBars;

/// How often live stages are redrawn while a search runs.
const RENDER_INTERVAL: Duration = Duration::from_millis(150);

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: cli::Args) -> anyhow::Result<()> {
    let paths = AppFactory::get_paths()?;
    let session = AppFactory::create_session(&paths)?;

    let result = match args.command {
        cli::Command::Search {
            positives,
            negatives,
            wait,
        } => {
            if wait {
                wait_for_backend(&session).await?;
            }

            let report = session.add_positives(load_files(&positives).await?).await;
            print_notices(&report);
            let report = session.add_negatives(load_files(&negatives).await?);
            print_notices(&report);

            run_search(&session, SearchMode::Image).await
        }

        cli::Command::Text { prompt, collection } => {
            let collection_id = resolve_collection(&session, collection.as_deref()).await?;
            run_search(
                &session,
                SearchMode::Text {
                    prompt,
                    collection_id,
                },
            )
            .await
        }

        cli::Command::Generate { prompt, collection } => {
            let collection_id = resolve_collection(&session, collection.as_deref()).await?;
            run_search(
                &session,
                SearchMode::Generate {
                    prompt,
                    collection_id,
                },
            )
            .await
        }

        cli::Command::Show {} => {
            match session.response() {
                Some(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                None => println!("No search results yet"),
            }
            Ok(())
        }

        cli::Command::Reset { yes } => {
            if !yes {
                match inquire::prompt_confirmation("Forget the last search results?") {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            session.reset().await;
            println!("Session reset");
            Ok(())
        }

        cli::Command::History {} => {
            session.refresh_history().await;
            println!("{}", serde_json::to_string_pretty(&session.history())?);
            Ok(())
        }

        cli::Command::Collections { action } => match action {
            CollectionArgs::List {} => {
                let collections = session.collections().await?;
                println!("{}", serde_json::to_string_pretty(&collections)?);
                Ok(())
            }
            CollectionArgs::Create { name, description } => {
                let collection = session.create_collection(&name, description).await?;
                println!("{}", serde_json::to_string_pretty(&collection)?);
                Ok(())
            }
        },

        cli::Command::Wait {} => {
            wait_for_backend(&session).await?;
            println!("Search api is ready");
            Ok(())
        }
    };

    session.dispose();
    result
}

async fn load_files(paths: &[PathBuf]) -> anyhow::Result<Vec<UploadFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(UploadFile::load(path).await?);
    }
    Ok(files)
}

fn print_notices(report: &DropReport) {
    for notice in report.notices() {
        eprintln!("{notice}");
    }
}

async fn wait_for_backend(session: &SearchSessionOrchestrator) -> anyhow::Result<()> {
    if let Err(err) = session.wait_until_ready().await {
        bail!("search api is not reachable: {err}");
    }
    Ok(())
}

async fn resolve_collection(
    session: &SearchSessionOrchestrator,
    preferred: Option<&str>,
) -> anyhow::Result<Option<String>> {
    let resolved = session.resolve_collection(preferred).await?;
    if let (Some(preferred), None) = (preferred, &resolved) {
        bail!("Collection {preferred} does not exist");
    }
    Ok(resolved)
}

/// Run one search while redrawing its stages. Ctrl-C drops the search, which
/// also tears down its progress channel.
async fn run_search(session: &SearchSessionOrchestrator, mode: SearchMode) -> anyhow::Result<()> {
    let board = session.stage_board();
    let mut bars = StageBars::new();
    let mut ticker = tokio::time::interval(RENDER_INTERVAL);

    let search = session.start(mode);
    tokio::pin!(search);

    let outcome = loop {
        tokio::select! {
            outcome = &mut search => break Some(outcome),
            _ = ticker.tick() => bars.render(&board.snapshot()),
            _ = tokio::signal::ctrl_c() => break None,
        }
    };
    bars.finish();

    match outcome {
        Some(Ok(response)) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Some(Err(err)) => bail!("{err}"),
        None => bail!("Search cancelled"),
    }
}
