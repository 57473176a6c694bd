mod args;
mod printer;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use swarmbit_lib::{SessionConfig, SessionState, TorrentDescriptor, TorrentSession};
use tokio::sync::mpsc;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::args::Arguments;
use crate::printer::ProgressPrinter;

const TRACING_ENV: &str = "SWARMBIT_LOG";

#[tokio::main]
#[tracing::instrument(err)]
async fn main() -> anyhow::Result<()> {
    setup_logger();

    let args = Arguments::parse();

    let raw_descriptor = tokio::fs::read(&args.descriptor)
        .await
        .with_context(|| format!("reading the descriptor: {:?}", args.descriptor))?;
    let descriptor = TorrentDescriptor::from_json(&raw_descriptor)?;
    tracing::info!(
        name = descriptor.name(),
        pieces = descriptor.number_of_pieces(),
        bytes = descriptor.total_length(),
        "loaded the descriptor"
    );

    let config = SessionConfig {
        self_addr: args.self_addr,
        ..SessionConfig::new(args.output_dir)
    };

    // Peers come from the command line only, the queue stays open until the session stops
    let (peer_tx, peer_rx) = mpsc::channel(args.peers.len().max(1));
    let mut session = TorrentSession::start(descriptor, config, peer_rx, Some(Arc::new(ProgressPrinter)));
    for peer in args.peers {
        peer_tx.send(peer).await.context("session exited before receiving peers")?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping the session");
        }
        state = wait_until_done(&session, args.no_seed) => {
            tracing::info!(?state, "session finished");
        }
    }

    session.stop().await.context("error while stopping the session")?;
    drop(peer_tx);

    Ok(())
}

async fn wait_until_done(session: &swarmbit_lib::SessionHandle, no_seed: bool) -> SessionState {
    if no_seed {
        session.wait_for(SessionState::Seeding).await
    } else {
        session.wait_for(SessionState::Stopped).await
    }
}

fn setup_logger() {
    let env_filter = EnvFilter::builder()
        .with_env_var(TRACING_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt().compact().with_env_filter(env_filter).finish();

    tracing::subscriber::set_global_default(subscriber).expect("Error setting a global tracing::subscriber");
}
