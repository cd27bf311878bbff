mod args;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::reload;

use batchd::server::Server;

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let initial_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let (filter, reload_handle) = reload::Layer::new(initial_level);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let on_sigusr1 = Box::new(move || {
        let _ = reload_handle.modify(|level| {
            *level = if *level == LevelFilter::DEBUG {
                LevelFilter::INFO
            } else {
                LevelFilter::DEBUG
            };
        });
    });

    match run(args, on_sigusr1).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args, on_sigusr1: Box<dyn FnMut() + Send>) -> anyhow::Result<()> {
    let server = Server::bind(&args.socket, args.maxjobs, on_sigusr1)
        .with_context(|| format!("binding socket at {}", args.socket.display()))?;

    info!(socket = %args.socket.display(), maxjobs = ?args.maxjobs, "listening");
    server.run().await
}
