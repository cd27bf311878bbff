mod args;
mod repl;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio_stream::StreamExt;
use tracing::warn;

use batchd::proto::{self, Frame};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let stream = UnixStream::connect(&args.socket)
        .await
        .with_context(|| format!("connecting to {}", args.socket.display()))?;
    let mut framed = proto::framed(stream);

    framed
        .send(Frame::Login {
            name: args.name.into_bytes(),
        })
        .await
        .context("sending LOGIN")?;

    match framed.next().await {
        Some(Ok(Frame::Ack)) => {},
        Some(Ok(_)) | None => anyhow::bail!("login rejected"),
        Some(Err(e)) => return Err(e).context("reading LOGIN response"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match repl::parse(&line) {
                    Ok(Some(repl::Command::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Some(frame) = repl::to_frame(cmd) {
                            if framed.send(frame).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(None) => {},
                    Err(msg) => println!("{msg}"),
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => repl::print_frame(&frame),
                    Some(Err(e)) => {
                        warn!(error = %e, "protocol error, disconnecting");
                        break;
                    },
                    None => {
                        println!("server closed the connection");
                        break;
                    },
                }
            }
        }
    }

    Ok(())
}
