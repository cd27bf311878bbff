use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Path of the Unix socket to listen on. Refuses to start if it already exists.
    #[arg(short = 'f', long, default_value = ".cse376hw4.socket")]
    pub socket: PathBuf,
    /// Enables debug-level logging at startup (can also be toggled at runtime with SIGUSR1).
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    /// Maximum number of jobs running concurrently. Unlimited if unset.
    #[arg(short = 'n', long)]
    pub maxjobs: Option<u32>,
}
