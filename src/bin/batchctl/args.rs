use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Path of the server's Unix socket.
    #[arg(short = 'f', long, default_value = ".cse376hw4.socket")]
    pub socket: PathBuf,
    /// Login name to present to the server.
    pub name: String,
}
