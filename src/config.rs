//! Startup arguments.

use clap::Parser;

const DEFAULT_SOCK_PATH: &str = "/tmp/sigflowd.sock";

#[derive(clap::Parser, Debug)]
#[command(version, about = "Event-driven audio capture and signal-processing host daemon")]
pub struct Args {
    /// Control socket path.
    #[arg(short = 's', long = "sock", default_value = DEFAULT_SOCK_PATH)]
    pub sock_path: String,

    /// Suppress the welcome banner sent to newly accepted connections.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl Args {
    pub fn parse_from_env() -> Self {
        Args::parse()
    }
}
