//! Uses clap to define the CLI interface declaratively.
use std::path::PathBuf;

use clap::{command, Parser};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// read packets from a trace file; a `prefix::` selects the source type
    #[arg(short = 'r', long = "read", value_name = "TRACE")]
    pub traces: Vec<String>,

    /// write processed packets to a dump file
    #[arg(short = 'w', long = "write", value_name = "DUMP")]
    pub write: Option<String>,

    #[arg(short, default_value = "iomux.toml", long, value_name = "FILE")]
    pub config: PathBuf,
}
