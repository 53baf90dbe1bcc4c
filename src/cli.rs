use clap::{Args, Parser as ClapParser, Subcommand};
use std::path::PathBuf;

#[derive(ClapParser, Debug)]
#[command(
    author,
    version,
    about = "Code navigation queries for C# workspaces",
    long_about = "Definition, references, call hierarchy and diagnostics for \
    C#-style workspaces, served by a per-workspace background daemon that is \
    started on demand and shuts itself down when idle."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Solution/project file or directory; defaults to the nearest manifest
    /// at or above the current directory
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Print raw JSON result envelopes instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    /// Idle timeout (minutes) passed to a daemon spawned by this invocation
    #[arg(long, global = true)]
    pub idle_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Jump to the definition of the symbol at a position
    Definition(PositionArgs),
    /// Jump to the overridden or interface-declared symbol
    #[command(name = "base-definition")]
    BaseDefinition(PositionArgs),
    /// List implementations of a type or member
    Implementations(PositionArgs),
    /// List references to the symbol at a position
    References {
        #[command(flatten)]
        position: PositionArgs,
        /// Also list the definition site(s), first
        #[arg(long)]
        include_definition: bool,
    },
    /// List call sites of the symbol at a position
    Callers(PositionArgs),
    /// List symbols invoked from the body of the symbol at a position
    Callees(PositionArgs),
    /// Show metadata for the symbol at a position
    Symbol(PositionArgs),
    /// Show diagnostics for the workspace or one file
    Diagnostics {
        /// Restrict to one file
        file: Option<String>,
        /// Leave warnings out
        #[arg(long)]
        no_warnings: bool,
        /// Include informational diagnostics
        #[arg(long)]
        info: bool,
    },
    /// Report whether the workspace daemon is running and responsive
    Status,
    /// Round-trip a ping through the daemon
    Ping,
    /// Ask the workspace daemon to shut down
    Stop,
}

#[derive(Args, Debug)]
pub struct PositionArgs {
    /// Source file, absolute or workspace-relative
    pub file: String,
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
}
