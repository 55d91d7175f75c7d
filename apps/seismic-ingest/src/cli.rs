use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "seismic-ingest",
    version,
    about = "SeedLink waveform ingest into QuestDB"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Stream the configured feeds into the store (default).
    Run,
    /// Verify the store is reachable and the events table exists.
    CheckStore,
    /// Print counts and recent samples from the events table.
    Report(ReportArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ReportArgs {
    #[arg(long, default_value_t = 10)]
    pub recent: u32,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}
