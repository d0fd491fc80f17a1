use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "datagen-server")]
#[command(about = "Runs scheduled test-data generation tasks")]
#[command(version)]
pub struct Args {
    /// Configuration file (falls back to DATAGEN_CONFIG, then ~/.datagen/datagen.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler and run until interrupted (default)
    Run,

    /// Describe a cron expression and print its next fire times
    Cron {
        /// Five-field cron expression, e.g. "*/5 * * * *"
        expression: String,

        /// IANA timezone to evaluate in (defaults to scheduler.default_timezone)
        #[arg(long)]
        tz: Option<String>,

        /// How many fire times to print
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}
