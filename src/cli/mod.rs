//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "docqa",
    version,
    author = "neur0map",
    about = "Confidence-gated hybrid retrieval over a private document corpus",
    long_about = "docqa indexes text chunks with BM25 and dense embeddings, fuses and reranks \
                  candidates, and refuses to answer when retrieval confidence is too low."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/docqa/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rebuild the index from a chunk file
    Index {
        /// JSON array of strings, or plain text with chunks separated by blank lines
        file: PathBuf,
    },

    /// Retrieve and gate hits for a question
    Ask {
        /// Question to ask
        query: String,

        /// Caller id used for the A/B strategy bucket
        #[arg(short, long, default_value = "0")]
        user: u64,

        /// Skip query expansion
        #[arg(long)]
        no_expand: bool,

        /// Also generate an answer from accepted hits and meter its tokens
        #[arg(short, long)]
        generate: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show index and usage status
    Status,

    /// Show this month's generation token usage
    Usage,

    /// Check that the model service is reachable
    Health,

    /// List recent questions that were not answered
    Unanswered {
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ask_arguments() {
        let cli = Cli::try_parse_from(["docqa", "ask", "how many weeks", "--user", "42", "--no-expand"])
            .unwrap();
        match cli.command {
            Commands::Ask {
                query,
                user,
                no_expand,
                generate,
                json,
            } => {
                assert_eq!(query, "how many weeks");
                assert_eq!(user, 42);
                assert!(no_expand);
                assert!(!generate);
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
