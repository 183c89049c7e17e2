use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::BASE_DIR_ENV;

#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about = "Multi-agent discussion daemon for AI CLI assistants", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Discussion log directory (default: ./discussions)
    #[arg(long, global = true, env = BASE_DIR_ENV)]
    pub base_dir: Option<PathBuf>,
}

/// Which agent daemon to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentArg {
    Claude,
    Codex,
}

impl AgentArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent daemon until interrupted
    Run {
        /// Agent identity to assume
        #[arg(long, value_enum)]
        agent: AgentArg,
    },

    /// Start a new discussion
    Create {
        /// Discussion topic
        topic: String,

        /// Participating agents, comma separated
        #[arg(long, value_delimiter = ',', default_value = "claude,codex")]
        participants: Vec<String>,

        /// Working directory agents should operate in
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Ask a follow-up question in an active discussion
    Ask {
        /// Discussion ID
        id: String,

        /// The follow-up question
        question: String,

        /// Address only this agent (default: broadcast)
        #[arg(long)]
        target: Option<String>,
    },

    /// End a discussion with a decision
    End {
        /// Discussion ID
        id: String,

        /// Final decision text
        decision: String,

        /// Mark the decision as consensual
        #[arg(long)]
        consensus: bool,
    },

    /// Show discussion status
    Status {
        /// Discussion ID (optional, shows all if not specified)
        id: Option<String>,
    },

    /// List discussions
    List {
        /// Only active discussions
        #[arg(long)]
        active: bool,
    },

    /// Tail a discussion, printing new messages as they arrive
    Watch {
        /// Discussion ID
        id: String,
    },
}
