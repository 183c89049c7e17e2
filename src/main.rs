use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use parley::agent::{AgentProfile, CliBackend};
use parley::cli::{AgentArg, Cli, Commands, Display};
use parley::config::ParleyConfig;
use parley::discussion::DiscussionLog;
use parley::error::Result;
use parley::message::CONTEXT_WORKING_DIR;
use parley::runtime::AgentRuntime;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("parley=debug")
    } else {
        EnvFilter::new("parley=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = ParleyConfig::load(&std::env::current_dir()?).await?;
    let base_dir = cli
        .base_dir
        .clone()
        .unwrap_or_else(|| config.resolved_base_dir());
    let log = DiscussionLog::with_config(&base_dir, &config.log);
    let display = Display::new();

    match cli.command {
        Commands::Run { agent } => cmd_run(agent, config, log).await,
        Commands::Create {
            topic,
            participants,
            working_dir,
        } => cmd_create(&display, &log, &topic, participants, working_dir).await,
        Commands::Ask {
            id,
            question,
            target,
        } => {
            let stamped = log.append_followup(&id, question, target).await?;
            display.print_message(&stamped);
            Ok(())
        }
        Commands::End {
            id,
            decision,
            consensus,
        } => {
            let stamped = log.append_end(&id, decision, consensus).await?;
            display.print_message(&stamped);
            Ok(())
        }
        Commands::Status { id } => cmd_status(&display, &log, id).await,
        Commands::List { active } => cmd_list(&display, &log, active).await,
        Commands::Watch { id } => cmd_watch(&display, &log, &id).await,
    }
}

/// Run one agent daemon until interrupted. Exit code is nonzero only when
/// startup fails: unknown agent, missing binary, unwritable base dir.
async fn cmd_run(agent: AgentArg, config: ParleyConfig, log: DiscussionLog) -> Result<()> {
    let profile = AgentProfile::by_name(agent.as_str(), &config.agents)?;
    profile.resolve_binary()?;

    let mut backend = CliBackend::new(profile, &config.invoker);
    if let Some(dir) = &config.agents.working_dir {
        backend = backend.with_default_working_dir(dir);
    }

    let runtime = AgentRuntime::new(Arc::new(backend), log, config.runtime.clone());
    runtime.start().await?;

    wait_for_interrupt().await;
    runtime.stop();
    Ok(())
}

async fn cmd_create(
    display: &Display,
    log: &DiscussionLog,
    topic: &str,
    participants: Vec<String>,
    working_dir: Option<PathBuf>,
) -> Result<()> {
    let mut context = BTreeMap::new();
    if let Some(dir) = working_dir {
        context.insert(
            CONTEXT_WORKING_DIR.to_string(),
            serde_json::Value::String(dir.display().to_string()),
        );
    }

    let (id, start) = log.create(topic, participants, context).await?;
    display.print_header(&format!("Discussion {id}"));
    display.print_message(&start);
    Ok(())
}

async fn cmd_status(display: &Display, log: &DiscussionLog, id: Option<String>) -> Result<()> {
    match id {
        Some(id) => {
            let status = log.status(&id).await?;
            display.print_status(&status);
            for message in log.read_all(&id).await? {
                display.print_message(&message);
            }
        }
        None => {
            for id in log.list().await? {
                match log.status(&id).await {
                    Ok(status) => display.print_status(&status),
                    Err(e) => display.print_error(&format!("{id}: {e}")),
                }
            }
        }
    }
    Ok(())
}

async fn cmd_list(display: &Display, log: &DiscussionLog, active: bool) -> Result<()> {
    let ids = if active {
        log.list_active().await?
    } else {
        log.list().await?
    };
    for id in ids {
        match log.status(&id).await {
            Ok(status) => display.print_status(&status),
            Err(e) => display.print_error(&format!("{id}: {e}")),
        }
    }
    Ok(())
}

async fn cmd_watch(display: &Display, log: &DiscussionLog, id: &str) -> Result<()> {
    display.print_header(&format!("Watching {id}"));

    // The first tick replays existing history, then only new tails arrive.
    let handle = log.watch(id, Duration::from_secs(1), move |tail| {
        let display = Display::new();
        for message in tail {
            display.print_message(message);
        }
    });

    wait_for_interrupt().await;
    handle.stop();
    Ok(())
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for interrupt");
    }
}
