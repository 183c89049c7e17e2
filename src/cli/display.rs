use console::style;

use crate::discussion::DiscussionStatus;
use crate::message::{Body, Message};

pub struct Display;

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("error:").bold().red(), message);
    }

    pub fn print_status(&self, status: &DiscussionStatus) {
        let state = if status.ended {
            style("ended").red()
        } else {
            style("active").green()
        };
        println!(
            "{}  {}  [{}]",
            style(&status.id).bold(),
            status.topic,
            state
        );
        println!(
            "    Participants: {}  Round: {}  Messages: {}",
            status.participants.join(", "),
            status.current_round,
            status.message_count
        );
        if let Some(decision) = &status.decision {
            println!(
                "    Decision: {} (consensus: {})",
                style(decision).bold(),
                status.consensus.unwrap_or(false)
            );
        }
    }

    pub fn print_message(&self, message: &Message) {
        let ts = message.ts.format("%H:%M:%S");
        let from = style(&message.from).bold();
        match &message.body {
            Body::Start { topic, .. } => {
                println!("[{ts}] {from} opened: {topic}");
            }
            Body::Response {
                round,
                opinion,
                content,
                confidence,
            } => {
                println!(
                    "[{ts}] {from} (round {round}, {:?}, {confidence:.2}):",
                    opinion
                );
                for line in content.trim().lines() {
                    println!("    {line}");
                }
            }
            Body::Followup {
                content, target, ..
            } => {
                let addressee = target.as_deref().unwrap_or("everyone");
                println!("[{ts}] {from} → {addressee}: {content}");
            }
            Body::End {
                decision,
                consensus,
            } => {
                println!(
                    "[{ts}] {from} ended: {} (consensus: {consensus})",
                    style(decision).bold()
                );
            }
            Body::Error { error, round } => {
                let round = round.map(|r| format!(" round {r}")).unwrap_or_default();
                println!("[{ts}] {from}{round} {}: {error}", style("error").red());
            }
            Body::Status {
                status, content, ..
            } => {
                println!("[{ts}] {from} {:?}: {}", status, style(content).dim());
            }
            Body::Unknown(_) => {
                println!("[{ts}] {from}: {}", style("(unrecognized record)").dim());
            }
        }
    }
}
