use std::path::Path;

use crate::message::{Body, Message};

/// Everything a turn prompt is assembled from.
pub struct PromptContext<'a> {
    pub agent: &'a str,
    pub topic: &'a str,
    pub participants: &'a [String],
    pub working_dir: Option<&'a Path>,
    pub round: u32,
    pub messages: &'a [Message],
}

/// Build the prompt handed to the external CLI.
///
/// The identity contract is load-bearing: the first non-empty output line
/// must be `AGENT:<name>`, and the agent must not speak for other
/// participants. Validation downstream enforces both.
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are the agent \"{}\" in a multi-agent technical discussion.\n",
        ctx.agent
    ));
    prompt.push_str(&format!("Topic: {}\n", ctx.topic));
    prompt.push_str(&format!("Participants: {}\n", ctx.participants.join(", ")));
    if let Some(dir) = ctx.working_dir {
        prompt.push_str(&format!("Working directory: {}\n", dir.display()));
    }
    if ctx.round > 1 {
        prompt.push_str(&format!(
            "This is round {}. Address the latest arguments from the other participants.\n",
            ctx.round
        ));
    }

    prompt.push_str("\nDiscussion so far:\n");
    prompt.push_str(&render_history(ctx.messages));

    prompt.push_str(&format!(
        "\nRules:\n\
         - The first non-empty line of your output MUST be exactly: AGENT:{}\n\
         - Speak only as {}. Never role-play or answer for other participants.\n\
         - State clearly whether you agree, disagree, propose an alternative, or stay neutral.\n\
         - Optionally include a line \"confidence: <0..1>\".\n",
        ctx.agent, ctx.agent
    ));

    prompt
}

/// Stable textual rendering of the message history.
fn render_history(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        match &m.body {
            Body::Start { topic, .. } => {
                out.push_str(&format!("[{}] {} opened: {}\n", m.seq, m.from, topic));
            }
            Body::Response {
                round,
                opinion,
                content,
                confidence,
            } => {
                out.push_str(&format!(
                    "[{}] {} (round {}, {:?}, {:.2}): {}\n",
                    m.seq,
                    m.from,
                    round,
                    opinion,
                    confidence,
                    content.trim()
                ));
            }
            Body::Followup {
                content, target, ..
            } => {
                let addressee = target.as_deref().unwrap_or("everyone");
                out.push_str(&format!(
                    "[{}] {} asked {}: {}\n",
                    m.seq,
                    m.from,
                    addressee,
                    content.trim()
                ));
            }
            Body::End { decision, .. } => {
                out.push_str(&format!("[{}] {} ended: {}\n", m.seq, m.from, decision));
            }
            Body::Error { error, .. } => {
                out.push_str(&format!("[{}] {} error: {}\n", m.seq, m.from, error));
            }
            // Status chatter and unrecognized records add nothing.
            Body::Status { .. } | Body::Unknown(_) => {}
        }
    }
    out
}
