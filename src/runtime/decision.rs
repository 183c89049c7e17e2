//! Turn decision: whether this agent should speak now, and in which round.
//!
//! Pure over the message sequence so it can be re-derived at any point:
//! on every poll, when draining the pending queue, and before a backoff
//! retry re-enters admission.

use crate::message::{self, Body, Message};

/// What prompted a positive decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// No responses yet; answering the opening topic.
    Start,
    /// Answering the latest follow-up.
    Followup,
    /// Joining or advancing past the highest round.
    LastResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Turn {
    pub round: u32,
    pub trigger: Trigger,
}

/// Decide whether `agent` should respond given the current log contents.
///
/// Both round-advance paths and the follow-up path honor `max_rounds`.
pub fn should_respond(agent: &str, messages: &[Message], max_rounds: u32) -> Option<Turn> {
    let eff = message::effective(messages);
    if eff.iter().any(Message::is_end) {
        return None;
    }

    let start = eff.iter().find(|m| m.is_start())?;
    let Body::Start { participants, .. } = &start.body else {
        return None;
    };
    if !participants.iter().any(|p| p.eq_ignore_ascii_case(agent)) {
        return None;
    }

    let highest = message::highest_response_round(eff);
    let responded_in = |round: u32, name: &str| {
        eff.iter().any(|m| {
            matches!(&m.body, Body::Response { round: r, .. } if *r == round)
                && m.from.eq_ignore_ascii_case(name)
        })
    };

    // The latest follow-up steers the turn. A follow-up targeted at
    // someone else suppresses us entirely until a newer one arrives.
    if let Some(followup) = eff
        .iter()
        .rev()
        .find(|m| matches!(m.body, Body::Followup { .. }))
        && let Body::Followup { round, target, .. } = &followup.body
    {
        if let Some(target) = target
            && !target.eq_ignore_ascii_case(agent)
        {
            return None;
        }
        let followup_round = round.unwrap_or(highest + 1);
        if !responded_in(followup_round, agent) {
            if followup_round > max_rounds {
                return None;
            }
            return Some(Turn {
                round: followup_round,
                trigger: Trigger::Followup,
            });
        }
    }

    if highest == 0 {
        return Some(Turn {
            round: 1,
            trigger: Trigger::Start,
        });
    }

    if !responded_in(highest, agent) {
        let others_done = participants
            .iter()
            .filter(|p| !p.eq_ignore_ascii_case(agent))
            .filter(|p| responded_in(highest, p))
            .count();
        if others_done >= participants.len().saturating_sub(1) && highest < max_rounds {
            return Some(Turn {
                round: highest,
                trigger: Trigger::LastResponse,
            });
        }
        return None;
    }

    let everyone_done = participants.iter().all(|p| responded_in(highest, p));
    if everyone_done && highest < max_rounds {
        return Some(Turn {
            round: highest + 1,
            trigger: Trigger::LastResponse,
        });
    }

    None
}
