//! Validation and parsing of raw agent output.
//!
//! An agent's CLI must open with an `AGENT:<name>` header matching the
//! local agent, speak only as itself, and leave a non-empty body. The
//! opinion and confidence heuristics are pattern-based and bilingual;
//! treat them as tuned constants.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::message::Opinion;

pub const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Chinese phrase the closure dedup matches against.
const CLOSURE_MARK: &str = "可以结束";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("missing AGENT header")]
    MissingHeader,

    #[error("agent mismatch: claimed '{0}'")]
    AgentMismatch(String),

    #[error("empty body")]
    EmptyBody,

    #[error("reply claims to be '{0}'")]
    ForeignIdentity(String),

    #[error("reply contrasts the agent with itself")]
    SelfContradiction,
}

static HEADER_PATTERN: OnceLock<Regex> = OnceLock::new();

fn header_pattern() -> &'static Regex {
    HEADER_PATTERN.get_or_init(|| Regex::new(r"(?i)^AGENT\s*:\s*(.+)$").unwrap())
}

static CONFIDENCE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn confidence_pattern() -> &'static Regex {
    CONFIDENCE_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:confidence|置信度)\s*[:：]\s*([0-9]+(?:\.[0-9]+)?)").unwrap()
    })
}

static SELF_CONTRAST_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Phrases contrasting the speaker with a named agent. The captured name
/// is compared against the local identity by the caller.
fn self_contrast_pattern() -> &'static Regex {
    SELF_CONTRAST_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)与\s*(\S+)\s*不同|different\s+from\s+(\S+)").unwrap()
    })
}

static IDENTITY_CLAIM_PATTERN: OnceLock<Regex> = OnceLock::new();

fn identity_claim_pattern() -> &'static Regex {
    IDENTITY_CLAIM_PATTERN.get_or_init(|| Regex::new(r"(?i)(?:我是|i\s+am)\s*(\S+)").unwrap())
}

/// Case-insensitive check that the captured token starts with the name,
/// so trailing punctuation (`claude's`, `codex，`) still counts.
fn names_match(captured: &str, name: &str) -> bool {
    captured
        .get(..name.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(name))
}

static OPINION_PATTERNS: OnceLock<Vec<(Regex, Opinion)>> = OnceLock::new();

/// Ordered, first match wins. Disagreement is checked before agreement
/// because `不同意` and `disagree` contain their positive counterparts.
fn opinion_patterns() -> &'static [(Regex, Opinion)] {
    OPINION_PATTERNS.get_or_init(|| {
        [
            (r"(?i)不同意|不赞成|反对|强烈反对|disagree|cannot\s+agree|don'?t\s+agree", Opinion::Disagree),
            (r"(?i)同意|赞成|没有异议|agree|agreed|sounds\s+good|支持这个", Opinion::Agree),
            (
                r"(?i)另一种方案|替代方案|建议改用|不如改用|alternative(?:ly)?|instead\s+of|a\s+different\s+approach",
                Opinion::Alternative,
            ),
            (r"(?i)中立|保持中立|neutral|no\s+strong\s+opinion", Opinion::Neutral),
        ]
        .into_iter()
        .map(|(pattern, opinion)| (Regex::new(pattern).unwrap(), opinion))
        .collect()
    })
}

/// Validate raw output against the local agent identity and return the
/// body (everything after the header line).
pub fn validate_reply(
    raw: &str,
    agent: &str,
    participants: &[String],
) -> Result<String, ReplyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ReplyError::MissingHeader);
    }

    let mut lines = trimmed.lines();
    let header = lines
        .find(|line| !line.trim().is_empty())
        .ok_or(ReplyError::MissingHeader)?;

    let captures = header_pattern()
        .captures(header.trim())
        .ok_or(ReplyError::MissingHeader)?;
    let claimed = captures[1].trim();
    if !claimed.eq_ignore_ascii_case(agent) {
        return Err(ReplyError::AgentMismatch(claimed.to_string()));
    }

    let body = lines.collect::<Vec<_>>().join("\n");
    let body = body.trim();
    if body.is_empty() {
        return Err(ReplyError::EmptyBody);
    }

    for captures in self_contrast_pattern().captures_iter(body) {
        if let Some(named) = captures.get(1).or_else(|| captures.get(2))
            && names_match(named.as_str(), agent)
        {
            return Err(ReplyError::SelfContradiction);
        }
    }

    for captures in identity_claim_pattern().captures_iter(body) {
        let Some(named) = captures.get(1) else {
            continue;
        };
        for other in participants {
            if other.eq_ignore_ascii_case(agent) {
                continue;
            }
            if names_match(named.as_str(), other) {
                return Err(ReplyError::ForeignIdentity(other.clone()));
            }
        }
    }

    Ok(body.to_string())
}

/// First matching opinion pattern wins; no match means neutral.
pub fn parse_opinion(body: &str) -> Opinion {
    for (pattern, opinion) in opinion_patterns() {
        if pattern.is_match(body) {
            return *opinion;
        }
    }
    Opinion::Neutral
}

/// `confidence: <number>`; values above 1 read as percentages; clamped.
pub fn parse_confidence(body: &str) -> f64 {
    let Some(captures) = confidence_pattern().captures(body) else {
        return DEFAULT_CONFIDENCE;
    };
    let Ok(mut value) = captures[1].parse::<f64>() else {
        return DEFAULT_CONFIDENCE;
    };
    if value > 1.0 {
        value /= 100.0;
    }
    value.clamp(0.0, 1.0)
}

/// Suffix an agreeing reply with the standard closing sentence naming the
/// counterpart, unless the closure phrase is already present.
pub fn ensure_closure(body: &str, counterpart: &str) -> String {
    if body.contains(CLOSURE_MARK) {
        return body.to_string();
    }
    format!("{body}\n\n我同意{counterpart}的观点，这个讨论可以结束了。")
}

/// A validated, parsed agent reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub body: String,
    pub opinion: Opinion,
    pub confidence: f64,
}

impl ParsedReply {
    /// Full pipeline: identity validation, then opinion and confidence.
    pub fn parse(raw: &str, agent: &str, participants: &[String]) -> Result<Self, ReplyError> {
        let body = validate_reply(raw, agent, participants)?;
        let opinion = parse_opinion(&body);
        let confidence = parse_confidence(&body);
        Ok(Self {
            body,
            opinion,
            confidence,
        })
    }
}
