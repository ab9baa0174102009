//! Parsing of the oracle's unified-analysis response.
//!
//! The oracle is asked for a strictly-shaped JSON object, but real responses
//! arrive wrapped in markdown code fences, with missing fields, or as prose.
//! The parser is lenient about the wrapping and strict about the shape:
//! unknown fields are ignored silently, and anything that cannot be parsed
//! at all yields `None` so the caller can complete the task without
//! mutation instead of poisoning the queue.

use log::debug;
use serde::Deserialize;

/// The worker's tagged view of an oracle analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleDecision {
    /// The interaction carries no knowledge worth storing.
    Discard,
    /// The knowledge is already covered; keep the existing entry as is.
    Keep,
    /// Store a new entry.
    Insert {
        content: String,
        entities: Vec<String>,
        problem_class: String,
    },
    /// Merge into the existing entry `target_id`.
    Update {
        target_id: i64,
        content: String,
        entities: Vec<String>,
        problem_class: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    should_store: bool,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    target_doc_id: Option<i64>,
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    entities: Option<Vec<String>>,
    #[serde(default)]
    problem_class: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Remove a surrounding markdown code fence, if any.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + "```json".len()..];
        let end = rest.find("```").unwrap_or(rest.len());
        return rest[..end].trim();
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + "```".len()..];
        let end = rest.find("```").unwrap_or(rest.len());
        return rest[..end].trim();
    }
    trimmed
}

/// Parse an oracle response into a decision.
///
/// Returns `None` when the response is empty or not valid JSON. An `UPDATE`
/// without a target id and any unknown action both degrade to `Insert`
/// (store rather than lose the knowledge).
pub fn parse_decision(raw: &str) -> Option<OracleDecision> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return None;
    }
    let parsed: RawAnalysis = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!("oracle response is not valid JSON: {err}");
            return None;
        }
    };

    if let Some(rationale) = &parsed.rationale {
        debug!("oracle rationale: {rationale}");
    }
    if !parsed.should_store {
        return Some(OracleDecision::Discard);
    }

    let content = parsed.analysis.unwrap_or_default();
    let entities = parsed.entities.unwrap_or_default();
    let problem_class = parsed.problem_class.unwrap_or_default();
    let action = parsed
        .action
        .as_deref()
        .unwrap_or("NEW")
        .to_ascii_uppercase();

    match action.as_str() {
        "KEPT" => Some(OracleDecision::Keep),
        "UPDATE" => match parsed.target_doc_id {
            Some(target_id) => Some(OracleDecision::Update {
                target_id,
                content,
                entities,
                problem_class,
            }),
            None => Some(OracleDecision::Insert {
                content,
                entities,
                problem_class,
            }),
        },
        _ => Some(OracleDecision::Insert {
            content,
            entities,
            problem_class,
        }),
    }
}
