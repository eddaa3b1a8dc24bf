//! Session channel wire protocol.
//!
//! Every frame is a JSON object carrying a `message_type` discriminant.
//! Outbound frames are produced with serde; inbound frames are interpreted
//! leniently because the server may omit optional fields or send values of
//! an unexpected type (e.g. a non-numeric `score`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::InteractionId;

/// Close code for a clean, expected shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when a close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Feedback shown when an evaluation arrives without text.
pub const MISSING_EVALUATION_TEXT: &str = "No evaluation text provided.";
/// Detail shown when a server error arrives without one.
pub const UNKNOWN_SERVER_ERROR: &str = "Unknown server error";

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Client → server message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Latest editor content.
    CodeUpdate {
        /// Full source text.
        code: String,
    },
    /// Answer to a previously received question.
    ResponseSubmitted {
        /// Interaction being answered.
        interaction_id: InteractionId,
        /// Free-text answer.
        response: String,
    },
}

impl OutboundMessage {
    /// Wire discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CodeUpdate { .. } => "code_update",
            Self::ResponseSubmitted { .. } => "response_submitted",
        }
    }

    /// Serialize to the JSON text frame sent over the channel.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// A question asked by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    /// Identifier to echo back in the response.
    pub interaction_id: InteractionId,
    /// Question text.
    pub question: String,
}

/// Feedback on a submitted response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Free-text feedback.
    pub feedback: String,
    /// Score in `[0, 1]`, when the server sent a numeric one.
    pub score: Option<f64>,
}

impl EvaluationResult {
    /// Score as a whole percentage, e.g. `0.8` → `"80%"`.
    pub fn score_percent(&self) -> Option<String> {
        self.score.map(|s| format!("{:.0}%", s * 100.0))
    }
}

/// Server → client message.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// A new question; supersedes any current interaction.
    Question(Interaction),
    /// Evaluation of the last submitted response.
    Evaluation(EvaluationResult),
    /// Server-reported failure. The connection stays open.
    Error {
        /// Human-readable detail.
        detail: String,
    },
    /// Any discriminant this client does not handle.
    Unknown {
        /// The unrecognized discriminant.
        message_type: String,
    },
}

impl InboundMessage {
    /// Interpret a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let Some(message_type) = obj.get("message_type").and_then(Value::as_str) else {
            return Err(ProtocolError::MissingDiscriminant);
        };

        match message_type {
            "question" => {
                let interaction_id =
                    id_field(&obj, "interaction_id").ok_or(ProtocolError::MissingField {
                        message_type: "question",
                        field: "interaction_id",
                    })?;
                let question = obj
                    .get("question")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField {
                        message_type: "question",
                        field: "question",
                    })?;
                Ok(Self::Question(Interaction {
                    interaction_id,
                    question: question.to_owned(),
                }))
            }
            "evaluation_result" => Ok(Self::Evaluation(EvaluationResult {
                feedback: non_empty_str(&obj, "evaluation")
                    .unwrap_or(MISSING_EVALUATION_TEXT)
                    .to_owned(),
                score: obj.get("score").and_then(Value::as_f64),
            })),
            "error" => Ok(Self::Error {
                detail: non_empty_str(&obj, "detail")
                    .unwrap_or(UNKNOWN_SERVER_ERROR)
                    .to_owned(),
            }),
            other => Ok(Self::Unknown {
                message_type: other.to_owned(),
            }),
        }
    }
}

/// Interaction ids are stored as integers server-side; accept either form.
fn id_field(obj: &Map<String, Value>, key: &str) -> Option<InteractionId> {
    match obj.get(key)? {
        Value::String(s) if !s.is_empty() => Some(InteractionId::from(s.as_str())),
        Value::Number(n) => Some(InteractionId::from(n.to_string())),
        _ => None,
    }
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
