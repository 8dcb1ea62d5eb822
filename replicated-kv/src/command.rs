//! Commands that flow through the replicated log.
//!
//! The encoded form is the unit the consensus engine stores and replicates, so
//! it has to survive a lossless round trip on every replica:
//!
//! ```json
//! {"op":"set","key":"a","value":"1"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operations understood by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Set,
}

impl Op {
    fn parse(raw: &str) -> Result<Self, CommandError> {
        match raw {
            "set" => Ok(Op::Set),
            other => Err(CommandError::UnknownOp(other.to_string())),
        }
    }
}

/// A single replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    pub op: Op,
    pub key: String,
    pub value: String,
}

/// Wire shape used while decoding, so an unrecognised `op` can be reported
/// as such instead of as a generic parse failure.
#[derive(Deserialize)]
struct WireCommand {
    op: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognised command op {0:?}")]
    UnknownOp(String),
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: Op::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let wire: WireCommand = serde_json::from_slice(bytes)?;
        Ok(Self {
            op: Op::parse(&wire.op)?,
            key: wire.key,
            value: wire.value,
        })
    }
}
