//! Replicated command framing.
//!
//! A proposal is `[type_tag: u8][serialized request message]`. One type
//! exists today; the tag space leaves room for more, and tags this build does
//! not know are applied as no-ops so newer peers can replicate to older ones.

use loghouse_proto::v1::{ProduceRequest, Record};
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Tag for an append proposal carrying a [`ProduceRequest`].
pub const APPEND_REQUEST: u8 = 0;

/// A decoded replicated command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Append one record to the log.
    Append(ProduceRequest),
    /// A tag this build does not know. Applied as a no-op.
    Unknown(u8),
}

impl Command {
    /// Builds an append command for `record`.
    pub fn append(record: Record) -> Self {
        Command::Append(ProduceRequest {
            record: Some(record),
        })
    }

    /// Encodes the command into its wire frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Append(req) => {
                let mut frame = vec![APPEND_REQUEST];
                frame.extend(req.encode_to_vec());
                frame
            }
            Command::Unknown(tag) => vec![*tag],
        }
    }

    /// Decodes a wire frame. An empty frame is invalid; an unknown tag is
    /// preserved as [`Command::Unknown`].
    pub fn decode(frame: &[u8]) -> ClusterResult<Self> {
        match frame.split_first() {
            Some((&APPEND_REQUEST, rest)) => Ok(Command::Append(ProduceRequest::decode(rest)?)),
            Some((&tag, _)) => Ok(Command::Unknown(tag)),
            None => Err(ClusterError::InvalidCommand),
        }
    }
}

/// Response the state machine routes back to the proposer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Offset assigned to the appended record, when the command was an
    /// append that succeeded.
    pub offset: Option<u64>,
    /// Error message when the command failed to apply.
    pub error: Option<String>,
}

impl CommandResponse {
    /// A successful response with no payload.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A successful append response.
    pub fn with_offset(offset: u64) -> Self {
        Self {
            offset: Some(offset),
            error: None,
        }
    }

    /// A failed response.
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            offset: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_roundtrip() {
        let cmd = Command::append(Record {
            value: b"payload".to_vec(),
            ..Default::default()
        });
        let frame = cmd.encode();
        assert_eq!(frame[0], APPEND_REQUEST);

        match Command::decode(&frame).expect("decode") {
            Command::Append(req) => {
                assert_eq!(req.record.expect("record").value, b"payload");
            }
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_noop() {
        match Command::decode(&[42, 1, 2, 3]).expect("decode") {
            Command::Unknown(42) => {}
            other => panic!("expected unknown tag, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_frame_is_invalid() {
        assert!(matches!(
            Command::decode(&[]),
            Err(ClusterError::InvalidCommand)
        ));
    }
}
