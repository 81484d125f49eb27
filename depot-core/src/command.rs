//! Payload carried by the replicated log.

use crate::artifact::ArtifactKind;
use crate::error::{DepotError, Result};
use crate::request::{ArtifactRequest, OpType, base64_bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation tag plus the JSON-encoded request. The tag's high byte is the
/// kind namespace and the low byte the op code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedCommand {
    pub tag: u16,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl ReplicatedCommand {
    pub fn encode(request: &ArtifactRequest) -> Result<Self> {
        if !request.op_type.is_mutating() {
            return Err(DepotError::Unsupported(format!(
                "{} is not a replicated operation",
                request.op_type
            )));
        }

        Ok(Self {
            tag: tag_of(request.kind, request.op_type),
            payload: serde_json::to_vec(request)?,
        })
    }

    /// Resolves the tag into a kind and a mutating op.
    pub fn target(&self) -> Result<(ArtifactKind, OpType)> {
        let kind = ArtifactKind::from_namespace((self.tag >> 8) as u8).ok_or_else(|| {
            DepotError::Unsupported(format!("unknown command tag {:#06x}", self.tag))
        })?;
        let op = op_from_code((self.tag & 0xff) as u8).ok_or_else(|| {
            DepotError::Unsupported(format!("unknown command tag {:#06x}", self.tag))
        })?;

        if !op.is_mutating() {
            return Err(DepotError::Unsupported(format!(
                "read-only operation {} cannot be applied",
                op
            )));
        }

        Ok((kind, op))
    }

    /// Decodes the payload; the tag wins over kind/op fields in the payload.
    pub fn decode(&self) -> Result<ArtifactRequest> {
        let (kind, op) = self.target()?;
        let mut request: ArtifactRequest = serde_json::from_slice(&self.payload)?;
        request.kind = kind;
        request.op_type = op;
        Ok(request)
    }
}

impl fmt::Display for ReplicatedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Ok((kind, op)) => write!(f, "{}:{}", kind, op),
            Err(_) => write!(f, "tag:{:#06x}", self.tag),
        }
    }
}

pub fn tag_of(kind: ArtifactKind, op: OpType) -> u16 {
    ((kind.namespace() as u16) << 8) | op_code(op) as u16
}

fn op_code(op: OpType) -> u8 {
    match op {
        OpType::Create => 0x01,
        OpType::Upload => 0x02,
        OpType::Remove => 0x03,
        OpType::RemoveTombstone => 0x04,
        OpType::RestoreTombstone => 0x05,
        OpType::Info => 0x10,
        OpType::TombstoneInfo => 0x11,
        OpType::List => 0x12,
        OpType::ListVersion => 0x13,
        OpType::TombstoneList => 0x14,
        OpType::TombstoneListVersion => 0x15,
        OpType::Download => 0x16,
    }
}

fn op_from_code(code: u8) -> Option<OpType> {
    let op = match code {
        0x01 => OpType::Create,
        0x02 => OpType::Upload,
        0x03 => OpType::Remove,
        0x04 => OpType::RemoveTombstone,
        0x05 => OpType::RestoreTombstone,
        0x10 => OpType::Info,
        0x11 => OpType::TombstoneInfo,
        0x12 => OpType::List,
        0x13 => OpType::ListVersion,
        0x14 => OpType::TombstoneList,
        0x15 => OpType::TombstoneListVersion,
        0x16 => OpType::Download,
        _ => return None,
    };
    Some(op)
}
