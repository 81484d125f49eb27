//! Request/response vocabulary shared by the HTTP API, the replicated log and
//! the transfer client.

use crate::artifact::{Artifact, ArtifactKind, Version};
use crate::error::DepotError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Create,
    Upload,
    Remove,
    RemoveTombstone,
    RestoreTombstone,
    Info,
    TombstoneInfo,
    List,
    ListVersion,
    TombstoneList,
    TombstoneListVersion,
    Download,
}

impl OpType {
    /// Mutating ops travel through the replicated log, read-only ops are
    /// served by the local replica.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            OpType::Create
                | OpType::Upload
                | OpType::Remove
                | OpType::RemoveTombstone
                | OpType::RestoreTombstone
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Create => "CREATE",
            OpType::Upload => "UPLOAD",
            OpType::Remove => "REMOVE",
            OpType::RemoveTombstone => "REMOVE_TOMBSTONE",
            OpType::RestoreTombstone => "RESTORE_TOMBSTONE",
            OpType::Info => "INFO",
            OpType::TombstoneInfo => "TOMBSTONE_INFO",
            OpType::List => "LIST",
            OpType::ListVersion => "LIST_VERSION",
            OpType::TombstoneList => "TOMBSTONE_LIST",
            OpType::TombstoneListVersion => "TOMBSTONE_LIST_VERSION",
            OpType::Download => "DOWNLOAD",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[default]
    Success,
    NotLeader,
    InputParamError,
    InternalError,
    ParseToPbFail,
    ParseFromPbFail,
    UnsupportedRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub op_type: OpType,
    pub kind: ArtifactKind,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl ArtifactRequest {
    pub fn new(op_type: OpType, kind: ArtifactKind, name: impl Into<String>) -> Self {
        Self {
            op_type,
            kind,
            name: name.into(),
            names: Vec::new(),
            version: None,
            size: 0,
            checksum: String::new(),
            ext: String::new(),
            created_at: None,
            content: None,
            offset: 0,
            count: 0,
            data: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn create(
        kind: ArtifactKind,
        name: impl Into<String>,
        version: Version,
        size: i64,
        checksum: impl Into<String>,
    ) -> Self {
        let mut request = Self::new(OpType::Create, kind, name).with_version(version);
        request.size = size;
        request.checksum = checksum.into();
        request
    }

    pub fn upload(
        kind: ArtifactKind,
        name: impl Into<String>,
        version: Version,
        offset: i64,
        data: Vec<u8>,
    ) -> Self {
        let mut request = Self::new(OpType::Upload, kind, name).with_version(version);
        request.offset = offset;
        request.count = data.len() as i64;
        request.data = data;
        request
    }

    pub fn download(
        kind: ArtifactKind,
        name: impl Into<String>,
        version: Version,
        offset: i64,
        count: i64,
    ) -> Self {
        let mut request = Self::new(OpType::Download, kind, name).with_version(version);
        request.offset = offset;
        request.count = count;
        request
    }

    pub fn id(&self) -> String {
        match self.version {
            Some(version) => format!("{}/{}@{}", self.kind, self.name, version),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArtifactResponse {
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<Version>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl ArtifactResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_artifact(artifact: Artifact) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    pub fn with_artifacts(artifacts: Vec<Artifact>) -> Self {
        Self {
            artifacts,
            ..Self::default()
        }
    }

    pub fn with_versions(versions: Vec<Version>) -> Self {
        Self {
            versions,
            ..Self::default()
        }
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn error(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: message.into(),
            ..Self::default()
        }
    }

    pub fn not_leader(leader_hint: Option<String>) -> Self {
        Self {
            error_code: ErrorCode::NotLeader,
            error_message: "not leader".to_string(),
            leader_hint,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success
    }

    /// Converts a failed response back into the closest [`DepotError`].
    pub fn into_result(self) -> crate::error::Result<Self> {
        match self.error_code {
            ErrorCode::Success => Ok(self),
            ErrorCode::NotLeader => Err(DepotError::NotLeader {
                leader_hint: self.leader_hint,
            }),
            ErrorCode::InputParamError => Err(DepotError::InvalidArgument(self.error_message)),
            ErrorCode::UnsupportedRequest => Err(DepotError::Unsupported(self.error_message)),
            ErrorCode::ParseToPbFail | ErrorCode::ParseFromPbFail => Err(DepotError::Corrupted(
                format!("{:?}: {}", self.error_code, self.error_message),
            )),
            ErrorCode::InternalError => Err(DepotError::Internal(self.error_message)),
        }
    }
}

impl From<DepotError> for ArtifactResponse {
    fn from(error: DepotError) -> Self {
        match error {
            DepotError::NotLeader { leader_hint } => ArtifactResponse::not_leader(leader_hint),
            other => ArtifactResponse::error(other.error_code(), other.to_string()),
        }
    }
}

/// Serde adapter carrying raw bytes as standard base64 text.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_uses_wire_names() {
        let request = ArtifactRequest::upload(
            ArtifactKind::Dict,
            "vocab",
            Version::new(1, 0, 0),
            3,
            b"bbb".to_vec(),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op_type"], "UPLOAD");
        assert_eq!(json["kind"], "dict");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["data"], "YmJi");

        let parsed: ArtifactRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn sparse_request_json_fills_defaults() {
        let parsed: ArtifactRequest =
            serde_json::from_str(r#"{"op_type":"LIST","kind":"plugin"}"#).unwrap();
        assert_eq!(parsed.op_type, OpType::List);
        assert!(parsed.names.is_empty());
        assert!(parsed.version.is_none());
        assert!(!parsed.op_type.is_mutating());
    }

    #[test]
    fn errors_map_to_codes() {
        let response = ArtifactResponse::from(DepotError::AlreadyExists("dict/vocab@1.0.0".into()));
        assert_eq!(response.error_code, ErrorCode::InputParamError);

        let response = ArtifactResponse::from(DepotError::NotLeader {
            leader_hint: Some("10.0.0.2:7400".into()),
        });
        assert_eq!(response.error_code, ErrorCode::NotLeader);
        assert_eq!(response.leader_hint.as_deref(), Some("10.0.0.2:7400"));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error_code"], "NOT_LEADER");
        assert!(matches!(
            response.into_result(),
            Err(DepotError::NotLeader { .. })
        ));
    }
}
