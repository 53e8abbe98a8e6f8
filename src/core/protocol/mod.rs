//! Wire protocol: JSON messages with a `type` discriminator.
//!
//! This module is a pure data layer. Every message exchanged between a
//! sender and a receiver is one [`WireMessage`] variant; field names use
//! the camelCase spelling of the other clients on the network.

pub mod manifest;

use serde::{Deserialize, Serialize};

use crate::core::scene::descriptor::SceneDescriptor;
use manifest::{base64_bytes, FileProgress, ManifestEntry};

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    // ── Upload (sender → receiver) ───────────────────────────────────────
    UploadStart(UploadStart),
    UploadChunk(UploadChunk),
    UploadComplete(UploadComplete),
    UploadAbort(UploadAbort),

    // ── Upload (receiver → sender) ───────────────────────────────────────
    UploadProgress(UploadProgress),
    UploadFinished(UploadFinished),

    // ── Removal ──────────────────────────────────────────────────────────
    /// Acknowledges a removal or abort. Sent in either direction.
    AllFilesRemoved,
    RemoveAllFiles(RemoveAllFiles),
    RemoveFile(RemoveFile),

    // ── Scene ────────────────────────────────────────────────────────────
    RemoteSceneStart(RemoteSceneStart),
    RemoteSceneStop(RemoteSceneStop),
    RemoteSceneValidation(SceneResult),
    RemoteSceneLaunched,
    RemoteSceneStopped(SceneResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStart {
    pub upload_id: String,
    pub target_client_id: String,
    pub idea_id: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunk {
    pub upload_id: String,
    pub file_id: String,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub idea_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadComplete {
    pub upload_id: String,
    #[serde(default)]
    pub idea_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAbort {
    pub upload_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub idea_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub percent: u8,
    pub files_completed: usize,
    pub total_files: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_file_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_file_progress: Vec<FileProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFinished {
    pub upload_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAllFiles {
    #[serde(default)]
    pub target_client_id: String,
    #[serde(default)]
    pub idea_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    #[serde(default)]
    pub target_client_id: String,
    pub file_id: String,
    #[serde(default)]
    pub idea_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSceneStart {
    #[serde(default)]
    pub target_client_id: String,
    #[serde(default)]
    pub scene: SceneDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSceneStop {
    #[serde(default)]
    pub target_client_id: String,
}

/// Outcome of a scene validation or stop request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SceneResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

impl WireMessage {
    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::UploadStart(_) => "upload_start",
            WireMessage::UploadChunk(_) => "upload_chunk",
            WireMessage::UploadComplete(_) => "upload_complete",
            WireMessage::UploadAbort(_) => "upload_abort",
            WireMessage::UploadProgress(_) => "upload_progress",
            WireMessage::UploadFinished(_) => "upload_finished",
            WireMessage::AllFilesRemoved => "all_files_removed",
            WireMessage::RemoveAllFiles(_) => "remove_all_files",
            WireMessage::RemoveFile(_) => "remove_file",
            WireMessage::RemoteSceneStart(_) => "remote_scene_start",
            WireMessage::RemoteSceneStop(_) => "remote_scene_stop",
            WireMessage::RemoteSceneValidation(_) => "remote_scene_validation",
            WireMessage::RemoteSceneLaunched => "remote_scene_launched",
            WireMessage::RemoteSceneStopped(_) => "remote_scene_stopped",
        }
    }

    /// Messages belonging to one upload stream. These must share a channel
    /// so chunks never overtake the start/complete markers.
    pub fn is_upload_stream(&self) -> bool {
        matches!(
            self,
            WireMessage::UploadStart(_)
                | WireMessage::UploadChunk(_)
                | WireMessage::UploadComplete(_)
                | WireMessage::UploadAbort(_)
        )
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_payload_is_base64_on_the_wire() {
        let msg = WireMessage::UploadChunk(UploadChunk {
            upload_id: "u1".into(),
            file_id: "f1".into(),
            chunk_index: 3,
            data: b"hello".to_vec(),
            idea_id: "I1".into(),
        });
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""type":"upload_chunk""#));
        assert!(json.contains(r#""data":"aGVsbG8=""#));
        assert!(json.contains(r#""chunkIndex":3"#));
        assert_eq!(WireMessage::decode(&json).unwrap(), msg);
    }

    #[test]
    fn unit_messages_carry_only_the_tag() {
        assert_eq!(
            WireMessage::AllFilesRemoved.encode().unwrap(),
            r#"{"type":"all_files_removed"}"#
        );
        let launched = WireMessage::decode(r#"{"type":"remote_scene_launched"}"#).unwrap();
        assert_eq!(launched, WireMessage::RemoteSceneLaunched);
    }

    #[test]
    fn validation_failure_keeps_error_text() {
        let msg = WireMessage::RemoteSceneValidation(SceneResult::failed("Scene has no media items"));
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""success":false"#));
        assert!(json.contains("Scene has no media items"));
    }

    #[test]
    fn progress_omits_empty_lists() {
        let msg = WireMessage::UploadProgress(UploadProgress {
            upload_id: "u1".into(),
            percent: 0,
            files_completed: 0,
            total_files: 2,
            completed_file_ids: vec![],
            per_file_progress: vec![],
        });
        let json = msg.encode().unwrap();
        assert!(!json.contains("completedFileIds"));
        assert!(json.contains(r#""totalFiles":2"#));
    }

    #[test]
    fn scene_start_tolerates_sparse_media() {
        let json = r#"{"type":"remote_scene_start","targetClientId":"C","scene":{"screens":[{"id":0,"width":800,"height":600}],"media":[{"mediaId":"m","type":"video","fileId":"f"}]}}"#;
        match WireMessage::decode(json).unwrap() {
            WireMessage::RemoteSceneStart(start) => {
                assert_eq!(start.scene.media.len(), 1);
                assert!(start.scene.media[0].is_video());
                assert_eq!(start.scene.media[0].volume, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
