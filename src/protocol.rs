//! Wire protocol spoken with the companion process.
//!
//! Frames are JSON text messages tagged by a `type` field. Every inbound
//! frame is decoded into the closed [`ServerMessage`] enum at the socket
//! boundary; anything that fails to decode is a protocol error and never
//! reaches the request multiplexer.
//!
//! | Direction | Frame | Correlation key |
//! |-----------|-------|-----------------|
//! | → | `REQUEST_FILES {}` | (none) |
//! | → | `GET_FILE_CONTENTS {filePath}` | `filePath` |
//! | → | `DIFF_CLIPBOARD {fileName, code}` | `fileName` |
//! | ← | `FILE_LIST {files}` | (none) |
//! | ← | `FILE_CONTENTS {filePath, content}` | `filePath` |
//! | ← | `DIFF_CLIPBOARD_RESULT {fileName, success \| error}` | `fileName` |
//! | ← | `ERROR {error}` | optional `filePath` / `fileName` |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, BridgeResult};

/// Frames sent to the companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    RequestFiles,
    GetFileContents {
        #[serde(rename = "filePath")]
        file_path: String,
    },
    DiffClipboard {
        #[serde(rename = "fileName")]
        file_name: String,
        code: String,
    },
}

/// Frames received from the companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    FileList {
        files: Vec<String>,
    },
    FileContents {
        #[serde(rename = "filePath")]
        file_path: String,
        content: String,
    },
    DiffClipboardResult {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(default)]
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        error: String,
        #[serde(rename = "filePath", default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(rename = "fileName", default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
}

/// Request families. Each one owns its own pending-request map so a fetch
/// and an apply against the same path never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestKind {
    FileList,
    FileContents,
    DiffApply,
}

impl RequestKind {
    /// Name of the outbound frame type.
    pub fn wire_name(self) -> &'static str {
        match self {
            RequestKind::FileList => "REQUEST_FILES",
            RequestKind::FileContents => "GET_FILE_CONTENTS",
            RequestKind::DiffApply => "DIFF_CLIPBOARD",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl ClientMessage {
    pub fn get_file_contents(path: &str) -> Self {
        ClientMessage::GetFileContents {
            file_path: path.trim().to_string(),
        }
    }

    pub fn diff_clipboard(file_name: &str, code: impl Into<String>) -> Self {
        ClientMessage::DiffClipboard {
            file_name: file_name.trim().to_string(),
            code: code.into(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            ClientMessage::RequestFiles => RequestKind::FileList,
            ClientMessage::GetFileContents { .. } => RequestKind::FileContents,
            ClientMessage::DiffClipboard { .. } => RequestKind::DiffApply,
        }
    }

    /// Correlation key the reply will carry.
    pub fn key(&self) -> &str {
        match self {
            ClientMessage::RequestFiles => "",
            ClientMessage::GetFileContents { file_path } => file_path,
            ClientMessage::DiffClipboard { file_name, .. } => file_name,
        }
    }
}

impl ServerMessage {
    /// The (kind, key) pair this frame answers, if it carries one.
    ///
    /// Keyless `ERROR` frames return `None`; the multiplexer decides how to
    /// route those.
    pub fn correlation(&self) -> Option<(RequestKind, &str)> {
        match self {
            ServerMessage::FileList { .. } => Some((RequestKind::FileList, "")),
            ServerMessage::FileContents { file_path, .. } => {
                Some((RequestKind::FileContents, file_path.trim()))
            }
            ServerMessage::DiffClipboardResult { file_name, .. } => {
                Some((RequestKind::DiffApply, file_name.trim()))
            }
            ServerMessage::Error {
                file_path: Some(path),
                ..
            } => Some((RequestKind::FileContents, path.trim())),
            ServerMessage::Error {
                file_name: Some(name),
                ..
            } => Some((RequestKind::DiffApply, name.trim())),
            ServerMessage::Error { .. } => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::FileList { .. } => "FILE_LIST",
            ServerMessage::FileContents { .. } => "FILE_CONTENTS",
            ServerMessage::DiffClipboardResult { .. } => "DIFF_CLIPBOARD_RESULT",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> BridgeResult<ServerMessage> {
    serde_json::from_str(text.trim())
        .map_err(|e| BridgeError::Protocol(format!("malformed frame: {}", e)))
}

/// Encode one outbound frame.
pub fn encode_frame(message: &ClientMessage) -> BridgeResult<String> {
    serde_json::to_string(message)
        .map_err(|e| BridgeError::Protocol(format!("failed to encode frame: {}", e)))
}

/// Map a destination shown to the user to the path sent to the companion.
///
/// File names discovered from the workspace are displayed with a leading
/// `/`; the companion joins the name onto its workspace root, so those are
/// sent as `./path`.
pub fn workspace_relative(name: &str) -> String {
    let name = name.trim();
    if name.starts_with('/') {
        format!(".{}", name)
    } else {
        name.to_string()
    }
}
