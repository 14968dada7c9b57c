//! Wire Protocol
//!
//! Defines the messages exchanged between clients and the file server.

use serde::{Deserialize, Serialize};

use crate::error::Status;

/// Metadata describing one file
///
/// Every call carries its own copy; nothing here is shared between calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name relative to the mount directory
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time in epoch seconds
    pub last_modified: u64,
    /// Content checksum (transfer time only)
    pub crc: Option<u32>,
    /// Requesting client (lock requests only)
    pub client_id: Option<String>,
}

impl FileMetadata {
    /// Metadata carrying only a file name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Metadata for a lock request
    pub fn lock_request(name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }
}

/// One streamed message: metadata first, content chunks after
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContext {
    pub metadata: Option<FileMetadata>,
    pub content: Vec<u8>,
}

impl FileContext {
    pub fn metadata(metadata: FileMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            content: Vec::new(),
        }
    }

    pub fn chunk(content: Vec<u8>) -> Self {
        Self {
            metadata: None,
            content,
        }
    }
}

/// Set of files in the mount directory at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub files: Vec<FileMetadata>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FileMetadata> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// RPC methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Client stream of `Context` messages follows
    UploadFile,
    /// Server streams metadata then chunks
    DownloadFile(FileMetadata),
    RemoveFile(Option<FileMetadata>),
    ListFiles,
    GetFileStatus(Option<FileMetadata>),
    GetWriteLock(Option<FileMetadata>),
    ReleaseWriteLock(Option<FileMetadata>),
    /// Server pushes `Snapshot` messages until the client hangs up
    CallbackList,
}

impl Request {
    /// Get the method name (for logging)
    pub fn method_name(&self) -> &'static str {
        match self {
            Request::UploadFile => "UploadFile",
            Request::DownloadFile(_) => "DownloadFile",
            Request::RemoveFile(_) => "RemoveFile",
            Request::ListFiles => "ListFiles",
            Request::GetFileStatus(_) => "GetFileStatus",
            Request::GetWriteLock(_) => "GetWriteLock",
            Request::ReleaseWriteLock(_) => "ReleaseWriteLock",
            Request::CallbackList => "CallbackList",
        }
    }
}

/// Successful RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Empty,
    Context(FileMetadata),
    Catalog(Catalog),
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Calls ==========
    /// Opens an RPC; `deadline_ms` is epoch milliseconds, 0 for none
    Call { deadline_ms: u64, request: Request },

    // ========== Streaming ==========
    /// Metadata or content chunk
    Context(FileContext),

    /// Stream close
    EndOfStream,

    // ========== Results ==========
    Reply(Reply),

    /// Error response
    Error(Status),

    // ========== Callbacks ==========
    /// Catalog pushed on a CallbackList connection
    Snapshot(Catalog),
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Call { .. } => "Call",
            Message::Context(_) => "Context",
            Message::EndOfStream => "EndOfStream",
            Message::Reply(_) => "Reply",
            Message::Error(_) => "Error",
            Message::Snapshot(_) => "Snapshot",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[test]
    fn test_call_serialization() {
        let msg = Message::Call {
            deadline_ms: 1_620_000_000_000,
            request: Request::GetWriteLock(Some(FileMetadata::lock_request("shared.bin", "A"))),
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Call {
                deadline_ms,
                request: Request::GetWriteLock(Some(meta)),
            } => {
                assert_eq!(deadline_ms, 1_620_000_000_000);
                assert_eq!(meta.name, "shared.bin");
                assert_eq!(meta.client_id.as_deref(), Some("A"));
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_error_carries_status() {
        let msg = Message::Error(Status::new(StatusCode::NotFound, "File does not exist"));
        let restored = Message::deserialize(&msg.serialize().unwrap()).unwrap();
        match restored {
            Message::Error(status) => assert_eq!(status.code, StatusCode::NotFound),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = Catalog {
            files: vec![FileMetadata::named("a.txt"), FileMetadata::named("b.txt")],
        };
        assert!(catalog.get("b.txt").is_some());
        assert!(catalog.get("c.txt").is_none());
        assert_eq!(catalog.len(), 2);
    }
}
