//! DICOM node variants a job can read from or write to

use std::path::PathBuf;

use dimse::ServerNode;
use serde::{Deserialize, Serialize};

/// A folder on the local filesystem acting as transfer destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    pub path: PathBuf,
}

impl FolderNode {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Either a remote DICOM server or a local folder.
///
/// Nodes are immutable once created and referenced by value from tasks;
/// jobs never own them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DicomNode {
    Server(ServerNode),
    Folder(FolderNode),
}

impl DicomNode {
    pub fn server(node: ServerNode) -> Self {
        Self::Server(node)
    }

    pub fn folder(path: impl Into<PathBuf>) -> Self {
        Self::Folder(FolderNode::new(path))
    }

    pub fn is_server(&self) -> bool {
        matches!(self, DicomNode::Server(_))
    }

    pub fn as_server(&self) -> Option<&ServerNode> {
        match self {
            DicomNode::Server(node) => Some(node),
            DicomNode::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&FolderNode> {
        match self {
            DicomNode::Server(_) => None,
            DicomNode::Folder(node) => Some(node),
        }
    }
}

impl std::fmt::Display for DicomNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DicomNode::Server(node) => write!(f, "DICOM Server {}", node),
            DicomNode::Folder(node) => write!(f, "DICOM Folder {}", node.path.display()),
        }
    }
}
