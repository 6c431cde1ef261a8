use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One named resource. The `id` is shared by sender and receiver, the `uri`
/// is local to whichever side holds the descriptor (source path on the
/// sender, final destination on the receiver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub uri: PathBuf,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, uri: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), uri: uri.into() }
    }

    /// Describe a local file, using its file name as the resource id.
    pub fn from_path(path: &Path) -> Option<Self> {
        let id = path.file_name()?.to_str()?.to_string();
        Some(Self::new(id, path))
    }
}

/// The ordered batch a sender pushes in one transfer. Resources are sent and
/// must be received in exactly this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBatch {
    pub transfer_id: String,
    pub resources: Vec<ResourceDescriptor>,
}

impl TransferBatch {
    pub fn new(transfer_id: impl Into<String>, resources: Vec<ResourceDescriptor>) -> Self {
        Self { transfer_id: transfer_id.into(), resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// What the receiver hands to the application once a transfer completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub transfer_id: String,
    pub resources: Vec<ResourceDescriptor>,
}
