//! Execution result types recorded in the action cache

use crate::merkle::Digest;

/// Content metadata of an output file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Digest of the file content
    pub digest: Digest,
    /// Whether the file has its executable bit set
    pub executable: bool,
}

/// What an output path holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputContent {
    /// A regular file
    File(FileMetadata),
    /// A directory, referenced by the root digest of its Merkle tree
    Directory(Digest),
}

/// One output of an action, relative to the exec root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Exec-root-relative path
    pub path: String,
    /// File or directory content
    pub content: OutputContent,
}

impl Output {
    /// A regular file output
    pub fn file(path: impl Into<String>, digest: Digest, executable: bool) -> Self {
        Self {
            path: path.into(),
            content: OutputContent::File(FileMetadata { digest, executable }),
        }
    }

    /// A directory output
    pub fn directory(path: impl Into<String>, root: Digest) -> Self {
        Self {
            path: path.into(),
            content: OutputContent::Directory(root),
        }
    }
}

/// The recorded result of executing an action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    /// Outputs in the order they were recorded
    pub outputs: Vec<Output>,
    /// Exit code of the action
    pub return_code: i32,
}

impl ActionResult {
    /// Digests of every regular file output
    pub fn file_digests(&self) -> impl Iterator<Item = &Digest> {
        self.outputs.iter().filter_map(|output| match &output.content {
            OutputContent::File(metadata) => Some(&metadata.digest),
            OutputContent::Directory(_) => None,
        })
    }
}
