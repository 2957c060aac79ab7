//! Merkle tree of action inputs, addressed by node handles

use super::Digest;
use crate::error::{RemoteError, Result};
use crate::mapper::digest_to_proto;
use crate::proto::{FileNode, file_node};
use async_trait::async_trait;
use prost::Message;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A file consumed by an action, named by its exec-root-relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionInput {
    exec_path: String,
}

impl ActionInput {
    /// Create an input from its exec-root-relative path
    pub fn new(exec_path: impl Into<String>) -> Self {
        Self {
            exec_path: exec_path.into(),
        }
    }

    /// The exec-root-relative path
    pub fn exec_path(&self) -> &str {
        &self.exec_path
    }

    /// Absolute location of this input under an exec root
    pub fn path_under(&self, exec_root: &Path) -> PathBuf {
        exec_root.join(&self.exec_path)
    }
}

/// Source of content digests for action inputs whose metadata is tracked
/// elsewhere
#[async_trait]
pub trait InputDigestCache: Send + Sync {
    /// Digest of the input's current content
    async fn digest(&self, input: &ActionInput) -> Result<Digest>;
}

/// Hashes inputs under an exec root on first use and remembers the result
pub struct FileDigestCache {
    exec_root: PathBuf,
    digests: Mutex<HashMap<ActionInput, Digest>>,
}

impl FileDigestCache {
    /// Create a cache for inputs under `exec_root`
    pub fn new(exec_root: impl Into<PathBuf>) -> Self {
        Self {
            exec_root: exec_root.into(),
            digests: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, input: &ActionInput) -> Option<Digest> {
        self.digests
            .lock()
            .ok()
            .and_then(|digests| digests.get(input).copied())
    }
}

#[async_trait]
impl InputDigestCache for FileDigestCache {
    async fn digest(&self, input: &ActionInput) -> Result<Digest> {
        if let Some(digest) = self.cached(input) {
            return Ok(digest);
        }

        let digest = Digest::from_file(&input.path_under(&self.exec_root)).await?;
        if let Ok(mut digests) = self.digests.lock() {
            digests.insert(input.clone(), digest);
        }
        Ok(digest)
    }
}

/// Handle of a node inside a tree repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeNodeId(usize);

/// A repository of Merkle tree nodes that can be uploaded to the remote CAS
#[async_trait]
pub trait TreeRepository: Send + Sync {
    /// Compute digests for every node reachable from `root`
    async fn compute_merkle_digests(&mut self, root: TreeNodeId) -> Result<()>;

    /// Every digest reachable from `root`: directory nodes and file contents
    fn all_digests(&self, root: TreeNodeId) -> Result<Vec<Digest>>;

    /// Split a digest set into file inputs and directory metadata nodes
    fn data_from_digests(&self, digests: &BTreeSet<Digest>) -> (Vec<ActionInput>, Vec<FileNode>);

    /// The digest cache used for file leaves
    fn input_cache(&self) -> Arc<dyn InputDigestCache>;
}

#[derive(Debug, Default)]
struct TreeNode {
    /// Children by name; sorted for determinism
    children: BTreeMap<String, TreeNodeId>,
    /// Set on leaves
    input: Option<ActionInput>,
}

/// In-memory tree repository built from a set of action inputs
pub struct TreeNodeRepository {
    cache: Arc<dyn InputDigestCache>,
    nodes: Vec<TreeNode>,
    digests: HashMap<TreeNodeId, Digest>,
    /// Encoded directory nodes by digest
    metadata: HashMap<Digest, FileNode>,
}

impl TreeNodeRepository {
    /// Create an empty repository using `cache` for leaf digests
    pub fn new(cache: Arc<dyn InputDigestCache>) -> Self {
        Self {
            cache,
            nodes: Vec::new(),
            digests: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Build a directory tree from inputs and return its root
    pub fn build_from_inputs(
        &mut self,
        inputs: impl IntoIterator<Item = ActionInput>,
    ) -> Result<TreeNodeId> {
        let root = self.push(TreeNode::default());
        for input in inputs {
            let components = relative_components(Path::new(input.exec_path()))?;
            self.insert(root, &components, input)?;
        }
        Ok(root)
    }

    /// Digest of a node, once computed
    pub fn digest(&self, node: TreeNodeId) -> Option<Digest> {
        self.digests.get(&node).copied()
    }

    fn push(&mut self, node: TreeNode) -> TreeNodeId {
        self.nodes.push(node);
        TreeNodeId(self.nodes.len() - 1)
    }

    fn node(&self, id: TreeNodeId) -> Result<&TreeNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| RemoteError::merkle_error(format!("unknown tree node {}", id.0)))
    }

    fn insert(&mut self, dir: TreeNodeId, components: &[String], input: ActionInput) -> Result<()> {
        let (name, rest) = components
            .split_first()
            .ok_or_else(|| RemoteError::merkle_error("Empty input path"))?;

        if self.node(dir)?.input.is_some() {
            return Err(RemoteError::merkle_error(format!(
                "input {} is nested under a file",
                input.exec_path()
            )));
        }

        if rest.is_empty() {
            if self.node(dir)?.children.contains_key(name) {
                return Err(RemoteError::merkle_error(format!(
                    "input {} conflicts with an existing entry",
                    input.exec_path()
                )));
            }
            let leaf = self.push(TreeNode {
                children: BTreeMap::new(),
                input: Some(input),
            });
            self.nodes[dir.0].children.insert(name.clone(), leaf);
            return Ok(());
        }

        let subdir = match self.node(dir)?.children.get(name) {
            Some(existing) => *existing,
            None => {
                let created = self.push(TreeNode::default());
                self.nodes[dir.0].children.insert(name.clone(), created);
                created
            }
        };
        self.insert(subdir, rest, input)
    }

    /// Nodes reachable from `root`, parents before children
    fn reachable(&self, root: TreeNodeId) -> Result<Vec<TreeNodeId>> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.node(id)?.children.values().copied());
        }
        Ok(order)
    }

    fn directory_node(&self, node: &TreeNode) -> Result<FileNode> {
        let child = node
            .children
            .iter()
            .map(|(name, id)| {
                let digest = self.digest(*id).ok_or_else(|| {
                    RemoteError::merkle_error(format!("child '{name}' has no digest yet"))
                })?;
                Ok(file_node::Child {
                    path: name.clone(),
                    digest: Some(digest_to_proto(&digest)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FileNode {
            file_metadata: None,
            child,
        })
    }
}

#[async_trait]
impl TreeRepository for TreeNodeRepository {
    async fn compute_merkle_digests(&mut self, root: TreeNodeId) -> Result<()> {
        // Children are always allocated after their parent, so descending ids
        // visit every child before its parent.
        let mut order = self.reachable(root)?;
        order.sort_unstable_by(|a, b| b.cmp(a));

        for id in order {
            if self.digests.contains_key(&id) {
                continue;
            }
            let input = self.node(id)?.input.clone();
            let digest = match input {
                Some(input) => self.cache.digest(&input).await?,
                None => {
                    let node = self.directory_node(self.node(id)?)?;
                    let digest = Digest::from_bytes(&node.encode_to_vec());
                    self.metadata.insert(digest, node);
                    digest
                }
            };
            self.digests.insert(id, digest);
        }

        debug!(
            nodes = self.digests.len(),
            directories = self.metadata.len(),
            "Computed Merkle digests"
        );
        Ok(())
    }

    fn all_digests(&self, root: TreeNodeId) -> Result<Vec<Digest>> {
        let mut seen = HashSet::new();
        let mut digests = Vec::new();
        for id in self.reachable(root)? {
            let digest = self.digest(id).ok_or_else(|| {
                RemoteError::merkle_error("Merkle digests have not been computed for this tree")
            })?;
            if seen.insert(digest) {
                digests.push(digest);
            }
        }
        Ok(digests)
    }

    fn data_from_digests(&self, digests: &BTreeSet<Digest>) -> (Vec<ActionInput>, Vec<FileNode>) {
        let mut inputs = Vec::new();
        let mut nodes = Vec::new();
        let mut taken = HashSet::new();

        for (index, node) in self.nodes.iter().enumerate() {
            let Some(digest) = self.digest(TreeNodeId(index)) else {
                continue;
            };
            if !digests.contains(&digest) || !taken.insert(digest) {
                continue;
            }
            match &node.input {
                Some(input) => inputs.push(input.clone()),
                None => {
                    if let Some(metadata) = self.metadata.get(&digest) {
                        nodes.push(metadata.clone());
                    }
                }
            }
        }

        (inputs, nodes)
    }

    fn input_cache(&self) -> Arc<dyn InputDigestCache> {
        Arc::clone(&self.cache)
    }
}

/// Split an exec path into plain components, rejecting anything that could
/// escape the exec root
fn relative_components(path: &Path) -> Result<Vec<String>> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => components.push(name.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => {
                return Err(RemoteError::merkle_error(format!(
                    "input path {} must be relative to the exec root",
                    path.display()
                )));
            }
        }
    }
    if components.is_empty() {
        return Err(RemoteError::merkle_error("Empty input path"));
    }
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Digest cache that derives digests from the path itself
    struct PathDigests;

    #[async_trait]
    impl InputDigestCache for PathDigests {
        async fn digest(&self, input: &ActionInput) -> Result<Digest> {
            Ok(Digest::from_bytes(input.exec_path().as_bytes()))
        }
    }

    fn repository() -> TreeNodeRepository {
        TreeNodeRepository::new(Arc::new(PathDigests))
    }

    fn inputs(paths: &[&str]) -> Vec<ActionInput> {
        paths.iter().map(|p| ActionInput::new(*p)).collect()
    }

    #[tokio::test]
    async fn test_build_nested_tree() {
        let mut repo = repository();
        let root = repo
            .build_from_inputs(inputs(&["a.txt", "subdir/b.txt"]))
            .unwrap();
        repo.compute_merkle_digests(root).await.unwrap();

        // root, subdir, a.txt, subdir/b.txt
        assert_eq!(repo.all_digests(root).unwrap().len(), 4);
        assert_eq!(repo.metadata.len(), 2);
    }

    #[tokio::test]
    async fn test_deterministic_order() {
        let mut repo1 = repository();
        let root1 = repo1
            .build_from_inputs(inputs(&["z.txt", "a.txt", "d/e.txt"]))
            .unwrap();
        repo1.compute_merkle_digests(root1).await.unwrap();

        let mut repo2 = repository();
        let root2 = repo2
            .build_from_inputs(inputs(&["d/e.txt", "a.txt", "z.txt"]))
            .unwrap();
        repo2.compute_merkle_digests(root2).await.unwrap();

        assert_eq!(repo1.digest(root1), repo2.digest(root2));
    }

    #[tokio::test]
    async fn test_child_change_changes_root() {
        let mut repo1 = repository();
        let root1 = repo1.build_from_inputs(inputs(&["d/a.txt"])).unwrap();
        repo1.compute_merkle_digests(root1).await.unwrap();

        let mut repo2 = repository();
        let root2 = repo2.build_from_inputs(inputs(&["d/b.txt"])).unwrap();
        repo2.compute_merkle_digests(root2).await.unwrap();

        assert_ne!(repo1.digest(root1), repo2.digest(root2));
    }

    #[tokio::test]
    async fn test_data_from_digests_partitions() {
        let mut repo = repository();
        let root = repo
            .build_from_inputs(inputs(&["a.txt", "sub/b.txt"]))
            .unwrap();
        repo.compute_merkle_digests(root).await.unwrap();

        let all: BTreeSet<Digest> = repo.all_digests(root).unwrap().into_iter().collect();
        let (files, nodes) = repo.data_from_digests(&all);
        assert_eq!(files.len(), 2);
        assert_eq!(nodes.len(), 2);

        let only_root: BTreeSet<Digest> = repo.digest(root).into_iter().collect();
        let (files, nodes) = repo.data_from_digests(&only_root);
        assert!(files.is_empty());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].child.len(), 2);
        assert_eq!(nodes[0].child[0].path, "a.txt");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let mut repo = repository();
        assert!(repo.build_from_inputs(inputs(&["../etc/passwd"])).is_err());
        let mut repo = repository();
        assert!(repo.build_from_inputs(inputs(&["/abs/path"])).is_err());
    }

    #[test]
    fn test_rejects_file_directory_conflict() {
        let mut repo = repository();
        assert!(repo.build_from_inputs(inputs(&["a", "a/b"])).is_err());
    }

    #[test]
    fn test_all_digests_requires_computation() {
        let mut repo = repository();
        let root = repo.build_from_inputs(inputs(&["a.txt"])).unwrap();
        assert!(matches!(
            repo.all_digests(root),
            Err(RemoteError::Merkle { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_digest_cache_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), b"content").unwrap();

        let cache = FileDigestCache::new(dir.path());
        let input = ActionInput::new("input.txt");
        let digest = cache.digest(&input).await.unwrap();
        assert_eq!(digest, Digest::from_bytes(b"content"));

        // Memoized: changing the file does not change the cached digest
        std::fs::write(dir.path().join("input.txt"), b"changed").unwrap();
        assert_eq!(cache.digest(&input).await.unwrap(), digest);
    }
}
