use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-file result of diffing two snapshots (or a snapshot against the
/// live tree). Binary files carry empty before/after text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub before: String,
    pub after: String,
    pub is_binary: bool,
}

/// Git-shaped snapshot contract: content-addressable commits over tracked
/// workspace files. Implementations must be safe to call from blocking
/// context; the manager serializes commits per lineage.
pub trait SnapshotBackend: Send {
    fn commit(&mut self) -> Result<String>;
    fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileDiff>>;
    fn reset_head(&mut self, hash: &str) -> Result<()>;
}

const MAX_TRACKED_FILE_BYTES: u64 = 1_048_576;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    /// workspace-relative path -> blob hash
    files: BTreeMap<String, String>,
}

/// Snapshot store that shadows the workspace into a content-addressable
/// object directory under the task's state dir. A commit is a manifest of
/// blob hashes; the commit id is the SHA-256 of the canonical manifest
/// serialization, so identical trees always share an id.
pub struct ShadowSnapshotStore {
    workspace_root: PathBuf,
    objects_dir: PathBuf,
    commits_dir: PathBuf,
}

impl ShadowSnapshotStore {
    pub fn new(workspace_root: PathBuf, snapshots_dir: PathBuf) -> Result<Self> {
        let objects_dir = snapshots_dir.join("objects");
        let commits_dir = snapshots_dir.join("commits");
        fs::create_dir_all(&objects_dir)
            .with_context(|| format!("Failed to create {}", objects_dir.display()))?;
        fs::create_dir_all(&commits_dir)
            .with_context(|| format!("Failed to create {}", commits_dir.display()))?;
        Ok(Self {
            workspace_root,
            objects_dir,
            commits_dir,
        })
    }

    fn tracked_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack = vec![self.workspace_root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read {}", dir.display()))?;
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if skip_tracked_entry(&name) {
                    continue;
                }
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX)
                        <= MAX_TRACKED_FILE_BYTES
                    {
                        files.push(path);
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace_root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string())
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.objects_dir.join(hash)
    }

    fn write_blob(&self, bytes: &[u8]) -> Result<String> {
        let hash = hex_digest(bytes);
        let path = self.blob_path(&hash);
        if !path.exists() {
            fs::write(&path, bytes)
                .with_context(|| format!("Failed to store blob {}", path.display()))?;
        }
        Ok(hash)
    }

    fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(hash))
            .with_context(|| format!("Missing snapshot blob {hash}"))
    }

    fn load_manifest(&self, commit: &str) -> Result<Manifest> {
        let path = self.commits_dir.join(format!("{commit}.json"));
        if !path.exists() {
            bail!("unknown snapshot commit {commit}");
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt snapshot manifest {commit}"))
    }

    fn live_manifest_bytes(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for path in self.tracked_files()? {
            let bytes = fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            out.insert(self.relative_display(&path), bytes);
        }
        Ok(out)
    }
}

impl SnapshotBackend for ShadowSnapshotStore {
    fn commit(&mut self) -> Result<String> {
        let mut manifest = Manifest::default();
        for (rel, bytes) in self.live_manifest_bytes()? {
            let blob = self.write_blob(&bytes)?;
            manifest.files.insert(rel, blob);
        }

        let serialized = serde_json::to_string(&manifest)?;
        let commit = hex_digest(serialized.as_bytes());
        let path = self.commits_dir.join(format!("{commit}.json"));
        if !path.exists() {
            fs::write(&path, &serialized)
                .with_context(|| format!("Failed to write commit {}", path.display()))?;
        }
        Ok(commit)
    }

    fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileDiff>> {
        let before = self.load_manifest(from)?;
        let before_bytes: BTreeMap<String, Vec<u8>> = before
            .files
            .iter()
            .map(|(path, blob)| Ok((path.clone(), self.read_blob(blob)?)))
            .collect::<Result<_>>()?;

        let after_bytes: BTreeMap<String, Vec<u8>> = match to {
            Some(commit) => self
                .load_manifest(commit)?
                .files
                .iter()
                .map(|(path, blob)| Ok((path.clone(), self.read_blob(blob)?)))
                .collect::<Result<_>>()?,
            None => self.live_manifest_bytes()?,
        };

        let mut paths: Vec<&String> = before_bytes.keys().chain(after_bytes.keys()).collect();
        paths.sort();
        paths.dedup();

        let mut diffs = Vec::new();
        for path in paths {
            let before = before_bytes.get(path);
            let after = after_bytes.get(path);
            if before == after {
                continue;
            }
            let is_binary = before.is_some_and(|b| is_binary_bytes(b))
                || after.is_some_and(|b| is_binary_bytes(b));
            diffs.push(FileDiff {
                path: path.clone(),
                before: if is_binary {
                    String::new()
                } else {
                    before
                        .map(|b| String::from_utf8_lossy(b).to_string())
                        .unwrap_or_default()
                },
                after: if is_binary {
                    String::new()
                } else {
                    after
                        .map(|b| String::from_utf8_lossy(b).to_string())
                        .unwrap_or_default()
                },
                is_binary,
            });
        }
        Ok(diffs)
    }

    fn reset_head(&mut self, hash: &str) -> Result<()> {
        let manifest = self.load_manifest(hash)?;

        // Restore every snapshotted file first; only then remove tracked
        // files the snapshot does not know about.
        for (rel, blob) in &manifest.files {
            let bytes = self.read_blob(blob)?;
            let target = self.workspace_root.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&target, bytes)
                .with_context(|| format!("Failed to restore {}", target.display()))?;
        }

        for path in self.tracked_files()? {
            let rel = self.relative_display(&path);
            if !manifest.files.contains_key(&rel) {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn is_binary_bytes(bytes: &[u8]) -> bool {
    bytes.contains(&0)
}

fn skip_tracked_entry(name: &str) -> bool {
    name.starts_with('.')
        || matches!(
            name,
            "target" | "node_modules" | "__pycache__" | ".venv" | "venv" | "build" | "dist"
        )
}
