use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

/// Filesystem operations for tools, rooted at the configured workspace.
///
/// Relative paths resolve against the root. Absolute paths are permitted
/// but classified as outside the workspace so the approval gate can apply
/// its second axis; symlinks that escape the root are classified the same
/// way rather than silently treated as internal.
#[derive(Clone)]
pub struct WorkspaceOps {
    root: PathBuf,
    canonical_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub absolute: PathBuf,
    pub outside_workspace: bool,
}

impl WorkspaceOps {
    pub fn new(root: PathBuf) -> Self {
        let canonical_root = fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        let path = path.trim();
        if path.is_empty() {
            bail!("path cannot be empty");
        }
        if path.contains('\\') {
            bail!("backslash paths are not supported: {path}");
        }

        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let normalized = normalize_path(&joined);

        Ok(ResolvedPath {
            outside_workspace: !self.is_within_workspace(&normalized),
            absolute: normalized,
        })
    }

    /// Containment check that follows symlinks through the nearest existing
    /// ancestor, so a link pointing out of the tree is never classified as
    /// internal.
    fn is_within_workspace(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) && !path.starts_with(&self.canonical_root) {
            return false;
        }

        let guard = nearest_existing_ancestor(path);
        let Some(guard) = guard else {
            return false;
        };
        match fs::canonicalize(guard) {
            Ok(canonical) => canonical.starts_with(&self.canonical_root),
            Err(_) => false,
        }
    }

    pub fn read_file(&self, resolved: &ResolvedPath) -> Result<String> {
        fs::read_to_string(&resolved.absolute)
            .with_context(|| format!("Failed to read {}", resolved.absolute.display()))
    }

    pub fn write_file(&self, resolved: &ResolvedPath, content: &str) -> Result<()> {
        if let Some(parent) = resolved.absolute.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&resolved.absolute, content)
            .with_context(|| format!("Failed to write {}", resolved.absolute.display()))
    }

    pub fn list_files(&self, resolved: &ResolvedPath, recursive: bool, limit: usize) -> Result<String> {
        let root = &resolved.absolute;
        let limit = limit.clamp(1, 2_000);
        let mut entries = Vec::new();

        if root.is_file() {
            entries.push(self.display_path(root));
        } else if recursive {
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let mut children = read_sorted_children(&dir)?;
                children.reverse();
                for child in children {
                    let name = child
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    if should_skip_entry(&name) {
                        continue;
                    }
                    if child.is_dir() {
                        entries.push(format!("{}/", self.display_path(&child)));
                        stack.push(child);
                    } else {
                        entries.push(self.display_path(&child));
                    }
                    if entries.len() >= limit {
                        break;
                    }
                }
                if entries.len() >= limit {
                    break;
                }
            }
        } else {
            for child in read_sorted_children(root)? {
                let name = child
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if should_skip_entry(&name) {
                    continue;
                }
                let mut display = self.display_path(&child);
                if child.is_dir() {
                    display.push('/');
                }
                entries.push(display);
                if entries.len() >= limit {
                    break;
                }
            }
        }

        if entries.is_empty() {
            Ok("(no files found)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }

    pub fn search_files(
        &self,
        resolved: &ResolvedPath,
        pattern: &str,
        max_results: usize,
    ) -> Result<String> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            bail!("search requires a non-empty pattern");
        }
        let max_results = max_results.clamp(1, 200);

        match self.search_with_rg(pattern, &resolved.absolute, max_results) {
            Ok(result) => Ok(result),
            Err(error) => {
                if error.to_string().contains("Failed to execute rg") {
                    self.search_fallback(pattern, &resolved.absolute, max_results)
                } else {
                    Err(error)
                }
            }
        }
    }

    fn search_with_rg(&self, pattern: &str, root: &Path, max_results: usize) -> Result<String> {
        let output = Command::new("rg")
            .current_dir(&self.root)
            .arg("--line-number")
            .arg("--color")
            .arg("never")
            .arg("--smart-case")
            .arg("--max-count")
            .arg(max_results.to_string())
            .arg("--")
            .arg(pattern)
            .arg(root)
            .output()
            .context("Failed to execute rg")?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout.is_empty() {
                Ok("No matches found.".to_string())
            } else {
                Ok(stdout)
            }
        } else if output.status.code() == Some(1) {
            Ok("No matches found.".to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            bail!("search failed: {stderr}");
        }
    }

    fn search_fallback(&self, pattern: &str, root: &Path, max_results: usize) -> Result<String> {
        let mut results = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        let case_sensitive = pattern.chars().any(char::is_uppercase);
        let lowered = pattern.to_lowercase();

        while let Some(path) = stack.pop() {
            if path.is_dir() {
                for child in read_sorted_children(&path)? {
                    let name = child
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    if !should_skip_entry(&name) {
                        stack.push(child);
                    }
                }
                continue;
            }

            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };

            for (idx, line) in content.lines().enumerate() {
                let hit = if case_sensitive {
                    line.contains(pattern)
                } else {
                    line.to_lowercase().contains(&lowered)
                };
                if hit {
                    results.push(format!("{}:{}:{}", self.display_path(&path), idx + 1, line));
                    if results.len() >= max_results {
                        break;
                    }
                }
            }
            if results.len() >= max_results {
                break;
            }
        }

        if results.is_empty() {
            Ok("No matches found.".to_string())
        } else {
            Ok(results.join("\n"))
        }
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .or_else(|_| path.strip_prefix(&self.canonical_root))
            .map(|relative| relative.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string())
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
        }
    }
    out
}

fn nearest_existing_ancestor(path: &Path) -> Option<&Path> {
    let mut current = path;
    while !current.exists() {
        current = current.parent()?;
    }
    Some(current)
}

fn read_sorted_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to list entries in {}", dir.display()))?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    children.sort();
    Ok(children)
}

fn should_skip_entry(name: &str) -> bool {
    name.starts_with('.')
        || matches!(
            name,
            "target" | "node_modules" | "__pycache__" | ".venv" | "venv" | "build" | "dist"
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relative_path_resolves_inside() {
        let temp = TempDir::new().expect("temp dir");
        let ops = WorkspaceOps::new(temp.path().to_path_buf());
        let resolved = ops.resolve("src/main.rs").expect("resolve");
        assert!(!resolved.outside_workspace);
        assert!(resolved.absolute.ends_with("src/main.rs"));
    }

    #[test]
    fn test_traversal_and_absolute_are_outside() {
        let temp = TempDir::new().expect("temp dir");
        let ops = WorkspaceOps::new(temp.path().to_path_buf());

        let traversal = ops.resolve("../../etc/passwd").expect("resolve");
        assert!(traversal.outside_workspace);

        let absolute = ops.resolve("/etc/passwd").expect("resolve");
        assert!(absolute.outside_workspace);
    }

    #[test]
    fn test_double_dot_filenames_are_inside() {
        let temp = TempDir::new().expect("temp dir");
        let ops = WorkspaceOps::new(temp.path().to_path_buf());
        let resolved = ops.resolve("my..file.txt").expect("resolve");
        assert!(!resolved.outside_workspace);
    }

    #[test]
    fn test_backslash_paths_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let ops = WorkspaceOps::new(temp.path().to_path_buf());
        assert!(ops.resolve("..\\windows\\system32").is_err());
    }

    #[test]
    fn test_write_read_round_trip() {
        let temp = TempDir::new().expect("temp dir");
        let ops = WorkspaceOps::new(temp.path().to_path_buf());
        let resolved = ops.resolve("notes/a.txt").expect("resolve");
        ops.write_file(&resolved, "hello").expect("write");
        assert_eq!(ops.read_file(&resolved).expect("read"), "hello");
    }

    #[test]
    fn test_list_files_skips_vendored_dirs() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::create_dir(temp.path().join("target")).unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/lib.rs"), "").unwrap();

        let ops = WorkspaceOps::new(temp.path().to_path_buf());
        let resolved = ops.resolve(".").expect("resolve");
        let listing = ops.list_files(&resolved, true, 100).expect("list");
        assert!(listing.contains("src/"));
        assert!(listing.contains("src/lib.rs"));
        assert!(!listing.contains("target"));
    }

    #[test]
    fn test_search_fallback_finds_lines() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::write(temp.path().join("a.txt"), "needle in line\nplain line").unwrap();
        let ops = WorkspaceOps::new(temp.path().to_path_buf());
        let resolved = ops.resolve(".").expect("resolve");
        let hits = ops
            .search_fallback("needle", &resolved.absolute, 10)
            .expect("search");
        assert!(hits.contains("a.txt:1:needle in line"));
    }
}
