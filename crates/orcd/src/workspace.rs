//! Workspace Manager (Section 4.2): materializes and confines a per-run
//! filesystem sandbox, and produces a best-effort git diff summary.

use orc_core::paths::{confine, workspace_path};
use orc_core::Id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("resolved path escaped the workspace root")]
    PathInvalid,
    #[error("path traversal attempt")]
    PathTraversal,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFileEntry {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub branch: Option<String>,
    pub shortstat: String,
    pub files: Vec<DiffFileEntry>,
    pub full_stat: String,
}

/// Outcome of `prepare`: which top-level entries were copied in, and
/// whether the `from_run_id` source workspace was actually found.
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub copied_entries: Vec<String>,
    pub source_found: bool,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pure function: the absolute, confined workspace path for a run.
    pub fn path(&self, project_id: &str, run_id: &Id) -> Result<PathBuf> {
        let candidate = workspace_path(&self.root, project_id, run_id);
        confine(&self.root, &candidate).ok_or(WorkspaceError::PathInvalid)
    }

    /// Create the workspace directory, optionally deep-copying the contents
    /// of a prior run's workspace (including any `.git` subtree).
    pub fn prepare(
        &self,
        project_id: &str,
        run_id: &Id,
        from_run_id: Option<&Id>,
    ) -> Result<PrepareOutcome> {
        let dest = self.path(project_id, run_id)?;
        std::fs::create_dir_all(&dest)?;

        let Some(source_run_id) = from_run_id else {
            return Ok(PrepareOutcome {
                copied_entries: Vec::new(),
                source_found: true,
            });
        };

        let source = self.path(project_id, source_run_id)?;
        if !source.is_dir() {
            return Ok(PrepareOutcome {
                copied_entries: Vec::new(),
                source_found: false,
            });
        }

        let mut copied = Vec::new();
        for entry in std::fs::read_dir(&source)? {
            let entry = entry?;
            let name = entry.file_name();
            copy_recursive(&entry.path(), &dest.join(&name))?;
            copied.push(name.to_string_lossy().into_owned());
        }
        Ok(PrepareOutcome {
            copied_entries: copied,
            source_found: true,
        })
    }

    /// Best-effort git diff summary. Degrades to `None` for non-repos or a
    /// missing `git` binary rather than surfacing an error.
    pub fn diff_summary(&self, path: &Path) -> Option<DiffSummary> {
        if !path.join(".git").exists() {
            return None;
        }
        let branch = run_git(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .map(|s| s.trim().to_string());
        let shortstat = run_git(path, &["diff", "--shortstat"]).ok()?;
        let full_stat = run_git(path, &["diff", "--stat"]).ok()?;
        let name_status = run_git(path, &["diff", "--name-status"]).ok()?;
        let files = name_status
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, char::is_whitespace);
                let status = parts.next()?.trim().to_string();
                let path = parts.next()?.trim().to_string();
                (!status.is_empty() && !path.is_empty()).then_some(DiffFileEntry { status, path })
            })
            .collect();
        Some(DiffSummary {
            branch,
            shortstat: shortstat.trim().to_string(),
            files,
            full_stat,
        })
    }

    /// List every file under `path`, honoring confinement.
    pub fn list_files(&self, path: &Path) -> Result<Vec<FileEntry>> {
        let confined = confine(&self.root, path).ok_or(WorkspaceError::PathInvalid)?;
        let mut entries = Vec::new();
        walk(&confined, &confined, &mut entries)?;
        Ok(entries)
    }

    /// Read a file at `rel`, relative to `path`, honoring confinement.
    pub fn read_file(&self, path: &Path, rel: &str) -> Result<Vec<u8>> {
        let candidate = path.join(rel);
        let resolved = confine(path, &candidate).ok_or(WorkspaceError::PathTraversal)?;
        // Confinement must also hold against the global workspace root.
        if confine(&self.root, &resolved).is_none() {
            return Err(WorkspaceError::PathTraversal);
        }
        Ok(std::fs::read(resolved)?)
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }
        if path.is_dir() {
            walk(root, &path, out)?;
        } else {
            let metadata = entry.metadata()?;
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            out.push(FileEntry {
                path: relative,
                size_bytes: metadata.len(),
                mime_type: mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
            });
        }
    }
    Ok(())
}

fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(src, dest)?;
    }
    Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> std::result::Result<String, WorkspaceError> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_deterministic_and_confined() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let run_id = Id::from_string("run-1");
        let resolved = manager.path("demo", &run_id).unwrap();
        assert!(resolved.starts_with(dir.path()));
        assert_eq!(resolved, manager.path("demo", &run_id).unwrap());
    }

    #[test]
    fn prepare_creates_directory_and_reports_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let run_id = Id::from_string("run-1");
        let source_id = Id::from_string("does-not-exist");
        let outcome = manager.prepare("demo", &run_id, Some(&source_id)).unwrap();
        assert!(!outcome.source_found);
        assert!(outcome.copied_entries.is_empty());
        assert!(manager.path("demo", &run_id).unwrap().is_dir());
    }

    #[test]
    fn prepare_deep_copies_from_source_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let source_id = Id::from_string("run-source");
        let dest_id = Id::from_string("run-dest");

        let source_path = manager.prepare("demo", &source_id, None).unwrap();
        let _ = source_path;
        let source_dir = manager.path("demo", &source_id).unwrap();
        std::fs::write(source_dir.join("a.txt"), b"hello").unwrap();

        let outcome = manager.prepare("demo", &dest_id, Some(&source_id)).unwrap();
        assert!(outcome.source_found);
        assert_eq!(outcome.copied_entries, vec!["a.txt".to_string()]);
        let dest_dir = manager.path("demo", &dest_id).unwrap();
        assert_eq!(std::fs::read(dest_dir.join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn read_file_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let run_id = Id::from_string("run-1");
        manager.prepare("demo", &run_id, None).unwrap();
        let path = manager.path("demo", &run_id).unwrap();
        let result = manager.read_file(&path, "../../../etc/passwd");
        assert!(matches!(result, Err(WorkspaceError::PathTraversal)));
    }

    #[test]
    fn list_files_excludes_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let run_id = Id::from_string("run-1");
        manager.prepare("demo", &run_id, None).unwrap();
        let path = manager.path("demo", &run_id).unwrap();
        std::fs::create_dir_all(path.join(".git")).unwrap();
        std::fs::write(path.join(".git").join("HEAD"), b"ref: refs/heads/main").unwrap();
        std::fs::write(path.join("a.txt"), b"hi").unwrap();

        let files = manager.list_files(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "a.txt");
    }

    #[test]
    fn diff_summary_is_none_outside_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        assert!(manager.diff_summary(dir.path()).is_none());
    }
}
