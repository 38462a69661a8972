//! Maps a request path onto a script under the document root.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{config::ScriptConfig, error::NotFound};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Canonical path of the script.
    pub path: PathBuf,
    /// Canonical document root the script was checked against.
    pub document_root: PathBuf,
    /// Script path relative to the document root, with a leading `/`.
    pub self_path: String,
}

/// Resolves `request_path` against `document_root`.
///
/// A path whose `..` segments climb above the root is rejected outright. A
/// directory is served through its index script, an existing file is served
/// as-is and anything else falls through to the front controller at
/// `document_root/<index>`. The result is canonicalized and must stay inside
/// the canonical document root, and it must carry the script extension.
pub fn resolve(request_path: &str, document_root: &Path, scripts: &ScriptConfig) -> Result<ResolvedTarget, NotFound> {
    if climbs_above_root(request_path) {
        debug!(path = %request_path, "path climbs above document root");
        return Err(NotFound::OutsideDocumentRoot);
    }

    let candidate = join_raw(document_root, request_path);
    let target = find_target(&candidate, document_root, &scripts.index).ok_or(NotFound::NoTarget)?;

    let (Ok(real_target), Ok(real_root)) = (fs::canonicalize(&target), fs::canonicalize(document_root)) else {
        debug!(target = %target.display(), "canonicalization failed");
        return Err(NotFound::OutsideDocumentRoot);
    };
    if !real_target.starts_with(&real_root) {
        debug!(target = %real_target.display(), root = %real_root.display(), "target escapes document root");
        return Err(NotFound::OutsideDocumentRoot);
    }

    if !has_extension(&real_target, &scripts.extension) {
        return Err(NotFound::NotAScript);
    }

    let self_path = real_target
        .strip_prefix(&real_root)
        .map(|rel| format!("/{}", rel.to_string_lossy().trim_start_matches('/')))
        .unwrap_or_default();

    Ok(ResolvedTarget {
        path: real_target,
        document_root: real_root,
        self_path,
    })
}

fn climbs_above_root(request_path: &str) -> bool {
    let mut depth = 0usize;
    for segment in request_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            _ => depth += 1,
        }
    }
    false
}

/// Appends the raw request path to the root. Unlike `Path::join`, an
/// absolute request path never replaces the root.
fn join_raw(document_root: &Path, request_path: &str) -> PathBuf {
    let mut joined = OsString::from(document_root.as_os_str());
    if !request_path.starts_with('/') {
        joined.push("/");
    }
    joined.push(request_path);
    PathBuf::from(joined)
}

fn find_target(candidate: &Path, document_root: &Path, index: &str) -> Option<PathBuf> {
    if candidate.is_dir() {
        let index_file = candidate.join(index);
        if index_file.is_file() {
            return Some(index_file);
        }
    } else if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    let front_controller = document_root.join(index);
    front_controller.is_file().then_some(front_controller)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    let wanted = extension.trim_start_matches('.');
    path.extension().and_then(|e| e.to_str()) == Some(wanted)
}
