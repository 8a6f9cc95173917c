//! Request path canonicalization and document root containment.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::text::UrlEncoded;

/// Resolve `//`, `/./` and `/../` in a request path that has already been split from its query
/// and fragment (see [`Request::script_name`](crate::request::Request::script_name)).
///
/// Each `..` removes the segment before it; a `..` with nothing before it is dropped on its own,
/// so the result never climbs above `/`. Backslashes are treated as slashes and a trailing slash
/// is preserved. Every other character, `?` and `#` included, stays part of its segment, so a
/// percent-decoded path keeps naming the same file.
pub fn canonicalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() || path.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Percent-encode each segment of a canonical path, keeping the slashes.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| UrlEncoded(segment).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve symlinks in the longest existing prefix of `path` and append the remaining
/// components unchanged.
pub fn real_path(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(mut real) = fs::canonicalize(existing) {
            for component in rest.iter().rev() {
                real.push(component);
            }
            return real;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// The directory requests are served from.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    path: PathBuf,
}

impl DocumentRoot {
    /// Resolve `path` to its real location.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            path: fs::canonicalize(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filesystem location of a canonical request path.
    pub fn join(&self, request_path: &str) -> PathBuf {
        let mut path = self.path.clone();
        let relative = request_path.trim_start_matches('/');
        if !relative.is_empty() {
            path.push(relative);
        }
        path
    }

    /// Whether `path`, with symlinks resolved, still lies inside the root.
    pub fn contains(&self, path: &Path) -> bool {
        real_path(path).starts_with(&self.path)
    }
}
