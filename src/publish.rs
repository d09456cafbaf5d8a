// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Site publishing: mirror the build output to the object store.
//!
//! Mirror semantics are exact: after a successful publish the bucket's
//! contents equal the build output directory, deletions included. A
//! per-project manifest of content digests lets re-publishes skip files
//! that did not change between builds. Partial publishes (when an
//! instruction is aborted mid-pipeline) are acceptable; the manifest only
//! records what actually landed.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::PublishError;

/// Counters from one mirror pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Files uploaded this pass.
    pub uploaded: usize,
    /// Remote objects removed because they have no local counterpart.
    pub deleted: usize,
    /// Files skipped because their content digest matched the manifest.
    pub skipped: usize,
}

/// Object-store mirror seam. The production implementation lives in
/// [`crate::aws::S3SitePublisher`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SitePublisher: Send + Sync {
    /// Mirror `output_dir` to the store location for `project`.
    async fn mirror(
        &self,
        output_dir: &Path,
        project: &str,
    ) -> Result<PublishSummary, PublishError>;
}

/// Enumerate publishable files under `dir`, keyed by their forward-slash
/// relative path.
pub fn collect_files(dir: &Path) -> Result<BTreeMap<String, PathBuf>, PublishError> {
    if !dir.is_dir() {
        return Err(PublishError::MissingOutput(dir.display().to_string()));
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| PublishError::List(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| PublishError::List(e.to_string()))?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(key, entry.path().to_path_buf());
    }
    Ok(files)
}

/// Content digest of a file (sha256, hex).
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// MIME type for a published key, by extension.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Digest manifest of the last publish, persisted outside the workspace
/// so it never dirties the git tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishManifest {
    /// Content digest per published key.
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

impl PublishManifest {
    /// Load the manifest, or an empty one if the file does not exist or
    /// cannot be parsed (worst case is re-uploading everything).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Persist the manifest.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Whether `key` was last published with this digest.
    pub fn is_current(&self, key: &str, digest: &str) -> bool {
        self.entries.get(key).map(String::as_str) == Some(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_files_relative_keys() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("assets/css")).unwrap();
        std::fs::write(tmp.path().join("index.html"), "<html>").unwrap();
        std::fs::write(tmp.path().join("assets/css/site.css"), "body{}").unwrap();

        let files = collect_files(tmp.path()).unwrap();
        let keys: Vec<&String> = files.keys().collect();
        assert_eq!(keys, vec!["assets/css/site.css", "index.html"]);
    }

    #[test]
    fn test_collect_files_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let err = collect_files(&tmp.path().join("dist")).unwrap_err();
        assert!(matches!(err, PublishError::MissingOutput(_)));
    }

    #[test]
    fn test_file_digest_stable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();
        let first = file_digest(&path).unwrap();
        let second = file_digest(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        std::fs::write(&path, "changed").unwrap();
        assert_ne!(file_digest(&path).unwrap(), first);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("index.html"), "text/html");
        assert_eq!(content_type_for("assets/site.css"), "text/css");
        assert_eq!(content_type_for("logo.svg"), "image/svg+xml");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_manifest_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/manifest.json");

        let mut manifest = PublishManifest::default();
        manifest
            .entries
            .insert("index.html".to_string(), "abc".to_string());
        manifest.save(&path).unwrap();

        let loaded = PublishManifest::load(&path);
        assert!(loaded.is_current("index.html", "abc"));
        assert!(!loaded.is_current("index.html", "def"));
        assert!(!loaded.is_current("other.html", "abc"));
    }

    #[test]
    fn test_manifest_load_missing_is_empty() {
        let manifest = PublishManifest::load(Path::new("/nonexistent/manifest.json"));
        assert!(manifest.entries.is_empty());
    }
}
