// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! S3-backed site publisher.
//!
//! Mirrors the build output into the project's site bucket: upload local
//! files (skipping ones whose digest matches the last publish), then
//! delete remote objects with no local counterpart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::error::PublishError;
use crate::publish::{
    collect_files, content_type_for, file_digest, PublishManifest, PublishSummary, SitePublisher,
};

/// File name of the per-project digest manifest, kept under the project's
/// workspace parent so it never dirties a git tree.
const MANIFEST_FILE: &str = ".publish-manifest.json";

/// S3 mirror of the built site.
#[derive(Clone)]
pub struct S3SitePublisher {
    client: aws_sdk_s3::Client,
    bucket_pattern: String,
    manifest_root: PathBuf,
}

impl S3SitePublisher {
    /// Create a publisher. `bucket_pattern` substitutes `{project}`;
    /// `manifest_root` is the workspace root, under which per-project
    /// manifests are kept.
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket_pattern: impl Into<String>,
        manifest_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            bucket_pattern: bucket_pattern.into(),
            manifest_root: manifest_root.into(),
        }
    }

    fn bucket(&self, project: &str) -> String {
        self.bucket_pattern.replace("{project}", project)
    }

    fn manifest_path(&self, project: &str) -> PathBuf {
        self.manifest_root.join(project).join(MANIFEST_FILE)
    }

    async fn remote_keys(&self, bucket: &str) -> Result<BTreeSet<String>, PublishError> {
        let mut keys = BTreeSet::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| PublishError::List(err.to_string()))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.insert(key.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl SitePublisher for S3SitePublisher {
    async fn mirror(
        &self,
        output_dir: &Path,
        project: &str,
    ) -> Result<PublishSummary, PublishError> {
        let bucket = self.bucket(project);
        let local = collect_files(output_dir)?;
        let remote = self.remote_keys(&bucket).await?;
        let manifest_path = self.manifest_path(project);
        let mut manifest = PublishManifest::load(&manifest_path);
        let mut summary = PublishSummary::default();

        for (key, path) in &local {
            let digest = file_digest(path)?;
            if remote.contains(key) && manifest.is_current(key, &digest) {
                summary.skipped += 1;
                continue;
            }

            let body = ByteStream::from_path(path)
                .await
                .map_err(|err| PublishError::Upload {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            self.client
                .put_object()
                .bucket(&bucket)
                .key(key)
                .body(body)
                .content_type(content_type_for(key))
                .send()
                .await
                .map_err(|err| PublishError::Upload {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            manifest.entries.insert(key.clone(), digest);
            summary.uploaded += 1;
            debug!(bucket = %bucket, key = %key, "Uploaded");
        }

        for key in remote.iter().filter(|key| !local.contains_key(*key)) {
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| PublishError::Delete {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            manifest.entries.remove(key);
            summary.deleted += 1;
            debug!(bucket = %bucket, key = %key, "Deleted stale object");
        }

        if let Err(err) = manifest.save(&manifest_path) {
            // Worst case the next publish re-uploads; not worth failing
            // the pipeline over.
            debug!(error = %err, "Publish manifest save failed");
        }

        info!(
            bucket = %bucket,
            uploaded = summary.uploaded,
            deleted = summary.deleted,
            skipped = summary.skipped,
            "Site mirror complete"
        );
        Ok(summary)
    }
}
