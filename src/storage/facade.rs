//! Video-semantic storage facade
//!
//! Layers metadata documents, chunk assembly, manifest paths, and signed
//! URLs over the raw [`ObjectStore`] primitives. This is the only place
//! that knows the raw/processed routing rule; everything above it speaks
//! in object paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{content_type_for, Bucket, ObjectStore};
use crate::types::{PipelineError, Result, VideoRecord};

pub struct VideoStore {
    backend: Arc<dyn ObjectStore>,
    presign_ttl: Duration,
}

impl VideoStore {
    pub fn new(backend: Arc<dyn ObjectStore>, presign_ttl: Duration) -> Self {
        Self {
            backend,
            presign_ttl,
        }
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    pub fn metadata_path(id: Uuid) -> String {
        format!("metadata/{}.json", id)
    }

    pub fn video_prefix(id: Uuid) -> String {
        format!("videos/{}/", id)
    }

    pub fn chunk_path(id: Uuid, index: u32) -> String {
        format!("videos/{}/chunks/chunk_{}", id, index)
    }

    pub fn chunks_prefix(id: Uuid) -> String {
        format!("videos/{}/chunks/", id)
    }

    pub fn hls_master_path(id: Uuid) -> String {
        format!("videos/{}/hls/master.m3u8", id)
    }

    pub fn hls_variant_path(id: Uuid, quality: &str) -> String {
        format!("videos/{}/hls/{}.m3u8", id, quality)
    }

    pub fn hls_segment_path(id: Uuid, quality: &str, filename: &str) -> String {
        format!("videos/{}/hls/{}/{}", id, quality, filename)
    }

    pub fn dash_mpd_path(id: Uuid) -> String {
        format!("videos/{}/dash/manifest.mpd", id)
    }

    pub fn dash_init_path(id: Uuid, quality: &str) -> String {
        format!("videos/{}/dash/video_{}/init.mp4", id, quality)
    }

    pub fn dash_segment_path(id: Uuid, quality: &str, number: u32) -> String {
        format!("videos/{}/dash/video_{}/segment-{}.m4s", id, quality, number)
    }

    pub fn thumbnail_path(id: Uuid) -> String {
        format!("videos/{}/thumbnail.jpg", id)
    }

    pub fn thumbnail_still_path(id: Uuid, index: u32) -> String {
        format!("videos/{}/thumbnails/thumbnail_{}.jpg", id, index)
    }

    pub fn poster_path(id: Uuid) -> String {
        format!("videos/{}/poster.jpg", id)
    }

    pub fn preview_path(id: Uuid) -> String {
        format!("videos/{}/preview.gif", id)
    }

    /// Routing rule: HLS/DASH artifacts land in the processed bucket,
    /// everything else (chunks, source, metadata, thumbnails) stays raw.
    pub fn bucket_for(path: &str) -> Bucket {
        let mut segments = path.split('/');
        if segments.next() == Some("videos") && segments.next().is_some() {
            if matches!(segments.next(), Some("hls") | Some("dash") | Some("processed")) {
                return Bucket::Processed;
            }
        }
        Bucket::Raw
    }

    // ------------------------------------------------------------------
    // Metadata documents
    // ------------------------------------------------------------------

    pub async fn save_metadata(&self, record: &VideoRecord) -> Result<()> {
        let path = Self::metadata_path(record.id);
        let body = serde_json::to_vec(record)?;
        self.backend
            .put(Bucket::Raw, &path, Bytes::from(body), "application/json")
            .await
    }

    pub async fn get_metadata(&self, id: Uuid) -> Result<VideoRecord> {
        let path = Self::metadata_path(id);
        let data = self.backend.get(Bucket::Raw, &path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn delete_metadata(&self, id: Uuid) -> Result<()> {
        self.backend
            .delete(Bucket::Raw, &Self::metadata_path(id))
            .await
    }

    // ------------------------------------------------------------------
    // Chunks and compose
    // ------------------------------------------------------------------

    pub async fn save_chunk(&self, id: Uuid, index: u32, data: Bytes) -> Result<()> {
        self.backend
            .put(
                Bucket::Raw,
                &Self::chunk_path(id, index),
                data,
                "application/octet-stream",
            )
            .await
    }

    /// Assemble `chunk_0 .. chunk_{total-1}` into the source object.
    ///
    /// Iterates indices numerically: `chunk_10` sorts before `chunk_2`
    /// lexicographically, so listing order must never decide the layout.
    pub async fn compose_chunks(&self, id: Uuid, total: u32, filename: &str) -> Result<String> {
        let parts: Vec<String> = (0..total).map(|i| Self::chunk_path(id, i)).collect();
        let basename = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
        let output = format!("videos/{}/{}", id, basename);
        self.backend.compose(Bucket::Raw, &output, &parts).await?;
        debug!(video_id = %id, output = %output, chunks = total, "composed upload");
        Ok(output)
    }

    /// SHA-256 of a stored object, in the `sha256-<hex>` notation
    pub async fn checksum(&self, path: &str) -> Result<String> {
        let data = self.get_file(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        Ok(format!("sha256-{}", hex::encode(hasher.finalize())))
    }

    // ------------------------------------------------------------------
    // Routed file operations
    // ------------------------------------------------------------------

    pub async fn save_file(&self, path: &str, data: Bytes) -> Result<()> {
        self.backend
            .put(Self::bucket_for(path), path, data, content_type_for(path))
            .await
    }

    pub async fn get_file(&self, path: &str) -> Result<Bytes> {
        self.backend.get(Self::bucket_for(path), path).await
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        self.backend.exists(Self::bucket_for(path), path).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.backend.delete(Self::bucket_for(path), path).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.backend
            .delete_prefix(Self::bucket_for(prefix), prefix)
            .await
    }

    /// Remove a video directory from both buckets. Takes the raw directory
    /// name so orphans that are not valid ids can still be swept.
    pub async fn delete_video_dir(&self, dir_id: &str) -> Result<()> {
        let prefix = format!("videos/{}/", dir_id);
        self.backend.delete_prefix(Bucket::Raw, &prefix).await?;
        self.backend.delete_prefix(Bucket::Processed, &prefix).await
    }

    /// Remove everything a record owns: blobs in both buckets, then the
    /// metadata document.
    pub async fn delete_video_tree(&self, id: Uuid) -> Result<()> {
        self.delete_video_dir(&id.to_string()).await?;
        self.delete_metadata(id).await
    }

    // ------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------

    /// List metadata documents matching `filters` (exact match per key),
    /// newest first, paginated.
    ///
    /// Documents are fetched and decoded one at a time; only matches stay
    /// resident. A corrupt document is skipped with a warning, never
    /// aborting the listing.
    pub async fn list_videos(
        &self,
        filters: &HashMap<String, String>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<VideoRecord>> {
        let listing = self.backend.list(Bucket::Raw, "metadata/", None).await?;
        let mut matches = Vec::new();

        for path in &listing.files {
            if !path.ends_with(".json") {
                continue;
            }
            let data = match self.backend.get(Bucket::Raw, path).await {
                Ok(data) => data,
                Err(PipelineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let value: serde_json::Value = match serde_json::from_slice(&data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %path, error = %e, "skipping corrupt metadata document");
                    continue;
                }
            };
            if !matches_filters(&value, filters) {
                continue;
            }
            match serde_json::from_value::<VideoRecord>(value) {
                Ok(record) => matches.push(record),
                Err(e) => {
                    warn!(path = %path, error = %e, "skipping undecodable metadata document");
                }
            }
        }

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches.into_iter().skip(skip).take(limit).collect())
    }

    /// List every video id that has a directory under `videos/`, whether or
    /// not metadata exists. Used by the janitor's orphan sweep.
    pub async fn list_video_dirs(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for bucket in [Bucket::Raw, Bucket::Processed] {
            let listing = self.backend.list(bucket, "videos/", Some("/")).await?;
            for prefix in listing.prefixes {
                if let Some(id) = prefix
                    .strip_prefix("videos/")
                    .map(|rest| rest.trim_end_matches('/'))
                {
                    if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    pub async fn chunks_exist(&self, id: Uuid) -> Result<bool> {
        let listing = self
            .backend
            .list(Bucket::Raw, &Self::chunks_prefix(id), None)
            .await?;
        Ok(!listing.files.is_empty())
    }

    // ------------------------------------------------------------------
    // Playback URLs and layout queries
    // ------------------------------------------------------------------

    pub async fn presign_hls(&self, id: Uuid) -> Result<String> {
        self.require_metadata(id).await?;
        self.backend
            .presign(Bucket::Processed, &Self::hls_master_path(id), self.presign_ttl)
            .await
    }

    pub async fn presign_dash(&self, id: Uuid) -> Result<String> {
        self.require_metadata(id).await?;
        self.backend
            .presign(Bucket::Processed, &Self::dash_mpd_path(id), self.presign_ttl)
            .await
    }

    pub async fn presign_file(&self, path: &str) -> Result<String> {
        self.backend
            .presign(Self::bucket_for(path), path, self.presign_ttl)
            .await
    }

    /// Quality names with a variant playlist in storage
    pub async fn list_hls_variants(&self, id: Uuid) -> Result<Vec<String>> {
        self.require_metadata(id).await?;
        let prefix = format!("videos/{}/hls/", id);
        let listing = self.backend.list(Bucket::Processed, &prefix, Some("/")).await?;
        let mut variants: Vec<String> = listing
            .files
            .iter()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter_map(|name| name.strip_suffix(".m3u8"))
            .filter(|name| *name != "master")
            .map(String::from)
            .collect();
        variants.sort();
        Ok(variants)
    }

    /// Adaptation set directories (`video_{quality}`) in storage
    pub async fn list_dash_adaptations(&self, id: Uuid) -> Result<Vec<String>> {
        self.require_metadata(id).await?;
        let prefix = format!("videos/{}/dash/", id);
        let listing = self.backend.list(Bucket::Processed, &prefix, Some("/")).await?;
        let mut adaptations: Vec<String> = listing
            .prefixes
            .iter()
            .filter_map(|p| p.strip_prefix(&prefix))
            .map(|name| name.trim_end_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .collect();
        adaptations.sort();
        Ok(adaptations)
    }

    pub async fn health(&self) -> Result<()> {
        self.backend.health().await
    }

    async fn require_metadata(&self, id: Uuid) -> Result<()> {
        let path = Self::metadata_path(id);
        if !self.backend.exists(Bucket::Raw, &path).await? {
            return Err(PipelineError::NotFound(path));
        }
        Ok(())
    }
}

fn matches_filters(value: &serde_json::Value, filters: &HashMap<String, String>) -> bool {
    filters.iter().all(|(key, expected)| {
        match value.get(key) {
            Some(serde_json::Value::String(s)) => s == expected,
            Some(other) => &other.to_string() == expected,
            None => false,
        }
    })
}
