//! Object storage primitives
//!
//! A small polymorphic contract over blob storage, with two backends: a
//! local filesystem rooted under two directories, and an S3-compatible
//! object store using two buckets. The backend is chosen once at process
//! start. Backend-specific errors never escape this module; they are
//! translated into [`PipelineError`] variants at the boundary.

pub mod facade;
pub mod local;
pub mod s3;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{Args, StorageBackendKind};
use crate::types::Result;

pub use facade::VideoStore;
pub use local::LocalStore;
pub use s3::S3Store;

/// Which storage root an object lives in. The facade decides the routing;
/// backends only dereference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Uploads, chunks, metadata documents, thumbnails
    Raw,
    /// Transcoded segments and manifests
    Processed,
}

/// Result of a delimited list: leaf objects plus common prefixes
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub files: Vec<String>,
    pub prefixes: Vec<String>,
}

/// Blob primitives shared by every backend
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object. Never partial: either the object exists with the
    /// full payload afterwards, or the call failed.
    async fn put(&self, bucket: Bucket, path: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Fetch an object's bytes, or `NotFound`.
    async fn get(&self, bucket: Bucket, path: &str) -> Result<Bytes>;

    /// Delete an object; deleting a missing object succeeds.
    async fn delete(&self, bucket: Bucket, path: &str) -> Result<()>;

    /// Recursively delete everything under a prefix; missing is success.
    async fn delete_prefix(&self, bucket: Bucket, prefix: &str) -> Result<()>;

    /// List objects under a prefix. With `delimiter = Some("/")` the result
    /// partitions into leaf files and common prefixes.
    async fn list(&self, bucket: Bucket, prefix: &str, delimiter: Option<&str>) -> Result<Listing>;

    async fn exists(&self, bucket: Bucket, path: &str) -> Result<bool>;

    /// A URL a client can GET directly for `ttl`. The local backend returns
    /// a relative route served by a plain file handler.
    async fn presign(&self, bucket: Bucket, path: &str, ttl: Duration) -> Result<String>;

    /// Atomically create `output` as the ordered concatenation of `parts`.
    /// If any part is missing, fails with `NotFound` and `output` is not
    /// created.
    async fn compose(&self, bucket: Bucket, output: &str, parts: &[String]) -> Result<()>;

    /// Backend reachability probe, for health reporting.
    async fn health(&self) -> Result<()>;
}

/// Infer a content type from the path extension
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ts" => "video/mp2t",
        "m4s" | "mp4" => "video/mp4",
        "m3u8" => "application/vnd.apple.mpegurl",
        "mpd" => "application/dash+xml",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Build the configured backend.
pub async fn build_backend(args: &Args) -> Result<Arc<dyn ObjectStore>> {
    match args.storage_backend {
        StorageBackendKind::Local => {
            let store =
                LocalStore::new(args.local_raw_dir.clone(), args.local_processed_dir.clone())
                    .await?;
            Ok(Arc::new(store))
        }
        StorageBackendKind::S3 => {
            let store = S3Store::new(
                &args.raw_bucket,
                &args.processed_bucket,
                args.s3_endpoint_url.as_deref(),
                args.s3_force_path_style,
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_table() {
        assert_eq!(content_type_for("videos/a/hls/720p/segment_000.ts"), "video/mp2t");
        assert_eq!(content_type_for("videos/a/dash/video_720p/segment-1.m4s"), "video/mp4");
        assert_eq!(content_type_for("videos/a/dash/video_720p/init.mp4"), "video/mp4");
        assert_eq!(content_type_for("videos/a/hls/master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("videos/a/dash/manifest.mpd"), "application/dash+xml");
        assert_eq!(content_type_for("metadata/a.json"), "application/json");
        assert_eq!(content_type_for("videos/a/thumbnail.jpg"), "image/jpeg");
        assert_eq!(content_type_for("videos/a/chunks/chunk_0"), "application/octet-stream");
    }
}
