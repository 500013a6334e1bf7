//! Local filesystem backend
//!
//! Objects live under two root directories (raw and processed), one file
//! per object path. Compose is a streaming append into a temp file that is
//! renamed into place, so a partially written output is never visible.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Bucket, Listing, ObjectStore};
use crate::types::{PipelineError, Result};

pub struct LocalStore {
    raw_root: PathBuf,
    processed_root: PathBuf,
}

impl LocalStore {
    pub async fn new(raw_root: PathBuf, processed_root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&raw_root).await?;
        fs::create_dir_all(&processed_root).await?;
        debug!(
            raw = %raw_root.display(),
            processed = %processed_root.display(),
            "initialized local object store"
        );
        Ok(Self {
            raw_root,
            processed_root,
        })
    }

    fn root(&self, bucket: Bucket) -> &Path {
        match bucket {
            Bucket::Raw => &self.raw_root,
            Bucket::Processed => &self.processed_root,
        }
    }

    /// Resolve an object path under the bucket root, rejecting traversal.
    fn resolve(&self, bucket: Bucket, path: &str) -> Result<PathBuf> {
        if path.split('/').any(|c| c == "..") || path.starts_with('/') {
            return Err(PipelineError::InvalidFormat(format!(
                "illegal object path: {}",
                path
            )));
        }
        Ok(self.root(bucket).join(path))
    }

    /// Collect every file under `dir`, returning paths relative to `root`.
    async fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, bucket: Bucket, path: &str, data: Bytes, _content_type: &str) -> Result<()> {
        let full = self.resolve(bucket, path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        // write-then-rename keeps readers from ever observing a partial object
        let tmp = full.with_extension("partial");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn get(&self, bucket: Bucket, path: &str) -> Result<Bytes> {
        let full = self.resolve(bucket, path)?;
        match fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, bucket: Bucket, path: &str) -> Result<()> {
        let full = self.resolve(bucket, path)?;
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, bucket: Bucket, prefix: &str) -> Result<()> {
        let full = self.resolve(bucket, prefix.trim_end_matches('/'))?;
        match fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, bucket: Bucket, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let root = self.root(bucket).to_path_buf();
        let dir = self.resolve(bucket, prefix.trim_end_matches('/'))?;
        let mut listing = Listing::default();

        match delimiter {
            None => {
                Self::walk(&root, &dir, &mut listing.files).await?;
                listing.files.sort();
            }
            Some(_) => {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(listing);
                    }
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let rel = match path.strip_prefix(&root) {
                        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                        Err(_) => continue,
                    };
                    if entry.file_type().await?.is_dir() {
                        listing.prefixes.push(format!("{}/", rel));
                    } else {
                        listing.files.push(rel);
                    }
                }
                listing.files.sort();
                listing.prefixes.sort();
            }
        }
        Ok(listing)
    }

    async fn exists(&self, bucket: Bucket, path: &str) -> Result<bool> {
        let full = self.resolve(bucket, path)?;
        Ok(fs::metadata(&full).await.is_ok())
    }

    async fn presign(&self, bucket: Bucket, path: &str, ttl: Duration) -> Result<String> {
        if !self.exists(bucket, path).await? {
            return Err(PipelineError::NotFound(path.to_string()));
        }
        // relative route served by the deployment's static file handler
        let slug = match bucket {
            Bucket::Raw => "raw",
            Bucket::Processed => "processed",
        };
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("/media/{}/{}?expires={}", slug, path, expires))
    }

    async fn compose(&self, bucket: Bucket, output: &str, parts: &[String]) -> Result<()> {
        // verify every part up front so a missing one never leaves output behind
        for part in parts {
            if !self.exists(bucket, part).await? {
                return Err(PipelineError::NotFound(part.clone()));
            }
        }

        let full = self.resolve(bucket, output)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = full.with_extension("compose");
        let mut writer = fs::File::create(&tmp).await?;
        for part in parts {
            let part_path = self.resolve(bucket, part)?;
            let mut reader = fs::File::open(&part_path).await?;
            tokio::io::copy(&mut reader, &mut writer).await?;
        }
        writer.flush().await?;
        drop(writer);
        fs::rename(&tmp, &full).await?;

        debug!(output = %output, parts = parts.len(), "composed object");
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        fs::metadata(&self.raw_root).await?;
        fs::metadata(&self.processed_root).await?;
        Ok(())
    }
}
