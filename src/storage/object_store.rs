/*
 * Copyright 2025 Vijaykumar Singh
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Object store seam used for every binlog download and upload
//!
//! Download is bulk and all-or-nothing; upload is one call per group of keyed
//! blobs. Failures surface as [`CompactionError::ObjectStore`] and are never
//! retried here.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;

use crate::core::{CompactionError, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch every path; fails if any one of them cannot be read
    async fn download(&self, paths: &[String]) -> Result<Vec<Vec<u8>>>;

    /// Persist all keyed blobs
    async fn upload(&self, blobs: HashMap<String, Vec<u8>>) -> Result<()>;
}

/// In-memory object store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
    fail_uploads: AtomicBool,
    upload_calls: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.get(path).map(|v| v.value().clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    /// Paths starting with `prefix`, sorted
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn upload_calls(&self) -> u64 {
        self.upload_calls.load(Ordering::Relaxed)
    }

    /// Make every following upload fail, for exercising error paths
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, paths: &[String]) -> Result<Vec<Vec<u8>>> {
        paths
            .iter()
            .map(|path| {
                self.get(path).ok_or_else(|| {
                    CompactionError::ObjectStore(format!("object not found: {}", path))
                })
            })
            .collect()
    }

    async fn upload(&self, blobs: HashMap<String, Vec<u8>>) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(CompactionError::ObjectStore(format!(
                "upload of {} objects rejected",
                blobs.len()
            )));
        }
        for (path, data) in blobs {
            self.objects.insert(path, data);
        }
        Ok(())
    }
}

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root_dir: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).await?;
        Ok(Self { root_dir })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path_buf = PathBuf::from(path);
        if path_buf.is_absolute() {
            path_buf
        } else {
            self.root_dir.join(path_buf)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download(&self, paths: &[String]) -> Result<Vec<Vec<u8>>> {
        let mut blobs = Vec::with_capacity(paths.len());
        for path in paths {
            let resolved_path = self.resolve_path(path);
            match fs::read(&resolved_path).await {
                Ok(data) => blobs.push(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CompactionError::ObjectStore(format!(
                        "object not found: {}",
                        resolved_path.display()
                    )))
                }
                Err(e) => return Err(CompactionError::Io(e)),
            }
        }
        Ok(blobs)
    }

    async fn upload(&self, blobs: HashMap<String, Vec<u8>>) -> Result<()> {
        for (path, data) in blobs {
            let resolved_path = self.resolve_path(&path);
            if let Some(parent) = resolved_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            // Readers never observe a partially written object
            let temp_path = resolved_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
            fs::write(&temp_path, &data).await?;
            fs::rename(&temp_path, &resolved_path).await?;
        }
        Ok(())
    }
}
