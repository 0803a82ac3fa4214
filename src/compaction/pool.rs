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

//! Bounded worker pool over tokio tasks

use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{CompactionError, Result};

/// At most `size` submitted futures run at once; the rest queue on the semaphore
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit<F, T>(&self, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let name = self.name;
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| CompactionError::Internal(format!("{} pool closed", name)))?;
            task.await
        })
    }
}

/// Await every handle, failing fast on the first error and aborting the rest
pub async fn await_all<T>(handles: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>>
where
    T: Send + 'static,
{
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let result = try_join_all(handles.into_iter().map(|handle| async move { handle.await? })).await;
    if result.is_err() {
        for abort in aborts {
            abort.abort();
        }
    }
    result
}

/// Like [`await_all`], but gives up with `Cancelled` once `token` fires.
///
/// Tasks still running at that point are aborted.
pub async fn await_all_until<T>(
    handles: Vec<JoinHandle<Result<T>>>,
    token: &CancellationToken,
) -> Result<Vec<T>>
where
    T: Send + 'static,
{
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            for abort in aborts {
                abort.abort();
            }
            Err(CompactionError::Cancelled)
        }
        result = await_all(handles) => result,
    }
}
