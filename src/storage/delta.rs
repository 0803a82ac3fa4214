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

//! Delete logs (deltalogs) of a segment

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::binlog::{seal, unseal, FieldBinlog};
use super::object_store::ObjectStore;
use tracing::debug;

use crate::core::{CompactionError, PrimaryKey, Result};

/// Deletion of one primary key at a hybrid timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRecord {
    pub pk: PrimaryKey,
    pub ts: u64,
}

pub fn encode_delete_log(records: &[DeleteRecord]) -> Result<Vec<u8>> {
    seal(bincode::serialize(records)?)
}

pub fn decode_delete_log(data: &[u8]) -> Result<Vec<DeleteRecord>> {
    let payload = unseal(data)?;
    bincode::deserialize(&payload)
        .map_err(|e| CompactionError::Decode(format!("malformed delete log: {}", e)))
}

/// Download every deltalog and fold them into pk -> latest delete timestamp
pub async fn compose_delete_from_deltalogs(
    store: &dyn ObjectStore,
    deltalogs: &[FieldBinlog],
) -> Result<HashMap<PrimaryKey, u64>> {
    let paths: Vec<String> = deltalogs
        .iter()
        .flat_map(|f| f.binlogs.iter().map(|b| b.log_path.clone()))
        .collect();

    let mut pk2ts = HashMap::new();
    if paths.is_empty() {
        return Ok(pk2ts);
    }

    for blob in store.download(&paths).await? {
        for record in decode_delete_log(&blob)? {
            let ts = pk2ts.entry(record.pk).or_insert(record.ts);
            if *ts < record.ts {
                *ts = record.ts;
            }
        }
    }

    debug!("composed {} deletes from {} deltalogs", pk2ts.len(), paths.len());
    Ok(pk2ts)
}
