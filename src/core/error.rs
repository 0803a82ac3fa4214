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

//! Error types for clustering compaction

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompactionError>;

#[derive(Error, Debug)]
pub enum CompactionError {
    /// Malformed or inconsistent plan; raised before any I/O happens
    #[error("Illegal compaction plan: {0}")]
    IllegalPlan(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Id allocator exhausted: {0}")]
    AllocatorExhausted(String),

    #[error("Flush scheduler closed")]
    FlushSchedulerClosed,

    #[error("Compaction cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CompactionError {
    /// Cancellation is an abandoned run, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompactionError::Cancelled)
    }

    /// Coarse category used in logs
    pub fn category(&self) -> &'static str {
        match self {
            CompactionError::IllegalPlan(_) => "illegal_plan",
            CompactionError::ObjectStore(_)
            | CompactionError::Io(_)
            | CompactionError::Serialization(_)
            | CompactionError::FlushSchedulerClosed => "io",
            CompactionError::Decode(_) => "decode",
            CompactionError::ConsistencyViolation(_) => "consistency",
            CompactionError::AllocatorExhausted(_) => "allocator",
            CompactionError::Cancelled => "cancelled",
            CompactionError::Config(_) => "config",
            CompactionError::Internal(_) => "internal",
        }
    }
}

impl From<bincode::Error> for CompactionError {
    fn from(err: bincode::Error) -> Self {
        CompactionError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CompactionError {
    fn from(err: serde_json::Error) -> Self {
        CompactionError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for CompactionError {
    fn from(err: config::ConfigError) -> Self {
        CompactionError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CompactionError {
    fn from(err: tokio::task::JoinError) -> Self {
        CompactionError::Internal(format!("task join failed: {}", err))
    }
}
