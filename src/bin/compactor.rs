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

//! Runs one clustering compaction plan against a local object store root

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clustering_compactor::{
    ClusteringCompactionTask, CompactionPlan, CompactorConfig, LocalObjectStore,
};

#[derive(Parser)]
#[command(name = "clustering-compactor")]
#[command(about = "Reorganize a partition's segments by clustering key")]
struct Args {
    /// Compaction plan (JSON)
    #[arg(short, long)]
    plan: PathBuf,

    /// Root directory of the object store
    #[arg(short, long)]
    root: PathBuf,

    /// Optional TOML config, overridden by CLUSTERING_COMPACTOR_* variables
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let config = CompactorConfig::load(args.config.as_deref())
        .context("failed to load compactor configuration")?;
    let plan = CompactionPlan::from_file(&args.plan)
        .await
        .with_context(|| format!("failed to read plan {}", args.plan.display()))?;
    let store = LocalObjectStore::new(&args.root)
        .await
        .with_context(|| format!("failed to open object store at {}", args.root.display()))?;

    info!(
        "🚀 running clustering compaction plan {} over {} segments",
        plan.plan_id,
        plan.segment_binlogs.len()
    );
    let task = ClusteringCompactionTask::new(plan, Arc::new(store), config);
    let result = task.compact().await;
    task.complete();
    let result = result.context("clustering compaction failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
