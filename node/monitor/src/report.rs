//! Offline views over the stores, for operators.

use anyhow::{Context, Result};
use diffuzz_common::{MonitorSnapshot, PipelineContext};
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};

pub async fn stats(ctx: &PipelineContext) -> Result<MonitorSnapshot> {
    let snapshot = ctx.store.counters(&ctx.backends).await?;
    Ok(snapshot)
}

/// Render counters the way the metrics file names them
pub fn format_stats(snapshot: &MonitorSnapshot) -> String {
    let mut out = format!(
        "generated: {}\ncompiler errors: {}\n",
        snapshot.generated, snapshot.compiler_errors
    );
    for (backend, runs) in &snapshot.runs {
        out.push_str(&format!("{backend} runs: {runs}\n"));
    }
    out.push_str(&format!("verified: {}\n", snapshot.verified));
    out
}

/// Write one JSON document per verified generation; returns how many were written
pub async fn dump(ctx: &PipelineContext, dir: &Path) -> Result<usize> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;

    let mut written = 0;
    for id in ctx.store.verified_generations().await? {
        let Some(generation) = ctx.store.load_generation(&id).await? else {
            warn!("Verified generation {} has no record, skipping", id);
            continue;
        };
        let results = ctx.store.load_run_results(&id).await?;
        let verification = ctx.store.load_verification(&id).await?;

        let document = json!({
            "id": id,
            "source_sha256": generation.source_digest(),
            "generation": generation,
            "results": results,
            "verification": verification,
        });
        let path = dir.join(format!("{id}.json"));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        written += 1;
    }

    info!("Dumped {} generations to {}", written, dir.display());
    Ok(written)
}
