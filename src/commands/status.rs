use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::{PaperInventoryManifest, StageRunManifest};
use crate::store::{ArtifactStore, PipelineStage};
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let store = ArtifactStore::new(&args.cache_root);
    let report = collect_status(&store, &args.cache_root)?;

    info!(state = %report.state, "pipeline state");
    match report.inventory_paper_count {
        Some(count) => info!(paper_count = count, "inventory manifest present"),
        None => warn!("no inventory manifest; run the inventory or label command first"),
    }

    for stage in &report.stages {
        if stage.complete {
            info!(
                stage = %stage.name,
                doc_artifacts = stage.doc_artifacts,
                failures = stage.failures,
                warnings = stage.warnings,
                "stage checkpointed"
            );
        } else {
            info!(
                stage = %stage.name,
                doc_artifacts = stage.doc_artifacts,
                "stage not checkpointed"
            );
        }
    }

    Ok(())
}

pub struct StageStatus {
    pub name: String,
    pub complete: bool,
    pub doc_artifacts: usize,
    pub failures: usize,
    pub warnings: usize,
}

pub struct StatusReport {
    pub state: String,
    pub inventory_paper_count: Option<usize>,
    pub stages: Vec<StageStatus>,
}

pub fn collect_status(store: &ArtifactStore, cache_root: &Path) -> Result<StatusReport> {
    let inventory_path = cache_root.join("manifests").join("paper_inventory.json");
    let inventory_paper_count = if inventory_path.exists() {
        let manifest: PaperInventoryManifest = read_json(&inventory_path)?;
        Some(manifest.paper_count)
    } else {
        None
    };

    let mut stages = Vec::new();
    for stage in PipelineStage::ORDER {
        let complete = store.stage_complete(stage);
        let doc_artifacts = store.list_doc_ids(stage.manifest_kind())?.len();

        let (failures, warnings) = if complete {
            let manifest: StageRunManifest<Value> = read_json(&store.run_manifest_path(stage))?;
            (manifest.failures.len(), manifest.warnings.len())
        } else {
            (0, 0)
        };

        stages.push(StageStatus {
            name: stage.name().to_string(),
            complete,
            doc_artifacts,
            failures,
            warnings,
        });
    }

    Ok(StatusReport {
        state: store.pipeline_state().as_str().to_string(),
        inventory_paper_count,
        stages,
    })
}
