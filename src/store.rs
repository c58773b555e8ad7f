use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::util::{read_json, write_json_pretty};

/// One checkpoint artifact tree per stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    RawText,
    LabeledSentences,
    MetricStatements,
    IndividualMetrics,
    OverallMetrics,
    Filter,
    Guidance,
}

impl ArtifactKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::RawText => "raw_text",
            Self::LabeledSentences => "labeled_sentences",
            Self::MetricStatements => "metric_statements",
            Self::IndividualMetrics => "individual_metrics",
            Self::OverallMetrics => "overall_metrics",
            Self::Filter => "filter",
            Self::Guidance => "guidance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Label,
    Extract,
    Aggregate,
    Filter,
    Guide,
}

impl PipelineStage {
    pub const ORDER: [PipelineStage; 5] = [
        Self::Label,
        Self::Extract,
        Self::Aggregate,
        Self::Filter,
        Self::Guide,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Extract => "extract",
            Self::Aggregate => "aggregate",
            Self::Filter => "filter",
            Self::Guide => "guide",
        }
    }

    /// Artifact tree that carries this stage's run manifest.
    pub fn manifest_kind(self) -> ArtifactKind {
        match self {
            Self::Label => ArtifactKind::LabeledSentences,
            Self::Extract => ArtifactKind::MetricStatements,
            Self::Aggregate => ArtifactKind::OverallMetrics,
            Self::Filter => ArtifactKind::Filter,
            Self::Guide => ArtifactKind::Guidance,
        }
    }
}

/// Pipeline-level state, derived from which stage run manifests exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Labeled,
    Extracted,
    Aggregated,
    Filtered,
    Guided,
    Done,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Labeled => "LABELED",
            Self::Extracted => "EXTRACTED",
            Self::Aggregated => "AGGREGATED",
            Self::Filtered => "FILTERED",
            Self::Guided => "GUIDED",
            Self::Done => "DONE",
        }
    }
}

const RUN_MANIFEST_FILE: &str = "_run_manifest.json";

/// Checkpoint store keyed by (artifact kind, doc id). Writers partition by
/// document id, so concurrent per-document writes never collide; corpus-level
/// artifacts (filtered list, guidance) get fixed names inside their tree.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            root: cache_root.join("artifacts"),
        }
    }

    pub fn stage_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn doc_path(&self, kind: ArtifactKind, doc_id: &str) -> PathBuf {
        self.stage_dir(kind).join(format!("{doc_id}.json"))
    }

    pub fn has_doc(&self, kind: ArtifactKind, doc_id: &str) -> bool {
        self.doc_path(kind, doc_id).exists()
    }

    pub fn read_doc<T: DeserializeOwned>(&self, kind: ArtifactKind, doc_id: &str) -> Result<T> {
        read_json(&self.doc_path(kind, doc_id))
    }

    pub fn write_doc<T: Serialize>(&self, kind: ArtifactKind, doc_id: &str, value: &T) -> Result<()> {
        write_json_pretty(&self.doc_path(kind, doc_id), value)
    }

    /// Doc ids with an artifact in the tree, sorted for deterministic
    /// iteration order. Run manifests and temp files are not doc artifacts.
    pub fn list_doc_ids(&self, kind: ArtifactKind) -> Result<Vec<String>> {
        let dir = self.stage_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut doc_ids = Vec::new();
        let entries =
            fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?;

        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
            let path = entry.path();

            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if file_name.starts_with('_') || !file_name.ends_with(".json") {
                continue;
            }

            doc_ids.push(file_name.trim_end_matches(".json").to_string());
        }

        doc_ids.sort();
        Ok(doc_ids)
    }

    pub fn run_manifest_path(&self, stage: PipelineStage) -> PathBuf {
        self.stage_dir(stage.manifest_kind()).join(RUN_MANIFEST_FILE)
    }

    pub fn stage_complete(&self, stage: PipelineStage) -> bool {
        self.run_manifest_path(stage).exists()
    }

    pub fn write_run_manifest<T: Serialize>(&self, stage: PipelineStage, manifest: &T) -> Result<()> {
        write_json_pretty(&self.run_manifest_path(stage), manifest)
    }

    pub fn high_performance_path(&self) -> PathBuf {
        self.stage_dir(ArtifactKind::Filter)
            .join("high_performance_papers.json")
    }

    pub fn guidance_path(&self) -> PathBuf {
        self.stage_dir(ArtifactKind::Guidance).join("guidance.json")
    }

    /// Highest state whose stage prefix is fully checkpointed. A later stage
    /// manifest without its predecessors does not advance the state. The run
    /// is DONE once the guide stage is checkpointed and its terminal artifact
    /// is present.
    pub fn pipeline_state(&self) -> PipelineState {
        let mut state = PipelineState::Init;
        for stage in PipelineStage::ORDER {
            if !self.stage_complete(stage) {
                return state;
            }
            state = match stage {
                PipelineStage::Label => PipelineState::Labeled,
                PipelineStage::Extract => PipelineState::Extracted,
                PipelineStage::Aggregate => PipelineState::Aggregated,
                PipelineStage::Filter => PipelineState::Filtered,
                PipelineStage::Guide => PipelineState::Guided,
            };
        }
        if state == PipelineState::Guided && self.guidance_path().exists() {
            state = PipelineState::Done;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn doc_artifacts_partition_by_id() {
        let (_dir, store) = store();

        store
            .write_doc(ArtifactKind::LabeledSentences, "10.1000_a", &vec![1, 2])
            .unwrap();
        store
            .write_doc(ArtifactKind::LabeledSentences, "10.1000_b", &vec![3])
            .unwrap();

        let a: Vec<u32> = store
            .read_doc(ArtifactKind::LabeledSentences, "10.1000_a")
            .unwrap();
        let b: Vec<u32> = store
            .read_doc(ArtifactKind::LabeledSentences, "10.1000_b")
            .unwrap();
        assert_eq!(a, vec![1, 2]);
        assert_eq!(b, vec![3]);
    }

    #[test]
    fn list_doc_ids_is_sorted_and_skips_run_manifest() {
        let (_dir, store) = store();

        store
            .write_doc(ArtifactKind::MetricStatements, "doc_b", &1_u32)
            .unwrap();
        store
            .write_doc(ArtifactKind::MetricStatements, "doc_a", &2_u32)
            .unwrap();
        store
            .write_run_manifest(PipelineStage::Extract, &"done".to_string())
            .unwrap();

        let ids = store.list_doc_ids(ArtifactKind::MetricStatements).unwrap();
        assert_eq!(ids, vec!["doc_a".to_string(), "doc_b".to_string()]);
    }

    #[test]
    fn list_doc_ids_of_missing_tree_is_empty() {
        let (_dir, store) = store();
        assert!(store.list_doc_ids(ArtifactKind::RawText).unwrap().is_empty());
    }

    #[test]
    fn pipeline_state_advances_only_over_completed_prefix() {
        let (_dir, store) = store();
        assert_eq!(store.pipeline_state(), PipelineState::Init);

        store
            .write_run_manifest(PipelineStage::Label, &"ok".to_string())
            .unwrap();
        assert_eq!(store.pipeline_state(), PipelineState::Labeled);

        // A gap in the stage sequence does not advance past the gap.
        store
            .write_run_manifest(PipelineStage::Aggregate, &"ok".to_string())
            .unwrap();
        assert_eq!(store.pipeline_state(), PipelineState::Labeled);

        store
            .write_run_manifest(PipelineStage::Extract, &"ok".to_string())
            .unwrap();
        assert_eq!(store.pipeline_state(), PipelineState::Aggregated);

        store
            .write_run_manifest(PipelineStage::Filter, &"ok".to_string())
            .unwrap();
        store
            .write_run_manifest(PipelineStage::Guide, &"ok".to_string())
            .unwrap();
        assert_eq!(store.pipeline_state(), PipelineState::Guided);

        crate::util::write_json_pretty(&store.guidance_path(), &"artifact".to_string()).unwrap();
        assert_eq!(store.pipeline_state(), PipelineState::Done);
    }
}
