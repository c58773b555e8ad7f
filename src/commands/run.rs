use anyhow::Result;
use tracing::info;

use crate::cli::RunArgs;
use crate::commands::{aggregate, extract, filter, guide, label};
use crate::config::PipelineConfig;
use crate::llm::LlmRouter;
use crate::parse::PdftotextParser;
use crate::segment::RuleSegmenter;
use crate::store::{ArtifactStore, PipelineStage};

/// Drives all five stages in order, resuming past any stage whose run
/// manifest already exists. Within a rerun stage, per-document checkpoints
/// make the pass incremental as well.
pub fn run(args: RunArgs) -> Result<()> {
    let mut config = PipelineConfig::load(&args.config)?;
    filter::apply_overrides(&mut config, args.ratio, args.primary_filtering_thres)?;

    let store = ArtifactStore::new(&args.cache_root);
    let router = LlmRouter::from_profiles(&config.llm)?;

    info!(state = store.pipeline_state().as_str(), "pipeline starting");

    for stage in PipelineStage::ORDER {
        if store.stage_complete(stage) {
            info!(stage = stage.name(), "stage already checkpointed, skipping");
            continue;
        }

        info!(stage = stage.name(), "stage starting");
        match stage {
            PipelineStage::Label => {
                let inventory = label::load_or_refresh_inventory(
                    &args.cache_root,
                    args.pdf_root.as_deref(),
                    None,
                    false,
                )?;
                let pdf_root = args
                    .pdf_root
                    .clone()
                    .unwrap_or_else(|| args.cache_root.clone());
                let parser = PdftotextParser::new(args.max_pages_per_doc);

                let manifest = label::label_corpus(
                    &store,
                    &inventory,
                    &pdf_root,
                    &parser,
                    &RuleSegmenter,
                    router.retrieval.as_ref(),
                    &config,
                )?;
                store.write_run_manifest(stage, &manifest)?;
            }
            PipelineStage::Extract => {
                let manifest = extract::extract_corpus(&store, router.retrieval.as_ref(), &config)?;
                store.write_run_manifest(stage, &manifest)?;
            }
            PipelineStage::Aggregate => {
                let manifest = aggregate::aggregate_corpus(&store, &config)?;
                store.write_run_manifest(stage, &manifest)?;
            }
            PipelineStage::Filter => {
                let manifest = filter::filter_corpus(&store, &config)?;
                store.write_run_manifest(stage, &manifest)?;
            }
            PipelineStage::Guide => {
                let manifest = guide::guide_corpus(
                    &store,
                    router.reasoning.as_ref(),
                    router.default.as_ref(),
                    &config,
                )?;
                store.write_run_manifest(stage, &manifest)?;
            }
        }
        info!(
            stage = stage.name(),
            state = store.pipeline_state().as_str(),
            "stage completed"
        );
    }

    info!(state = store.pipeline_state().as_str(), "pipeline finished");
    Ok(())
}
