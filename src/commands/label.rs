use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cli::LabelArgs;
use crate::commands::inventory;
use crate::config::PipelineConfig;
use crate::llm::{LlmClient, LlmRouter, parse_json_object, with_retry};
use crate::model::{
    DocumentFailure, FailureKind, LabelCounts, LabeledSentenceSet, PaperEntry,
    PaperInventoryManifest, SentenceLabel, StageRunManifest,
};
use crate::parse::{DocumentParser, PdftotextParser};
use crate::prompts::label_system_prompt;
use crate::segment::{RuleSegmenter, SentenceSegmenter, segment_blocks};
use crate::store::{ArtifactKind, ArtifactStore, PipelineStage};
use crate::util::{now_utc_string, read_json, utc_compact_string, write_json_pretty};

/// Sentences worth sending to the labeling model carry a number next to a
/// unit-like token or a percent sign.
const NUMERIC_PRESCREEN: &str = r"\d+(?:\.\d+)?\s*(?:%|[a-zA-Z\u{00b0}\u{00b5}\u{03a9}/]+)";

pub fn run(args: LabelArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let store = ArtifactStore::new(&args.cache_root);
    let inventory = load_or_refresh_inventory(
        &args.cache_root,
        args.pdf_root.as_deref(),
        args.inventory_manifest_path.as_deref(),
        args.refresh_inventory,
    )?;

    let pdf_root = args
        .pdf_root
        .clone()
        .unwrap_or_else(|| args.cache_root.clone());
    let parser = PdftotextParser::new(args.max_pages_per_doc);
    let router = LlmRouter::from_profiles(&config.llm)?;

    let manifest = label_corpus(
        &store,
        &inventory,
        &pdf_root,
        &parser,
        &RuleSegmenter,
        router.retrieval.as_ref(),
        &config,
    )?;

    store.write_run_manifest(PipelineStage::Label, &manifest)?;
    info!(
        labeled = manifest.counts.labeled_doc_count,
        skipped = manifest.counts.skipped_existing,
        candidates = manifest.counts.candidate_sentences,
        failures = manifest.failures.len(),
        "label stage completed"
    );

    Ok(())
}

pub fn load_or_refresh_inventory(
    cache_root: &Path,
    pdf_root: Option<&Path>,
    manifest_path: Option<&Path>,
    refresh: bool,
) -> Result<PaperInventoryManifest> {
    let manifest_path = manifest_path
        .map(PathBuf::from)
        .unwrap_or_else(|| cache_root.join("manifests").join("paper_inventory.json"));

    if !refresh && manifest_path.exists() {
        let manifest: PaperInventoryManifest = read_json(&manifest_path)?;
        debug!(
            path = %manifest_path.display(),
            paper_count = manifest.paper_count,
            "loaded existing inventory manifest"
        );
        return Ok(manifest);
    }

    let pdf_root = pdf_root.map(PathBuf::from).unwrap_or_else(|| cache_root.to_path_buf());
    let manifest = inventory::build_manifest(&pdf_root)?;
    write_json_pretty(&manifest_path, &manifest)?;
    info!(
        path = %manifest_path.display(),
        paper_count = manifest.paper_count,
        "refreshed inventory manifest"
    );
    Ok(manifest)
}

struct DocOutcome {
    skipped: bool,
    failure: Option<DocumentFailure>,
    no_content: bool,
    llm_label_failed: bool,
    sentences_total: usize,
    candidate_sentences: usize,
}

/// Parses, segments and labels every inventoried paper, checkpointing one
/// labeled-sentence set per document. Parse failures drop the document and
/// continue; label-call failures degrade to the numeric prescreen.
pub fn label_corpus(
    store: &ArtifactStore,
    inventory: &PaperInventoryManifest,
    pdf_root: &Path,
    parser: &dyn DocumentParser,
    segmenter: &dyn SentenceSegmenter,
    labeler: &dyn LlmClient,
    config: &PipelineConfig,
) -> Result<StageRunManifest<LabelCounts>> {
    let started_at = now_utc_string();
    let prescreen = Regex::new(NUMERIC_PRESCREEN).context("invalid numeric prescreen pattern")?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.concurrency.workers)
        .build()
        .context("failed to build label worker pool")?;

    let outcomes: Vec<Result<DocOutcome>> = pool.install(|| {
        inventory
            .papers
            .par_iter()
            .map(|paper| label_document(store, paper, pdf_root, parser, segmenter, labeler, config, &prescreen))
            .collect()
    });

    let mut counts = LabelCounts {
        paper_count: inventory.paper_count,
        ..LabelCounts::default()
    };
    let mut failures = Vec::new();

    for outcome in outcomes {
        let outcome = outcome?;
        if outcome.skipped {
            counts.skipped_existing += 1;
            continue;
        }
        if let Some(failure) = outcome.failure {
            counts.parse_failures += 1;
            failures.push(failure);
            continue;
        }

        counts.labeled_doc_count += 1;
        counts.sentences_total += outcome.sentences_total;
        counts.candidate_sentences += outcome.candidate_sentences;
        if outcome.no_content {
            counts.no_content_docs += 1;
        }
        if outcome.llm_label_failed {
            counts.llm_label_failures += 1;
        }
    }

    Ok(StageRunManifest {
        manifest_version: 1,
        run_id: format!("label-{}", utc_compact_string(Utc::now())),
        stage: PipelineStage::Label.name().to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        failures,
        warnings: Vec::new(),
        counts,
    })
}

fn label_document(
    store: &ArtifactStore,
    paper: &PaperEntry,
    pdf_root: &Path,
    parser: &dyn DocumentParser,
    segmenter: &dyn SentenceSegmenter,
    labeler: &dyn LlmClient,
    config: &PipelineConfig,
    prescreen: &Regex,
) -> Result<DocOutcome> {
    if store.has_doc(ArtifactKind::LabeledSentences, &paper.doc_id) {
        debug!(doc_id = %paper.doc_id, "labeled checkpoint exists, skipping");
        return Ok(DocOutcome {
            skipped: true,
            failure: None,
            no_content: false,
            llm_label_failed: false,
            sentences_total: 0,
            candidate_sentences: 0,
        });
    }

    let pdf_path = pdf_root.join(&paper.filename);
    let blocks = match parser.parse(&pdf_path) {
        Ok(blocks) => blocks,
        Err(err) => {
            warn!(doc_id = %paper.doc_id, error = %err, "document parse failed, dropping");
            return Ok(DocOutcome {
                skipped: false,
                failure: Some(DocumentFailure {
                    doc_id: paper.doc_id.clone(),
                    kind: FailureKind::Parse,
                    detail: format!("{err:#}"),
                }),
                no_content: false,
                llm_label_failed: false,
                sentences_total: 0,
                candidate_sentences: 0,
            });
        }
    };

    store.write_doc(ArtifactKind::RawText, &paper.doc_id, &blocks)?;

    let mut sentences = segment_blocks(segmenter, &paper.doc_id, &blocks);
    let no_content = sentences.is_empty();
    if no_content {
        warn!(doc_id = %paper.doc_id, "no sentences after segmentation");
    }

    let prescreened: Vec<usize> = sentences
        .iter()
        .filter(|sentence| prescreen.is_match(&sentence.text))
        .map(|sentence| sentence.index)
        .collect();

    let (confirmed, llm_label_failed) = if prescreened.is_empty() {
        (BTreeSet::new(), false)
    } else {
        confirm_candidates(labeler, config, &paper.doc_id, &sentences, &prescreened)
    };

    for sentence in &mut sentences {
        if confirmed.contains(&sentence.index) {
            sentence.label = SentenceLabel::CandidateMetric;
        }
    }
    let candidate_sentences = confirmed.len();
    let sentences_total = sentences.len();

    store.write_doc(
        ArtifactKind::LabeledSentences,
        &paper.doc_id,
        &LabeledSentenceSet {
            doc_id: paper.doc_id.clone(),
            no_content,
            sentences,
        },
    )?;

    Ok(DocOutcome {
        skipped: false,
        failure: None,
        no_content,
        llm_label_failed,
        sentences_total,
        candidate_sentences,
    })
}

#[derive(Deserialize)]
struct LabelReply {
    candidate_indices: Vec<usize>,
}

/// One confirmation call over the prescreened sentences. The reply is clamped
/// to the prescreen set; retry exhaustion keeps the prescreen labels.
fn confirm_candidates(
    labeler: &dyn LlmClient,
    config: &PipelineConfig,
    doc_id: &str,
    sentences: &[crate::model::LabeledSentence],
    prescreened: &[usize],
) -> (BTreeSet<usize>, bool) {
    let system = label_system_prompt(&config.topic);
    let user = prescreened
        .iter()
        .map(|index| format!("{index}: {}", sentences[*index].text))
        .collect::<Vec<String>>()
        .join("\n");

    let reply = with_retry(config.retry.max_attempts, "label-confirm", || {
        let raw = labeler.complete(&system, &user)?;
        parse_json_object::<LabelReply>(&raw)
    });

    match reply {
        Ok(reply) => {
            let allowed: BTreeSet<usize> = prescreened.iter().copied().collect();
            let confirmed = reply
                .candidate_indices
                .into_iter()
                .filter(|index| allowed.contains(index))
                .collect();
            (confirmed, false)
        }
        Err(err) => {
            warn!(doc_id, error = %err, "label confirmation exhausted retries, keeping prescreen");
            (prescreened.iter().copied().collect(), true)
        }
    }
}
