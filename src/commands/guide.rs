use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cli::GuideArgs;
use crate::config::PipelineConfig;
use crate::llm::{LlmClient, LlmRouter, parse_json_array, parse_json_object, with_retry};
use crate::model::{
    GuidanceArtifact, GuidanceClaim, GuideCounts, HighPerformanceList, IndividualMetricSet,
    LabeledSentenceSet, SentenceLabel, StageRunManifest,
};
use crate::prompts::{support_system_prompt, trend_system_prompt};
use crate::store::{ArtifactKind, ArtifactStore, PipelineStage};
use crate::util::{now_utc_string, read_json, utc_compact_string, write_json_pretty};

pub fn run(args: GuideArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let store = ArtifactStore::new(&args.cache_root);
    let router = LlmRouter::from_profiles(&config.llm)?;

    let manifest = guide_corpus(
        &store,
        router.reasoning.as_ref(),
        router.default.as_ref(),
        &config,
    )?;
    store.write_run_manifest(PipelineStage::Guide, &manifest)?;
    info!(
        papers = manifest.counts.paper_count,
        claims = manifest.counts.claims_generated,
        rejected = manifest.counts.claims_rejected,
        summaries = manifest.counts.summaries_generated,
        "guide stage completed"
    );

    Ok(())
}

#[derive(Deserialize)]
struct RawClaim {
    trend_type: String,
    description: String,
    supporting_docs: Vec<String>,
}

#[derive(Deserialize)]
struct SummaryReply {
    summary: String,
}

/// Mines trend claims from the high-performance papers, then summarizes how
/// each cited paper supports each accepted claim. Claims citing documents
/// outside the filtered set are rejected outright.
pub fn guide_corpus(
    store: &ArtifactStore,
    reasoner: &dyn LlmClient,
    summarizer: &dyn LlmClient,
    config: &PipelineConfig,
) -> Result<StageRunManifest<GuideCounts>> {
    let started_at = now_utc_string();
    let list: HighPerformanceList = read_json(&store.high_performance_path())?;

    let mut counts = GuideCounts {
        paper_count: list.papers.len(),
        ..GuideCounts::default()
    };
    let mut warnings = Vec::new();

    let artifact = if list.papers.is_empty() {
        info!("no high-performance papers, writing empty guidance");
        GuidanceArtifact {
            generated_at: now_utc_string(),
            topic: config.topic.clone(),
            claims: Vec::new(),
            support_summaries: BTreeMap::new(),
            rejected_claims: 0,
            summary_failures: 0,
        }
    } else {
        let evidence = collect_evidence(store, config, &list)?;
        let known_docs: BTreeSet<&str> =
            list.papers.iter().map(|paper| paper.doc_id.as_str()).collect();

        let (claims, rejected) = mine_claims(reasoner, config, &evidence, &known_docs, &mut warnings);
        counts.claims_generated = claims.len();
        counts.claims_rejected = rejected;

        let (summaries, summary_failures) =
            summarize_support(summarizer, config, &claims, &evidence)?;
        counts.summaries_generated = summaries
            .values()
            .map(|per_doc| per_doc.len())
            .sum::<usize>();
        counts.summary_failures = summary_failures;

        GuidanceArtifact {
            generated_at: now_utc_string(),
            topic: config.topic.clone(),
            claims,
            support_summaries: summaries,
            rejected_claims: rejected,
            summary_failures,
        }
    };

    write_json_pretty(&store.guidance_path(), &artifact)?;

    Ok(StageRunManifest {
        manifest_version: 1,
        run_id: format!("guide-{}", utc_compact_string(Utc::now())),
        stage: PipelineStage::Guide.name().to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        failures: Vec::new(),
        warnings,
        counts,
    })
}

struct PaperEvidence {
    doc_id: String,
    values: BTreeMap<String, f64>,
    sentences: Vec<String>,
}

/// Evidence digest per retained paper: its resolved metric values plus the
/// sentences its statements were extracted from, capped by configuration.
/// Papers whose statements cite nothing fall back to candidate sentences.
fn collect_evidence(
    store: &ArtifactStore,
    config: &PipelineConfig,
    list: &HighPerformanceList,
) -> Result<Vec<PaperEvidence>> {
    let cap = config.evidence.max_sentences_per_paper;
    let mut evidence = Vec::with_capacity(list.papers.len());

    for paper in &list.papers {
        let labeled: LabeledSentenceSet =
            store.read_doc(ArtifactKind::LabeledSentences, &paper.doc_id)?;

        let cited: BTreeSet<usize> = if store.has_doc(ArtifactKind::IndividualMetrics, &paper.doc_id)
        {
            let individual: IndividualMetricSet =
                store.read_doc(ArtifactKind::IndividualMetrics, &paper.doc_id)?;
            individual
                .records
                .iter()
                .flat_map(|record| record.source_sentences.iter().copied())
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut sentences: Vec<String> = labeled
            .sentences
            .iter()
            .filter(|sentence| cited.contains(&sentence.index))
            .map(|sentence| sentence.text.clone())
            .take(cap)
            .collect();

        if sentences.is_empty() {
            sentences = labeled
                .sentences
                .iter()
                .filter(|sentence| sentence.label == SentenceLabel::CandidateMetric)
                .map(|sentence| sentence.text.clone())
                .take(cap)
                .collect();
        }

        evidence.push(PaperEvidence {
            doc_id: paper.doc_id.clone(),
            values: paper.overall.values.clone(),
            sentences,
        });
    }

    Ok(evidence)
}

fn evidence_digest(evidence: &[PaperEvidence]) -> String {
    let mut digest = String::new();
    for paper in evidence {
        digest.push_str(&format!("paper: {}\n", paper.doc_id));
        for (category, value) in &paper.values {
            digest.push_str(&format!("  {category}: {value}\n"));
        }
        for sentence in &paper.sentences {
            digest.push_str(&format!("  evidence: {sentence}\n"));
        }
        digest.push('\n');
    }
    digest
}

/// One reasoning call over the whole filtered corpus. Retry exhaustion yields
/// zero claims and a recorded warning rather than a stage failure.
fn mine_claims(
    reasoner: &dyn LlmClient,
    config: &PipelineConfig,
    evidence: &[PaperEvidence],
    known_docs: &BTreeSet<&str>,
    warnings: &mut Vec<String>,
) -> (Vec<GuidanceClaim>, usize) {
    let system = trend_system_prompt(&config.topic);
    let user = evidence_digest(evidence);

    let raw_claims = with_retry(config.retry.max_attempts, "trend-mine", || {
        let raw = reasoner.complete(&system, &user)?;
        parse_json_array::<Vec<RawClaim>>(&raw)
    });

    let raw_claims = match raw_claims {
        Ok(raw_claims) => raw_claims,
        Err(err) => {
            warn!(error = %err, "trend mining exhausted retries, no claims produced");
            warnings.push(format!("trend mining failed: {err}"));
            return (Vec::new(), 0);
        }
    };

    let mut claims = Vec::new();
    let mut rejected = 0;
    for raw in raw_claims {
        let unknown: Vec<&str> = raw
            .supporting_docs
            .iter()
            .map(String::as_str)
            .filter(|doc_id| !known_docs.contains(doc_id))
            .collect();

        if raw.supporting_docs.is_empty() || !unknown.is_empty() {
            warn!(
                trend_type = %raw.trend_type,
                unknown = ?unknown,
                "claim rejected for uncited or unknown supporting documents"
            );
            rejected += 1;
            continue;
        }

        claims.push(GuidanceClaim {
            claim_key: format!("claim_{:03}", claims.len() + 1),
            trend_type: raw.trend_type,
            description: raw.description,
            supporting_docs: raw.supporting_docs,
        });
    }

    (claims, rejected)
}

/// Per accepted claim and cited paper, one summary call on the default
/// profile. Failed pairs are dropped and counted.
fn summarize_support(
    summarizer: &dyn LlmClient,
    config: &PipelineConfig,
    claims: &[GuidanceClaim],
    evidence: &[PaperEvidence],
) -> Result<(BTreeMap<String, BTreeMap<String, String>>, usize)> {
    let by_doc: BTreeMap<&str, &PaperEvidence> = evidence
        .iter()
        .map(|paper| (paper.doc_id.as_str(), paper))
        .collect();

    let pairs: Vec<(&GuidanceClaim, &PaperEvidence)> = claims
        .iter()
        .flat_map(|claim| {
            claim
                .supporting_docs
                .iter()
                .filter_map(|doc_id| by_doc.get(doc_id.as_str()).copied())
                .map(move |paper| (claim, paper))
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.concurrency.workers)
        .build()
        .context("failed to build summary worker pool")?;

    let results: Vec<(String, String, Option<String>)> = pool.install(|| {
        pairs
            .par_iter()
            .map(|(claim, paper)| {
                let system = support_system_prompt(&claim.description);
                let user = paper.sentences.join("\n");

                let summary = with_retry(config.retry.max_attempts, "support-summary", || {
                    let raw = summarizer.complete(&system, &user)?;
                    parse_json_object::<SummaryReply>(&raw)
                });

                match summary {
                    Ok(reply) => (claim.claim_key.clone(), paper.doc_id.clone(), Some(reply.summary)),
                    Err(err) => {
                        warn!(
                            claim_key = %claim.claim_key,
                            doc_id = %paper.doc_id,
                            error = %err,
                            "support summary exhausted retries"
                        );
                        (claim.claim_key.clone(), paper.doc_id.clone(), None)
                    }
                }
            })
            .collect()
    });

    let mut summaries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut failures = 0;
    for (claim_key, doc_id, summary) in results {
        match summary {
            Some(summary) => {
                summaries.entry(claim_key).or_default().insert(doc_id, summary);
            }
            None => failures += 1,
        }
    }

    Ok((summaries, failures))
}
