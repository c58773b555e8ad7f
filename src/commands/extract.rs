use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cli::ExtractArgs;
use crate::config::PipelineConfig;
use crate::llm::{LlmClient, LlmRouter, parse_json_object, with_retry};
use crate::model::{
    DocumentFailure, ExtractCounts, FailureKind, LabeledSentenceSet, MetricStatement,
    MetricStatementSet, SentenceLabel, StageRunManifest,
};
use crate::prompts::extract_system_prompt;
use crate::store::{ArtifactKind, ArtifactStore, PipelineStage};
use crate::util::{now_utc_string, utc_compact_string};

pub fn run(args: ExtractArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let store = ArtifactStore::new(&args.cache_root);
    let router = LlmRouter::from_profiles(&config.llm)?;

    let manifest = extract_corpus(&store, router.retrieval.as_ref(), &config)?;
    store.write_run_manifest(PipelineStage::Extract, &manifest)?;
    info!(
        processed = manifest.counts.processed_doc_count,
        statements = manifest.counts.statements_extracted,
        schema_failures = manifest.counts.schema_failures,
        "extract stage completed"
    );

    Ok(())
}

/// What "not_available" looks like on the wire.
const NOT_AVAILABLE: &str = "not_available";

#[derive(Deserialize)]
struct ExtractReply {
    category: String,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
}

struct DocExtraction {
    skipped: bool,
    candidate_sentences: usize,
    statements_extracted: usize,
    schema_failures: usize,
    retry_exhausted: usize,
    failures: Vec<DocumentFailure>,
}

/// Turns candidate sentences into validated metric statements, one LLM call
/// per sentence. Malformed replies drop the sentence, never the document.
pub fn extract_corpus(
    store: &ArtifactStore,
    extractor: &dyn LlmClient,
    config: &PipelineConfig,
) -> Result<StageRunManifest<ExtractCounts>> {
    let started_at = now_utc_string();
    let doc_ids = store.list_doc_ids(ArtifactKind::LabeledSentences)?;
    let system = extract_system_prompt(&config.metrics);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.concurrency.workers)
        .build()
        .context("failed to build extract worker pool")?;

    let extractions: Vec<Result<DocExtraction>> = pool.install(|| {
        doc_ids
            .par_iter()
            .map(|doc_id| extract_document(store, extractor, config, &system, doc_id))
            .collect()
    });

    let mut counts = ExtractCounts {
        doc_count: doc_ids.len(),
        ..ExtractCounts::default()
    };
    let mut failures = Vec::new();

    for extraction in extractions {
        let extraction = extraction?;
        if extraction.skipped {
            counts.skipped_existing += 1;
            continue;
        }
        counts.processed_doc_count += 1;
        counts.candidate_sentences += extraction.candidate_sentences;
        counts.statements_extracted += extraction.statements_extracted;
        counts.schema_failures += extraction.schema_failures;
        counts.retry_exhausted += extraction.retry_exhausted;
        failures.extend(extraction.failures);
    }

    Ok(StageRunManifest {
        manifest_version: 1,
        run_id: format!("extract-{}", utc_compact_string(Utc::now())),
        stage: PipelineStage::Extract.name().to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        failures,
        warnings: Vec::new(),
        counts,
    })
}

fn extract_document(
    store: &ArtifactStore,
    extractor: &dyn LlmClient,
    config: &PipelineConfig,
    system: &str,
    doc_id: &str,
) -> Result<DocExtraction> {
    if store.has_doc(ArtifactKind::MetricStatements, doc_id) {
        debug!(doc_id, "statement checkpoint exists, skipping");
        return Ok(DocExtraction {
            skipped: true,
            candidate_sentences: 0,
            statements_extracted: 0,
            schema_failures: 0,
            retry_exhausted: 0,
            failures: Vec::new(),
        });
    }

    let labeled: LabeledSentenceSet = store.read_doc(ArtifactKind::LabeledSentences, doc_id)?;
    let candidates: Vec<_> = labeled
        .sentences
        .iter()
        .filter(|sentence| sentence.label == SentenceLabel::CandidateMetric)
        .collect();

    let mut statements = Vec::new();
    let mut failures = Vec::new();
    let mut schema_failures = 0;
    let mut retry_exhausted = 0;

    for sentence in &candidates {
        let reply = with_retry(config.retry.max_attempts, "metric-extract", || {
            let raw = extractor.complete(system, &sentence.text)?;
            parse_json_object::<ExtractReply>(&raw)
        });

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(doc_id, index = sentence.index, error = %err, "extraction exhausted retries");
                retry_exhausted += 1;
                failures.push(DocumentFailure {
                    doc_id: doc_id.to_string(),
                    kind: FailureKind::LlmService,
                    detail: format!("sentence {}: {err}", sentence.index),
                });
                continue;
            }
        };

        if reply.category == NOT_AVAILABLE {
            continue;
        }

        match validate_reply(config, &reply) {
            Ok((value, unit)) => statements.push(MetricStatement {
                doc_id: doc_id.to_string(),
                category: reply.category,
                value,
                unit,
                sentence_index: sentence.index,
            }),
            Err(detail) => {
                warn!(doc_id, index = sentence.index, detail, "schema-invalid extraction dropped");
                schema_failures += 1;
                failures.push(DocumentFailure {
                    doc_id: doc_id.to_string(),
                    kind: FailureKind::ExtractionSchema,
                    detail: format!("sentence {}: {detail}", sentence.index),
                });
            }
        }
    }

    let statements_extracted = statements.len();
    store.write_doc(
        ArtifactKind::MetricStatements,
        doc_id,
        &MetricStatementSet {
            doc_id: doc_id.to_string(),
            statements,
            extraction_failures: schema_failures + retry_exhausted,
        },
    )?;

    Ok(DocExtraction {
        skipped: false,
        candidate_sentences: candidates.len(),
        statements_extracted,
        schema_failures,
        retry_exhausted,
        failures,
    })
}

fn validate_reply(config: &PipelineConfig, reply: &ExtractReply) -> Result<(f64, String), String> {
    if !config.metrics.contains_key(&reply.category) {
        return Err(format!("unrecognized category '{}'", reply.category));
    }
    let value = match reply.value {
        Some(value) if value.is_finite() => value,
        Some(value) => return Err(format!("non-finite value {value}")),
        None => return Err("missing numeric value".to_string()),
    };
    let unit = match &reply.unit {
        Some(unit) if !unit.trim().is_empty() => unit.trim().to_string(),
        _ => return Err("missing unit".to_string()),
    };
    Ok((value, unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::llm::MockLlmClient;
    use crate::model::LabeledSentence;

    fn test_config() -> PipelineConfig {
        serde_yaml::from_str(
            r#"
topic: "Fe single-atom catalysts"
llm:
  default: { model: m, base_url: "http://x", api_key: k }
  reasoning: { model: m, base_url: "http://x", api_key: k }
  retrieval: { model: m, base_url: "http://x", api_key: k }
metrics:
  activity:
    description: "half-wave potential"
    canonical_unit: "V"
    unit_factors: { mV: 0.001 }
filter:
  ratio: 0.3
  primary_filtering_thres: 5.0
  scope: combined
concurrency:
  workers: 1
"#,
        )
        .unwrap()
    }

    fn seed_labeled(store: &ArtifactStore, doc_id: &str, texts: &[(&str, SentenceLabel)]) {
        let sentences = texts
            .iter()
            .enumerate()
            .map(|(index, (text, label))| LabeledSentence {
                doc_id: doc_id.to_string(),
                index,
                page: 1,
                text: text.to_string(),
                label: *label,
            })
            .collect();

        store
            .write_doc(
                ArtifactKind::LabeledSentences,
                doc_id,
                &LabeledSentenceSet {
                    doc_id: doc_id.to_string(),
                    no_content: false,
                    sentences,
                },
            )
            .unwrap();
    }

    #[test]
    fn valid_replies_become_statements() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        seed_labeled(
            &store,
            "doc-a",
            &[
                ("E1/2 reached 0.85 V.", SentenceLabel::CandidateMetric),
                ("Synthesis details follow.", SentenceLabel::Other),
            ],
        );

        let extractor =
            MockLlmClient::new(r#"{"category": "activity", "value": 0.85, "unit": "V"}"#);
        let manifest = extract_corpus(&store, &extractor, &test_config()).unwrap();

        assert_eq!(manifest.counts.candidate_sentences, 1);
        assert_eq!(manifest.counts.statements_extracted, 1);
        assert_eq!(extractor.call_count(), 1);

        let set: MetricStatementSet = store
            .read_doc(ArtifactKind::MetricStatements, "doc-a")
            .unwrap();
        assert_eq!(set.statements[0].value, 0.85);
        assert_eq!(set.statements[0].sentence_index, 0);
    }

    #[test]
    fn string_values_and_unknown_categories_are_schema_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        seed_labeled(
            &store,
            "doc-a",
            &[
                ("Value as text.", SentenceLabel::CandidateMetric),
                ("Unknown category.", SentenceLabel::CandidateMetric),
            ],
        );

        // A string value fails f64 deserialization on every retry, which
        // surfaces as retry exhaustion; the unknown category parses but fails
        // validation.
        let extractor = MockLlmClient::scripted(vec![
            Ok(r#"{"category": "activity", "value": "0.85", "unit": "V"}"#.to_string()),
            Ok(r#"{"category": "activity", "value": "0.85", "unit": "V"}"#.to_string()),
            Ok(r#"{"category": "activity", "value": "0.85", "unit": "V"}"#.to_string()),
            Ok(r#"{"category": "selectivity", "value": 4.0, "unit": "%"}"#.to_string()),
        ]);

        let manifest = extract_corpus(&store, &extractor, &test_config()).unwrap();
        assert_eq!(manifest.counts.retry_exhausted, 1);
        assert_eq!(manifest.counts.schema_failures, 1);
        assert_eq!(manifest.counts.statements_extracted, 0);

        let set: MetricStatementSet = store
            .read_doc(ArtifactKind::MetricStatements, "doc-a")
            .unwrap();
        assert!(set.statements.is_empty());
        assert_eq!(set.extraction_failures, 2);
    }

    #[test]
    fn not_available_is_skipped_without_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        seed_labeled(
            &store,
            "doc-a",
            &[("The cell count was 42.", SentenceLabel::CandidateMetric)],
        );

        let extractor = MockLlmClient::new(r#"{"category": "not_available"}"#);
        let manifest = extract_corpus(&store, &extractor, &test_config()).unwrap();

        assert_eq!(manifest.counts.statements_extracted, 0);
        assert_eq!(manifest.counts.schema_failures, 0);
        assert!(manifest.failures.is_empty());
    }

    #[test]
    fn documents_with_no_candidates_write_empty_sets() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        seed_labeled(&store, "doc-a", &[("Just prose.", SentenceLabel::Other)]);

        let extractor = MockLlmClient::new("never called");
        let manifest = extract_corpus(&store, &extractor, &test_config()).unwrap();

        assert_eq!(manifest.counts.processed_doc_count, 1);
        assert_eq!(extractor.call_count(), 0);

        let set: MetricStatementSet = store
            .read_doc(ArtifactKind::MetricStatements, "doc-a")
            .unwrap();
        assert!(set.statements.is_empty());
    }

    #[test]
    fn existing_statement_checkpoints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        seed_labeled(
            &store,
            "doc-a",
            &[("E1/2 reached 0.85 V.", SentenceLabel::CandidateMetric)],
        );
        store
            .write_doc(
                ArtifactKind::MetricStatements,
                "doc-a",
                &MetricStatementSet {
                    doc_id: "doc-a".to_string(),
                    statements: Vec::new(),
                    extraction_failures: 0,
                },
            )
            .unwrap();

        let extractor = MockLlmClient::new("never called");
        let manifest = extract_corpus(&store, &extractor, &test_config()).unwrap();

        assert_eq!(manifest.counts.skipped_existing, 1);
        assert_eq!(extractor.call_count(), 0);
    }
}
