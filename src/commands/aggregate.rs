use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::AggregateArgs;
use crate::config::PipelineConfig;
use crate::model::{
    AggregateCounts, DocumentFailure, FailureKind, IndividualMetricRecord, IndividualMetricSet,
    MetricStatement, MetricStatementSet, OverallMetricRecord, StageRunManifest,
};
use crate::store::{ArtifactKind, ArtifactStore, PipelineStage};
use crate::util::{now_utc_string, utc_compact_string};

pub fn run(args: AggregateArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let store = ArtifactStore::new(&args.cache_root);

    let manifest = aggregate_corpus(&store, &config)?;
    store.write_run_manifest(PipelineStage::Aggregate, &manifest)?;
    info!(
        docs = manifest.counts.doc_count,
        individual = manifest.counts.individual_records,
        unresolved = manifest.counts.unresolved_statements,
        "aggregate stage completed"
    );

    Ok(())
}

/// Reconciles each document's statements into one record per category and one
/// overall record per document. Unit-unresolvable statements are dropped and
/// counted, never propagated as batch errors.
pub fn aggregate_corpus(
    store: &ArtifactStore,
    config: &PipelineConfig,
) -> Result<StageRunManifest<AggregateCounts>> {
    let started_at = now_utc_string();
    let doc_ids = store.list_doc_ids(ArtifactKind::MetricStatements)?;

    let mut counts = AggregateCounts {
        doc_count: doc_ids.len(),
        ..AggregateCounts::default()
    };
    let mut failures = Vec::new();

    for doc_id in &doc_ids {
        let set: MetricStatementSet = store.read_doc(ArtifactKind::MetricStatements, doc_id)?;
        counts.statements_seen += set.statements.len();

        let (individual, unresolved, doc_failures) = aggregate_document(config, doc_id, &set.statements);
        counts.statements_normalized += individual
            .records
            .iter()
            .map(|record| record.statement_count)
            .sum::<usize>();
        counts.unresolved_statements += unresolved;
        counts.individual_records += individual.records.len();
        failures.extend(doc_failures);

        let overall = OverallMetricRecord {
            doc_id: doc_id.clone(),
            values: individual
                .records
                .iter()
                .map(|record| (record.category.clone(), record.value))
                .collect(),
            unresolved_statements: unresolved,
        };

        store.write_doc(ArtifactKind::IndividualMetrics, doc_id, &individual)?;
        store.write_doc(ArtifactKind::OverallMetrics, doc_id, &overall)?;
        counts.overall_records += 1;
    }

    Ok(StageRunManifest {
        manifest_version: 1,
        run_id: format!("aggregate-{}", utc_compact_string(Utc::now())),
        stage: PipelineStage::Aggregate.name().to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        failures,
        warnings: Vec::new(),
        counts,
    })
}

fn aggregate_document(
    config: &PipelineConfig,
    doc_id: &str,
    statements: &[MetricStatement],
) -> (IndividualMetricSet, usize, Vec<DocumentFailure>) {
    let mut by_category: BTreeMap<&str, Vec<(f64, usize)>> = BTreeMap::new();
    let mut unresolved = 0;
    let mut failures = Vec::new();

    for statement in statements {
        let Some(spec) = config.metrics.get(&statement.category) else {
            unresolved += 1;
            failures.push(DocumentFailure {
                doc_id: doc_id.to_string(),
                kind: FailureKind::AggregationAmbiguity,
                detail: format!(
                    "sentence {}: category '{}' is not configured",
                    statement.sentence_index, statement.category
                ),
            });
            continue;
        };

        match spec.normalization_factor(&statement.unit) {
            Some(factor) => by_category
                .entry(statement.category.as_str())
                .or_default()
                .push((statement.value * factor, statement.sentence_index)),
            None => {
                warn!(
                    doc_id,
                    category = %statement.category,
                    unit = %statement.unit,
                    "unit not normalizable, dropping statement"
                );
                unresolved += 1;
                failures.push(DocumentFailure {
                    doc_id: doc_id.to_string(),
                    kind: FailureKind::AggregationAmbiguity,
                    detail: format!(
                        "sentence {}: unit '{}' has no factor for category '{}'",
                        statement.sentence_index, statement.unit, statement.category
                    ),
                });
            }
        }
    }

    let records = by_category
        .into_iter()
        .map(|(category, mut entries)| {
            entries.sort_by(|a, b| a.0.total_cmp(&b.0));
            let values: Vec<f64> = entries.iter().map(|(value, _)| *value).collect();
            let mut source_sentences: Vec<usize> =
                entries.iter().map(|(_, index)| *index).collect();
            source_sentences.sort_unstable();

            IndividualMetricRecord {
                doc_id: doc_id.to_string(),
                category: category.to_string(),
                value: median(&values),
                unit: config.metrics[category].canonical_unit.clone(),
                statistic: "median".to_string(),
                statement_count: values.len(),
                source_sentences,
            }
        })
        .collect();

    (
        IndividualMetricSet {
            doc_id: doc_id.to_string(),
            records,
        },
        unresolved,
        failures,
    )
}

/// Median of a non-empty sorted slice; an even count averages the middle two.
fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}
