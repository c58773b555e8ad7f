use std::collections::BTreeMap;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

use crate::cli::FilterArgs;
use crate::config::{FilterScope, PipelineConfig};
use crate::model::{
    FilterCounts, HighPerformanceList, HighPerformancePaper, OverallMetricRecord,
    StageRunManifest,
};
use crate::store::{ArtifactKind, ArtifactStore, PipelineStage};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: FilterArgs) -> Result<()> {
    let mut config = PipelineConfig::load(&args.config)?;
    apply_overrides(&mut config, args.ratio, args.primary_filtering_thres)?;

    let store = ArtifactStore::new(&args.cache_root);
    let manifest = filter_corpus(&store, &config)?;
    store.write_run_manifest(PipelineStage::Filter, &manifest)?;
    info!(
        docs = manifest.counts.doc_count,
        passed_floor = manifest.counts.passed_floor,
        retained = manifest.counts.retained,
        "filter stage completed"
    );

    Ok(())
}

pub fn apply_overrides(
    config: &mut PipelineConfig,
    ratio: Option<f64>,
    primary_filtering_thres: Option<f64>,
) -> Result<()> {
    if let Some(ratio) = ratio {
        if !(ratio > 0.0 && ratio <= 1.0) {
            bail!("--ratio must be in (0, 1], got {ratio}");
        }
        config.filter.ratio = ratio;
    }
    if let Some(thres) = primary_filtering_thres {
        if !thres.is_finite() {
            bail!("--primary-filtering-thres must be finite");
        }
        config.filter.primary_filtering_thres = thres;
    }
    Ok(())
}

/// Scores every aggregated document, applies the hard floor, then retains the
/// top fraction of floor-passing papers. The ranked list is the one corpus
/// artifact of this stage.
pub fn filter_corpus(
    store: &ArtifactStore,
    config: &PipelineConfig,
) -> Result<StageRunManifest<FilterCounts>> {
    let started_at = now_utc_string();
    let doc_ids = store.list_doc_ids(ArtifactKind::OverallMetrics)?;

    let mut records = Vec::with_capacity(doc_ids.len());
    for doc_id in &doc_ids {
        let record: OverallMetricRecord = store.read_doc(ArtifactKind::OverallMetrics, doc_id)?;
        records.push(record);
    }

    let papers = rank_papers(config, &records);
    let counts = FilterCounts {
        doc_count: records.len(),
        passed_floor: papers.passed_floor,
        retained: papers.retained.len(),
    };

    let list = HighPerformanceList {
        generated_at: now_utc_string(),
        ratio: config.filter.ratio,
        primary_filtering_thres: config.filter.primary_filtering_thres,
        scope: config.filter.scope.as_str().to_string(),
        papers: papers.retained,
    };
    write_json_pretty(&store.high_performance_path(), &list)?;

    Ok(StageRunManifest {
        manifest_version: 1,
        run_id: format!("filter-{}", utc_compact_string(Utc::now())),
        stage: PipelineStage::Filter.name().to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        failures: Vec::new(),
        warnings: Vec::new(),
        counts,
    })
}

struct RankedPapers {
    passed_floor: usize,
    retained: Vec<HighPerformancePaper>,
}

fn rank_papers(config: &PipelineConfig, records: &[OverallMetricRecord]) -> RankedPapers {
    let ranges = category_ranges(records);
    let mut scored: Vec<(f64, &OverallMetricRecord)> = records
        .iter()
        .filter_map(|record| score(config, &ranges, record).map(|score| (score, record)))
        .filter(|(score, _)| *score >= config.filter.primary_filtering_thres)
        .collect();

    let passed_floor = scored.len();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.doc_id.cmp(&b.1.doc_id)));

    let keep = ((config.filter.ratio * passed_floor as f64).ceil() as usize).min(passed_floor);
    let retained = scored
        .into_iter()
        .take(keep)
        .enumerate()
        .map(|(index, (score, record))| HighPerformancePaper {
            doc_id: record.doc_id.clone(),
            rank: index + 1,
            score,
            overall: record.clone(),
        })
        .collect();

    RankedPapers {
        passed_floor,
        retained,
    }
}

/// Ranking score for one document, or None when the document has no value the
/// configured scope can score.
fn score(
    config: &PipelineConfig,
    ranges: &BTreeMap<&str, (f64, f64)>,
    record: &OverallMetricRecord,
) -> Option<f64> {
    match config.filter.scope {
        FilterScope::PerCategory => {
            let category = config.filter.primary_category.as_deref()?;
            record.values.get(category).copied()
        }
        FilterScope::Combined => {
            let mut normalized = Vec::new();
            for (category, value) in &record.values {
                let (min, max) = ranges[category.as_str()];
                // A degenerate corpus range carries no ordering signal.
                let scaled = if max > min { (value - min) / (max - min) } else { 0.5 };
                normalized.push(scaled);
            }
            if normalized.is_empty() {
                None
            } else {
                Some(normalized.iter().sum::<f64>() / normalized.len() as f64)
            }
        }
    }
}

fn category_ranges(records: &[OverallMetricRecord]) -> BTreeMap<&str, (f64, f64)> {
    let mut ranges: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for record in records {
        for (category, value) in &record.values {
            ranges
                .entry(category.as_str())
                .and_modify(|(min, max)| {
                    *min = min.min(*value);
                    *max = max.max(*value);
                })
                .or_insert((*value, *value));
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(scope: &str) -> PipelineConfig {
        serde_yaml::from_str(&format!(
            r#"
topic: "Fe single-atom catalysts"
llm:
  default: {{ model: m, base_url: "http://x", api_key: k }}
  reasoning: {{ model: m, base_url: "http://x", api_key: k }}
  retrieval: {{ model: m, base_url: "http://x", api_key: k }}
metrics:
  activity:
    description: "half-wave potential"
    canonical_unit: "V"
    unit_factors: {{}}
  stability:
    description: "retention"
    canonical_unit: "%"
    unit_factors: {{}}
filter:
  ratio: 0.3
  primary_filtering_thres: 5.0
  scope: {scope}
  primary_category: activity
"#
        ))
        .unwrap()
    }

    fn record(doc_id: &str, values: &[(&str, f64)]) -> OverallMetricRecord {
        OverallMetricRecord {
            doc_id: doc_id.to_string(),
            values: values
                .iter()
                .map(|(category, value)| (category.to_string(), *value))
                .collect(),
            unresolved_statements: 0,
        }
    }

    #[test]
    fn floor_then_ratio_over_survivors() {
        let config = test_config("per-category");
        let records = vec![
            record("p01", &[("activity", 9.0)]),
            record("p02", &[("activity", 8.0)]),
            record("p03", &[("activity", 7.0)]),
            record("p04", &[("activity", 6.0)]),
            record("p05", &[("activity", 5.5)]),
            record("p06", &[("activity", 5.0)]),
            record("p07", &[("activity", 4.0)]),
            record("p08", &[("activity", 3.0)]),
            record("p09", &[("activity", 2.0)]),
            record("p10", &[("activity", 1.0)]),
        ];

        let ranked = rank_papers(&config, &records);
        assert_eq!(ranked.passed_floor, 6);
        assert_eq!(ranked.retained.len(), 2);
        assert_eq!(ranked.retained[0].doc_id, "p01");
        assert_eq!(ranked.retained[0].rank, 1);
        assert_eq!(ranked.retained[0].score, 9.0);
        assert_eq!(ranked.retained[1].doc_id, "p02");
        assert_eq!(ranked.retained[1].score, 8.0);
    }

    #[test]
    fn missing_primary_category_fails_the_floor() {
        let config = test_config("per-category");
        let records = vec![
            record("p1", &[("activity", 9.0)]),
            record("p2", &[("stability", 99.0)]),
        ];

        let ranked = rank_papers(&config, &records);
        assert_eq!(ranked.passed_floor, 1);
        assert_eq!(ranked.retained[0].doc_id, "p1");
    }

    #[test]
    fn ties_break_by_doc_id_ascending() {
        let config = test_config("per-category");
        let records = vec![
            record("p-b", &[("activity", 8.0)]),
            record("p-a", &[("activity", 8.0)]),
            record("p-c", &[("activity", 8.0)]),
        ];

        let mut config = config;
        config.filter.ratio = 1.0;
        let ranked = rank_papers(&config, &records);
        let ids: Vec<&str> = ranked.retained.iter().map(|p| p.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["p-a", "p-b", "p-c"]);
    }

    #[test]
    fn combined_scope_min_max_normalizes_each_category() {
        let mut config = test_config("combined");
        config.filter.primary_filtering_thres = 0.0;
        config.filter.ratio = 1.0;

        let records = vec![
            record("p1", &[("activity", 1.0), ("stability", 90.0)]),
            record("p2", &[("activity", 0.0), ("stability", 80.0)]),
            record("p3", &[("activity", 0.5)]),
        ];

        let ranked = rank_papers(&config, &records);
        assert_eq!(ranked.retained[0].doc_id, "p1");
        assert_eq!(ranked.retained[0].score, 1.0);
        // p3 is scored over its one resolved category only.
        let p3 = ranked.retained.iter().find(|p| p.doc_id == "p3").unwrap();
        assert_eq!(p3.score, 0.5);
    }

    #[test]
    fn degenerate_corpus_range_scores_neutral() {
        let mut config = test_config("combined");
        config.filter.primary_filtering_thres = 0.0;
        config.filter.ratio = 1.0;

        let records = vec![
            record("p1", &[("activity", 0.85)]),
            record("p2", &[("activity", 0.85)]),
        ];

        let ranked = rank_papers(&config, &records);
        assert_eq!(ranked.retained.len(), 2);
        assert!(ranked.retained.iter().all(|p| p.score == 0.5));
    }

    #[test]
    fn empty_corpus_writes_an_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let manifest = filter_corpus(&store, &test_config("per-category")).unwrap();
        assert_eq!(manifest.counts.doc_count, 0);
        assert_eq!(manifest.counts.retained, 0);

        let list: HighPerformanceList =
            crate::util::read_json(&store.high_performance_path()).unwrap();
        assert!(list.papers.is_empty());
    }

    #[test]
    fn override_validation_rejects_bad_values() {
        let mut config = test_config("combined");
        assert!(apply_overrides(&mut config, Some(1.5), None).is_err());
        assert!(apply_overrides(&mut config, None, Some(f64::NAN)).is_err());
        apply_overrides(&mut config, Some(0.5), Some(2.0)).unwrap();
        assert_eq!(config.filter.ratio, 0.5);
        assert_eq!(config.filter.primary_filtering_thres, 2.0);
    }
}
