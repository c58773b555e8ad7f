use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperEntry {
    pub doc_id: String,
    pub filename: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub paper_count: usize,
    pub papers: Vec<PaperEntry>,
}

/// One positioned text block from the document-parsing collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub page: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SentenceLabel {
    CandidateMetric,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledSentence {
    pub doc_id: String,
    pub index: usize,
    pub page: u32,
    pub text: String,
    pub label: SentenceLabel,
}

/// Per-document labeled-sentence checkpoint. `no_content` marks documents
/// whose segmentation produced zero sentences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledSentenceSet {
    pub doc_id: String,
    pub no_content: bool,
    pub sentences: Vec<LabeledSentence>,
}

/// One validated extraction. Malformed LLM responses are dropped before this
/// type is ever constructed, so a persisted statement always carries a finite
/// numeric value and a non-empty unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricStatement {
    pub doc_id: String,
    pub category: String,
    pub value: f64,
    pub unit: String,
    pub sentence_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricStatementSet {
    pub doc_id: String,
    pub statements: Vec<MetricStatement>,
    pub extraction_failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualMetricRecord {
    pub doc_id: String,
    pub category: String,
    pub value: f64,
    pub unit: String,
    pub statistic: String,
    pub statement_count: usize,
    pub source_sentences: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualMetricSet {
    pub doc_id: String,
    pub records: Vec<IndividualMetricRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallMetricRecord {
    pub doc_id: String,
    pub values: BTreeMap<String, f64>,
    pub unresolved_statements: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighPerformancePaper {
    pub doc_id: String,
    pub rank: usize,
    pub score: f64,
    pub overall: OverallMetricRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighPerformanceList {
    pub generated_at: String,
    pub ratio: f64,
    pub primary_filtering_thres: f64,
    pub scope: String,
    pub papers: Vec<HighPerformancePaper>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceClaim {
    pub claim_key: String,
    pub trend_type: String,
    pub description: String,
    pub supporting_docs: Vec<String>,
}

/// Terminal pipeline output: ordered trend claims plus, per claim, the
/// per-document support summaries that back it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceArtifact {
    pub generated_at: String,
    pub topic: String,
    pub claims: Vec<GuidanceClaim>,
    pub support_summaries: BTreeMap<String, BTreeMap<String, String>>,
    pub rejected_claims: usize,
    pub summary_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    Segmentation,
    ExtractionSchema,
    LlmService,
    AggregationAmbiguity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub doc_id: String,
    pub kind: FailureKind,
    pub detail: String,
}

/// Per-stage run manifest, written next to the stage's artifacts once the
/// stage has covered the whole corpus. Its presence gates the next stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRunManifest<C> {
    pub manifest_version: u32,
    pub run_id: String,
    pub stage: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub failures: Vec<DocumentFailure>,
    pub warnings: Vec<String>,
    pub counts: C,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelCounts {
    pub paper_count: usize,
    pub labeled_doc_count: usize,
    pub skipped_existing: usize,
    pub parse_failures: usize,
    pub no_content_docs: usize,
    pub llm_label_failures: usize,
    pub sentences_total: usize,
    pub candidate_sentences: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractCounts {
    pub doc_count: usize,
    pub processed_doc_count: usize,
    pub skipped_existing: usize,
    pub candidate_sentences: usize,
    pub statements_extracted: usize,
    pub schema_failures: usize,
    pub retry_exhausted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub doc_count: usize,
    pub statements_seen: usize,
    pub statements_normalized: usize,
    pub unresolved_statements: usize,
    pub individual_records: usize,
    pub overall_records: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCounts {
    pub doc_count: usize,
    pub passed_floor: usize,
    pub retained: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuideCounts {
    pub paper_count: usize,
    pub claims_generated: usize,
    pub claims_rejected: usize,
    pub summaries_generated: usize,
    pub summary_failures: usize,
}
