use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Pipeline configuration, loaded from YAML and validated before any stage
/// starts. Validation failures are fatal: the batch never begins on a bad
/// threshold, ratio, or credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub topic: String,
    pub llm: LlmProfiles,
    pub metrics: BTreeMap<String, MetricSpec>,
    pub filter: FilterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
}

/// The three named LLM capability profiles: `default` for general use,
/// `reasoning` for trend synthesis, `retrieval` for structured extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfiles {
    pub default: LlmProfileConfig,
    pub reasoning: LlmProfileConfig,
    pub retrieval: LlmProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfileConfig {
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    pub description: String,
    pub canonical_unit: String,
    /// Statement unit -> multiplicative factor into the canonical unit.
    pub unit_factors: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterScope {
    PerCategory,
    Combined,
}

impl FilterScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerCategory => "per-category",
            Self::Combined => "combined",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Fraction of floor-passing documents to retain, in (0, 1].
    pub ratio: f64,
    /// Hard floor on the ranking score.
    pub primary_filtering_thres: f64,
    pub scope: FilterScope,
    /// Category the floor and ranking apply to when scope is per-category.
    #[serde(default)]
    pub primary_category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Upper bound on evidence sentences supplied per paper to the
    /// trend-mining and support-summary prompts.
    pub max_sentences_per_paper: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_sentences_per_paper: 12,
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_timeout_secs() -> u64 {
    60
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            bail!("config: topic must not be empty");
        }
        if !(self.filter.ratio > 0.0 && self.filter.ratio <= 1.0) {
            bail!(
                "config: filter.ratio must be in (0, 1], got {}",
                self.filter.ratio
            );
        }
        if !self.filter.primary_filtering_thres.is_finite() {
            bail!("config: filter.primary_filtering_thres must be finite");
        }
        if self.filter.scope == FilterScope::PerCategory {
            match &self.filter.primary_category {
                Some(category) if self.metrics.contains_key(category) => {}
                Some(category) => {
                    bail!("config: filter.primary_category '{category}' is not a configured metric")
                }
                None => bail!("config: filter.primary_category is required for per-category scope"),
            }
        }
        if self.retry.max_attempts == 0 {
            bail!("config: retry.max_attempts must be at least 1");
        }
        if self.concurrency.workers == 0 {
            bail!("config: concurrency.workers must be at least 1");
        }
        if self.evidence.max_sentences_per_paper == 0 {
            bail!("config: evidence.max_sentences_per_paper must be at least 1");
        }
        if self.metrics.is_empty() {
            bail!("config: at least one metric category must be configured");
        }
        for (name, spec) in &self.metrics {
            if spec.canonical_unit.trim().is_empty() {
                bail!("config: metric '{name}' has an empty canonical_unit");
            }
            for (unit, factor) in &spec.unit_factors {
                if !factor.is_finite() || *factor == 0.0 {
                    bail!("config: metric '{name}' unit '{unit}' has invalid factor {factor}");
                }
            }
        }
        for (profile_name, profile) in [
            ("default", &self.llm.default),
            ("reasoning", &self.llm.reasoning),
            ("retrieval", &self.llm.retrieval),
        ] {
            profile
                .validate()
                .with_context(|| format!("config: llm profile '{profile_name}' is invalid"))?;
        }
        Ok(())
    }
}

impl LlmProfileConfig {
    fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            bail!("model must not be empty");
        }
        if self.base_url.trim().is_empty() {
            bail!("base_url must not be empty");
        }
        self.resolve_api_key().map(|_| ())
    }

    /// Resolves the credential from the literal value or the named
    /// environment variable. Missing credentials are a startup failure.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            if !key.trim().is_empty() {
                return Ok(key.clone());
            }
        }
        if let Some(var) = &self.api_key_env {
            return std::env::var(var)
                .with_context(|| format!("credential environment variable '{var}' is not set"));
        }
        bail!("no credential: set api_key or api_key_env")
    }
}

impl MetricSpec {
    /// Factor that converts a statement's unit into the canonical unit, or
    /// None when the unit is not normalizable for this category.
    pub fn normalization_factor(&self, unit: &str) -> Option<f64> {
        let trimmed = unit.trim();
        if trimmed.eq_ignore_ascii_case(&self.canonical_unit) {
            return Some(1.0);
        }
        if let Some(factor) = self.unit_factors.get(trimmed) {
            return Some(*factor);
        }
        let lowered = trimmed.to_ascii_lowercase();
        self.unit_factors
            .iter()
            .find(|(known, _)| known.to_ascii_lowercase() == lowered)
            .map(|(_, factor)| *factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> String {
        r#"
topic: "Fe single-atom catalysts"
llm:
  default:
    model: test-default
    base_url: http://localhost:8000/v1
    api_key: test-key
  reasoning:
    model: test-reasoning
    base_url: http://localhost:8000/v1
    api_key: test-key
  retrieval:
    model: test-retrieval
    base_url: http://localhost:8000/v1
    api_key: test-key
metrics:
  activity:
    description: "Catalytic activity, e.g. half-wave potential."
    canonical_unit: "V"
    unit_factors:
      V: 1.0
      mV: 0.001
filter:
  ratio: 0.3
  primary_filtering_thres: 5.0
  scope: per-category
  primary_category: activity
"#
        .to_string()
    }

    fn parse(yaml: &str) -> PipelineConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let config = parse(&sample_yaml());
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.llm.retrieval.model, "test-retrieval");
        assert_eq!(config.llm.default.max_tokens, 1024);
    }

    #[test]
    fn ratio_outside_unit_interval_is_fatal() {
        let mut config = parse(&sample_yaml());
        config.filter.ratio = 1.5;
        assert!(config.validate().is_err());

        config.filter.ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn per_category_scope_requires_known_primary_category() {
        let mut config = parse(&sample_yaml());
        config.filter.primary_category = None;
        assert!(config.validate().is_err());

        config.filter.primary_category = Some("stability".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_credential_is_fatal() {
        let mut config = parse(&sample_yaml());
        config.llm.reasoning.api_key = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_budget_is_fatal() {
        let mut config = parse(&sample_yaml());
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalization_factor_handles_case_and_unknown_units() {
        let config = parse(&sample_yaml());
        let spec = &config.metrics["activity"];

        assert_eq!(spec.normalization_factor("V"), Some(1.0));
        assert_eq!(spec.normalization_factor(" mV "), Some(0.001));
        assert_eq!(spec.normalization_factor("mv"), Some(0.001));
        assert_eq!(spec.normalization_factor("furlongs"), None);
    }
}
