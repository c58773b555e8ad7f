use std::collections::BTreeMap;

use crate::config::MetricSpec;

/// System prompt for the per-document sentence-label confirmation call.
/// The user message carries the prescreened sentences as `index: text` lines;
/// the model answers with the indices that truly report metric values.
pub fn label_system_prompt(topic: &str) -> String {
    format!(
        "You are a research assistant screening sentences from a scientific paper \
         on the topic \"{topic}\". The user provides numbered candidate sentences. \
         Select the indices of sentences that report an explicit experimental \
         numerical result for a performance metric of the studied system. \
         Exclude citations, figure references, and sentences without a concrete \
         measured value.\n\n\
         Respond with strict JSON only, no extra text:\n\
         {{\"candidate_indices\": [0, 4, 7]}}"
    )
}

/// System prompt for the per-sentence structured metric extraction call.
pub fn extract_system_prompt(metrics: &BTreeMap<String, MetricSpec>) -> String {
    let mut catalog = String::new();
    for (name, spec) in metrics {
        catalog.push_str(&format!(
            "- {name}: {} (canonical unit: {})\n",
            spec.description, spec.canonical_unit
        ));
    }

    format!(
        "You are a research assistant extracting one performance measurement from \
         a single sentence of a scientific paper. The recognized metric categories \
         are:\n{catalog}\n\
         Return the category, the numeric value exactly as reported, and the unit \
         it is reported in. The value must be a JSON number, never a string. If the \
         sentence reports no measurement for any recognized category, return \
         \"not_available\" as the category.\n\n\
         Respond with strict JSON only, no extra text:\n\
         {{\"category\": \"activity\", \"value\": 0.85, \"unit\": \"V\"}}"
    )
}

/// System prompt for the corpus-wide trend-mining call. The user message
/// carries one evidence digest per high-performance paper.
pub fn trend_system_prompt(topic: &str) -> String {
    format!(
        "You are a research assistant synthesizing research trends on the topic \
         \"{topic}\" from the highest-performing papers of a corpus. The user \
         provides, per paper, its document id, its resolved metric values, and \
         representative evidence sentences. Produce up to 8 distinct trend claims. \
         Every claim must cite only document ids that appear in the provided \
         papers.\n\n\
         Respond with a strict JSON array only, no extra text:\n\
         [{{\"trend_type\": \"material-design\", \"description\": \"...\", \
         \"supporting_docs\": [\"doc-a\", \"doc-b\"]}}]"
    )
}

/// System prompt for the per-document support summary of one accepted claim.
pub fn support_system_prompt(claim_description: &str) -> String {
    format!(
        "You are a research assistant. Given evidence sentences from one paper, \
         summarize in 2-3 sentences how this paper supports the trend claim: \
         \"{claim_description}\". Only use the provided evidence; if the evidence \
         is weak say so plainly.\n\n\
         Respond with strict JSON only, no extra text:\n\
         {{\"summary\": \"...\"}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn extract_prompt_lists_configured_categories() {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "activity".to_string(),
            MetricSpec {
                description: "catalytic activity".to_string(),
                canonical_unit: "V".to_string(),
                unit_factors: BTreeMap::new(),
            },
        );

        let prompt = extract_system_prompt(&metrics);
        assert!(prompt.contains("- activity: catalytic activity"));
        assert!(prompt.contains("canonical unit: V"));
    }

    #[test]
    fn topic_is_interpolated() {
        let prompt = trend_system_prompt("Fe single-atom catalysts");
        assert!(prompt.contains("Fe single-atom catalysts"));
    }
}
