use crate::model::{TextBlock, LabeledSentence};

/// NLP segmentation collaborator: raw text in, ordered sentence list out.
/// Deterministic for identical input and rule version.
pub trait SentenceSegmenter: Send + Sync {
    fn segment(&self, text: &str) -> Vec<String>;
}

/// Words that end with a period mid-sentence in scientific prose.
const ABBREVIATIONS: &[&str] = &[
    "fig", "figs", "eq", "eqs", "ref", "refs", "al", "i.e", "e.g", "vs", "ca", "approx", "no",
    "dr", "prof", "etc",
];

/// Local deterministic segmenter: splits on sentence-final punctuation
/// followed by whitespace and a capitalized continuation, guarding decimals
/// ("0.85 V"), single-initial names ("J. Smith") and common abbreviations.
pub struct RuleSegmenter;

impl SentenceSegmenter for RuleSegmenter {
    fn segment(&self, text: &str) -> Vec<String> {
        let normalized = text.split_whitespace().collect::<Vec<&str>>().join(" ");
        if normalized.is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = normalized.chars().collect();
        let mut sentences = Vec::new();
        let mut start = 0;

        for i in 0..chars.len() {
            if !matches!(chars[i], '.' | '!' | '?') {
                continue;
            }
            if !is_boundary(&chars, start, i) {
                continue;
            }

            let sentence: String = chars[start..=i].iter().collect();
            let trimmed = sentence.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            start = i + 1;
        }

        let tail: String = chars[start..].iter().collect();
        let tail = tail.trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }

        sentences
    }
}

fn is_boundary(chars: &[char], start: usize, i: usize) -> bool {
    // Terminator must be followed by whitespace and a capitalized or
    // parenthesized continuation; end-of-text is always a boundary.
    match chars.get(i + 1) {
        None => return true,
        Some(next) if !next.is_whitespace() => return false,
        Some(_) => {}
    }

    let next_word_start = chars[i + 1..].iter().find(|c| !c.is_whitespace());
    match next_word_start {
        None => return true,
        Some(c) if c.is_ascii_uppercase() || *c == '(' => {}
        Some(_) => return false,
    }

    if chars[i] != '.' {
        return true;
    }

    // Word immediately before the period.
    let mut word_end = i;
    while word_end > start && !chars[word_end - 1].is_whitespace() {
        word_end -= 1;
    }
    let word: String = chars[word_end..i].iter().collect::<String>().to_lowercase();

    if ABBREVIATIONS.contains(&word.as_str()) {
        return false;
    }
    // Single-initial names such as "J." in author lists. A lone capital
    // right after a number is a unit symbol, which may end a sentence.
    if word.chars().count() == 1 && chars[word_end].is_ascii_uppercase() {
        let mut prev_end = word_end;
        while prev_end > start && chars[prev_end - 1].is_whitespace() {
            prev_end -= 1;
        }
        let follows_number = prev_end > start && chars[prev_end - 1].is_ascii_digit();
        if !follows_number {
            return false;
        }
    }

    true
}

/// Segments parsed text blocks into ordered labeled sentences, preserving the
/// block's page and assigning corpus-stable 0-based indices.
pub fn segment_blocks(
    segmenter: &dyn SentenceSegmenter,
    doc_id: &str,
    blocks: &[TextBlock],
) -> Vec<LabeledSentence> {
    use crate::model::SentenceLabel;

    let mut sentences = Vec::new();
    for block in blocks {
        for text in segmenter.segment(&block.text) {
            sentences.push(LabeledSentence {
                doc_id: doc_id.to_string(),
                index: sentences.len(),
                page: block.page,
                text,
                label: SentenceLabel::Other,
            });
        }
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_sentences() {
        let segmenter = RuleSegmenter;
        let sentences =
            segmenter.segment("The catalyst was stable. It retained 95% activity after 10k cycles.");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "The catalyst was stable.");
    }

    #[test]
    fn decimal_values_do_not_split() {
        let segmenter = RuleSegmenter;
        let sentences = segmenter.segment("The half-wave potential reached 0.85 V. This exceeds Pt/C.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("0.85 V."));
    }

    #[test]
    fn abbreviations_do_not_split() {
        let segmenter = RuleSegmenter;
        let sentences = segmenter.segment("As shown in Fig. 3, performance improved. See ref. 12.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].starts_with("As shown in Fig. 3"));
    }

    #[test]
    fn lowercase_continuation_does_not_split() {
        let segmenter = RuleSegmenter;
        let sentences = segmenter.segment("Samples were aged at 80 C. for two hours before testing.");
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn empty_and_whitespace_input_yield_no_sentences() {
        let segmenter = RuleSegmenter;
        assert!(segmenter.segment("").is_empty());
        assert!(segmenter.segment("   \n\t ").is_empty());
    }

    #[test]
    fn segmentation_is_deterministic() {
        let segmenter = RuleSegmenter;
        let text = "First result: 1.2 mA. Second result followed. Third was weaker!";
        assert_eq!(segmenter.segment(text), segmenter.segment(text));
    }

    #[test]
    fn block_segmentation_assigns_stable_indices_and_pages() {
        let blocks = vec![
            TextBlock {
                page: 1,
                text: "Sentence one. Sentence two.".to_string(),
            },
            TextBlock {
                page: 2,
                text: "Sentence three.".to_string(),
            },
        ];

        let sentences = segment_blocks(&RuleSegmenter, "doc", &blocks);
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].index, 0);
        assert_eq!(sentences[2].index, 2);
        assert_eq!(sentences[2].page, 2);
    }
}
