use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::model::TextBlock;

/// Document-parsing collaborator: raw PDF bytes in, positioned text blocks
/// out. A document with no extractable text yields an empty-but-valid block
/// list; a broken file yields a distinguishable error.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, pdf_path: &Path) -> Result<Vec<TextBlock>>;
}

/// pdftotext-backed parser. One block per page, form-feed separated, trailing
/// blank pages trimmed.
pub struct PdftotextParser {
    max_pages_per_doc: Option<usize>,
}

impl PdftotextParser {
    pub fn new(max_pages_per_doc: Option<usize>) -> Self {
        Self { max_pages_per_doc }
    }
}

impl DocumentParser for PdftotextParser {
    fn parse(&self, pdf_path: &Path) -> Result<Vec<TextBlock>> {
        let mut command = Command::new("pdftotext");
        command.arg("-enc").arg("UTF-8").arg("-f").arg("1");
        if let Some(max_pages) = self.max_pages_per_doc {
            command.arg("-l").arg(max_pages.to_string());
        }
        command.arg(pdf_path).arg("-");

        let output = command
            .output()
            .with_context(|| format!("failed to execute pdftotext for {}", pdf_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pdftotext returned non-zero exit status for {}: {}",
                pdf_path.display(),
                stderr.trim()
            );
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        Ok(pages_to_blocks(&raw))
    }
}

fn pages_to_blocks(raw: &str) -> Vec<TextBlock> {
    let mut pages: Vec<String> = raw
        .split('\u{000C}')
        .map(|chunk| chunk.replace('\u{0000}', ""))
        .collect();

    while let Some(last_page) = pages.last() {
        if last_page.trim().is_empty() {
            pages.pop();
            continue;
        }
        break;
    }

    pages
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextBlock {
            page: (index + 1) as u32,
            text,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_split_on_form_feed_with_one_based_numbers() {
        let blocks = pages_to_blocks("first page\u{000C}second page");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].page, 1);
        assert_eq!(blocks[0].text, "first page");
        assert_eq!(blocks[1].page, 2);
    }

    #[test]
    fn trailing_blank_pages_are_trimmed() {
        let blocks = pages_to_blocks("content\u{000C}  \n\u{000C}\u{000C}");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn empty_output_is_valid_and_empty() {
        assert!(pages_to_blocks("").is_empty());
    }
}
