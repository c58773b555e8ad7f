use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::InventoryArgs;
use crate::model::{PaperEntry, PaperInventoryManifest};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: InventoryArgs) -> Result<()> {
    let pdf_root = args.pdf_root.clone().unwrap_or_else(|| args.cache_root.clone());
    let manifest = build_manifest(&pdf_root)?;

    if args.dry_run {
        info!(
            paper_count = manifest.paper_count,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| args.cache_root.join("manifests").join("paper_inventory.json"));

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(paper_count = manifest.paper_count, "inventory completed");

    Ok(())
}

pub fn build_manifest(pdf_root: &Path) -> Result<PaperInventoryManifest> {
    let mut pdf_paths = discover_pdfs(pdf_root)?;
    pdf_paths.sort();

    if pdf_paths.is_empty() {
        bail!("no PDFs found in {}", pdf_root.display());
    }

    let mut seen_ids = HashSet::new();
    let mut papers = Vec::with_capacity(pdf_paths.len());

    for path in pdf_paths {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;

        let doc_id = doc_id_from_filename(&filename);
        if !seen_ids.insert(doc_id.clone()) {
            bail!("duplicate document id '{doc_id}' derived from {filename}; input filenames must be unique");
        }

        let sha256 = sha256_file(&path)?;
        papers.push(PaperEntry {
            doc_id,
            filename,
            sha256,
        });
    }

    papers.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));

    Ok(PaperInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: pdf_root.display().to_string(),
        paper_count: papers.len(),
        papers,
    })
}

/// Doc ids come from the sanitized file stem; DOI-derived filenames such as
/// `10.1038_s41560-020-0576-y.pdf` keep their identity.
pub fn doc_id_from_filename(filename: &str) -> String {
    let stem = filename
        .strip_suffix(".pdf")
        .or_else(|| filename.strip_suffix(".PDF"))
        .unwrap_or(filename);

    let mut out = String::with_capacity(stem.len());
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }

    while out.contains("__") {
        out = out.replace("__", "_");
    }

    out.trim_matches('_').to_string()
}

fn discover_pdfs(pdf_root: &Path) -> Result<Vec<PathBuf>> {
    let mut pdfs = Vec::new();

    let entries =
        fs::read_dir(pdf_root).with_context(|| format!("failed to read {}", pdf_root.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", pdf_root.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);

        if is_pdf {
            pdfs.push(path);
        }
    }

    Ok(pdfs)
}
