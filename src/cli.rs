use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "trendmine",
    version,
    about = "Research-trend extraction pipeline over a corpus of scientific PDFs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the input directory and write the paper inventory manifest.
    Inventory(InventoryArgs),
    /// Parse and segment each paper, label candidate metric sentences.
    Label(LabelArgs),
    /// Extract structured metric statements from candidate sentences.
    Extract(ExtractArgs),
    /// Reconcile statements into individual and overall metric records.
    Aggregate(AggregateArgs),
    /// Rank and filter the corpus into the high-performance paper list.
    Filter(FilterArgs),
    /// Synthesize trend claims and support summaries from the filtered set.
    Guide(GuideArgs),
    /// Run the full pipeline, resuming from existing checkpoints.
    Run(RunArgs),
    /// Report checkpoint state and recorded failure counts.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    /// Directory containing the input PDFs; defaults to the cache root.
    #[arg(long)]
    pub pdf_root: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LabelArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "trendmine.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub pdf_root: Option<PathBuf>,

    #[arg(long)]
    pub inventory_manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub refresh_inventory: bool,

    #[arg(long)]
    pub max_pages_per_doc: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "trendmine.yaml")]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct AggregateArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "trendmine.yaml")]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "trendmine.yaml")]
    pub config: PathBuf,

    /// Overrides filter.ratio from the configuration file.
    #[arg(long)]
    pub ratio: Option<f64>,

    /// Overrides filter.primary_filtering_thres from the configuration file.
    #[arg(long)]
    pub primary_filtering_thres: Option<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct GuideArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "trendmine.yaml")]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "trendmine.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub pdf_root: Option<PathBuf>,

    #[arg(long)]
    pub max_pages_per_doc: Option<usize>,

    #[arg(long)]
    pub ratio: Option<f64>,

    #[arg(long)]
    pub primary_filtering_thres: Option<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/trendmine")]
    pub cache_root: PathBuf,
}
