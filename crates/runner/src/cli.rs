use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "paceforge", version, about = "Polite multi-site scrape runner")]
pub struct Cli {
    /// Path to the site roster (JSON).
    #[arg(long, env = "PACEFORGE_SITES", default_value = "sites.json")]
    pub sites: PathBuf,

    /// Directory holding the record store and run log.
    #[arg(long, env = "PACEFORGE_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Only run these authorities (comma-separated).
    #[arg(long, env = "MORPH_AUTHORITIES", value_delimiter = ',')]
    pub authorities: Vec<String>,

    /// Authorities expected to fail; they downgrade errors to warnings
    /// in the run report (comma-separated).
    #[arg(long, env = "MORPH_EXPECT_BAD", value_delimiter = ',')]
    pub expect_bad: Vec<String>,

    /// Register sites in roster order instead of shuffling.
    /// (`MORPH_PROCESS_SEQUENTIALLY` set to anything has the same effect.)
    #[arg(long, default_value_t = false)]
    pub sequential: bool,
}
