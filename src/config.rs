//! TOML configuration.
//!
//! Only `[db]` is required. Every threshold used by the ranker, the edge
//! analyzers, the entropy scorers, the suggestion rules, the staging area,
//! and the idle scheduler has a default here and can be overridden per
//! machine.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub entropy: EntropyConfig,
    #[serde(default)]
    pub suggestions: SuggestionConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Deadline applied by callers around each endpoint round-trip.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of leading content tokens appended for text-like files.
    #[serde(default = "default_content_tokens")]
    pub content_tokens: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            content_tokens: default_content_tokens(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_content_tokens() -> usize {
    256
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("nomic-embed-text")
    }

    pub fn endpoint(&self) -> &str {
        self.url.as_deref().unwrap_or("http://localhost:11434")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Candidates fetched per signal before fusion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
    #[serde(default)]
    pub intent_weighting: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_k: default_candidate_k(),
            final_limit: default_final_limit(),
            query_cache_size: default_query_cache_size(),
            intent_weighting: false,
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_candidate_k() -> usize {
    50
}
fn default_final_limit() -> usize {
    20
}
fn default_query_cache_size() -> usize {
    64
}

/// Which files count as text, and the size ceilings for reading content.
#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_text_globs")]
    pub text_globs: Vec<String>,
    /// Files above this size get no content fingerprint.
    #[serde(default = "default_hash_max_bytes")]
    pub hash_max_bytes: u64,
    /// Files above this size are not scanned for references or embedded with content.
    #[serde(default = "default_text_max_bytes")]
    pub text_max_bytes: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            text_globs: default_text_globs(),
            hash_max_bytes: default_hash_max_bytes(),
            text_max_bytes: default_text_max_bytes(),
        }
    }
}

fn default_text_globs() -> Vec<String> {
    [
        "rs", "py", "js", "ts", "md", "txt", "toml", "yaml", "yml", "json", "html", "css", "csv",
    ]
    .iter()
    .map(|ext| format!("**/*.{}", ext))
    .collect()
}
fn default_hash_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_text_max_bytes() -> u64 {
    100 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Directories with more files than this are skipped by the sibling analyzer.
    #[serde(default = "default_sibling_max_dir_files")]
    pub sibling_max_dir_files: usize,
    #[serde(default = "default_reference_min_stem_len")]
    pub reference_min_stem_len: usize,
    #[serde(default = "default_reference_strength")]
    pub reference_strength: f64,
    #[serde(default = "default_comod_window_days")]
    pub comod_window_days: u32,
    #[serde(default = "default_comod_min_strength")]
    pub comod_min_strength: f64,
    #[serde(default)]
    pub repositories: Vec<PathBuf>,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub cross_directory_similarity: bool,
    #[serde(default = "default_cross_dir_threshold")]
    pub cross_directory_threshold: f64,
    /// Similarity at or above this is promoted to a duplicate edge.
    #[serde(default = "default_duplicate_similarity")]
    pub duplicate_similarity: f64,
    #[serde(default = "default_prune_below")]
    pub prune_below: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sibling_max_dir_files: default_sibling_max_dir_files(),
            reference_min_stem_len: default_reference_min_stem_len(),
            reference_strength: default_reference_strength(),
            comod_window_days: default_comod_window_days(),
            comod_min_strength: default_comod_min_strength(),
            repositories: Vec::new(),
            similarity_threshold: default_similarity_threshold(),
            cross_directory_similarity: false,
            cross_directory_threshold: default_cross_dir_threshold(),
            duplicate_similarity: default_duplicate_similarity(),
            prune_below: default_prune_below(),
        }
    }
}

fn default_sibling_max_dir_files() -> usize {
    200
}
fn default_reference_min_stem_len() -> usize {
    3
}
fn default_reference_strength() -> f64 {
    0.6
}
fn default_comod_window_days() -> u32 {
    180
}
fn default_comod_min_strength() -> f64 {
    0.3
}
fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_cross_dir_threshold() -> f64 {
    0.92
}
fn default_duplicate_similarity() -> f64 {
    0.98
}
fn default_prune_below() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EntropyWeights {
    pub naming: f64,
    pub age: f64,
    pub depth: f64,
    pub duplicate: f64,
    pub orphan: f64,
}

impl Default for EntropyWeights {
    fn default() -> Self {
        Self {
            naming: 0.25,
            age: 0.20,
            depth: 0.15,
            duplicate: 0.25,
            orphan: 0.15,
        }
    }
}

impl EntropyWeights {
    pub fn as_array(&self) -> [f64; 5] {
        [self.naming, self.age, self.depth, self.duplicate, self.orphan]
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EntropyConfig {
    #[serde(default)]
    pub weights: EntropyWeights,
    /// Modification-time spread at which age spread saturates at 1.0.
    #[serde(default = "default_age_ceiling_days")]
    pub age_ceiling_days: u32,
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            weights: EntropyWeights::default(),
            age_ceiling_days: default_age_ceiling_days(),
            max_chain_depth: default_max_chain_depth(),
        }
    }
}

fn default_age_ceiling_days() -> u32 {
    180
}
fn default_max_chain_depth() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct SuggestionConfig {
    #[serde(default = "default_archive_inactive_days")]
    pub archive_inactive_days: u32,
    #[serde(default = "default_duplicate_ratio")]
    pub duplicate_ratio: f64,
    #[serde(default = "default_depth_waste")]
    pub depth_waste: f64,
    #[serde(default = "default_naming_entropy")]
    pub naming_entropy: f64,
    #[serde(default = "default_composite")]
    pub composite: f64,
    /// Naming rules need at least this many files to be meaningful.
    #[serde(default = "default_naming_min_files")]
    pub naming_min_files: usize,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            archive_inactive_days: default_archive_inactive_days(),
            duplicate_ratio: default_duplicate_ratio(),
            depth_waste: default_depth_waste(),
            naming_entropy: default_naming_entropy(),
            composite: default_composite(),
            naming_min_files: default_naming_min_files(),
        }
    }
}

fn default_archive_inactive_days() -> u32 {
    180
}
fn default_duplicate_ratio() -> f64 {
    0.3
}
fn default_depth_waste() -> f64 {
    0.5
}
fn default_naming_entropy() -> f64 {
    0.6
}
fn default_composite() -> f64 {
    0.5
}
fn default_naming_min_files() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    /// Defaults to `<db dir>/staging`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Defaults to `<staging root>/archives`.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: None,
            archive_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    7
}

impl StagingConfig {
    pub fn root_for(&self, db_path: &Path) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => db_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("staging"),
        }
    }

    pub fn archive_dir_for(&self, db_path: &Path) -> PathBuf {
        match &self.archive_dir {
            Some(dir) => dir.clone(),
            None => self.root_for(db_path).join("archives"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Off by default: no background work and no resource use.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// A cancelled pass that got this far through its directories counts as done.
    #[serde(default = "default_partial_complete_ratio")]
    pub partial_complete_ratio: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_threshold_secs: default_idle_threshold_secs(),
            min_interval_secs: default_min_interval_secs(),
            tick_secs: default_tick_secs(),
            partial_complete_ratio: default_partial_complete_ratio(),
        }
    }
}

fn default_idle_threshold_secs() -> u64 {
    300
}
fn default_min_interval_secs() -> u64 {
    3600
}
fn default_tick_secs() -> u64 {
    5
}
fn default_partial_complete_ratio() -> f64 {
    0.9
}

impl Config {
    /// All-defaults configuration rooted at the given database path.
    pub fn minimal(db_path: &Path) -> Self {
        Self {
            db: DbConfig {
                path: db_path.to_path_buf(),
            },
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            content: ContentConfig::default(),
            graph: GraphConfig::default(),
            entropy: EntropyConfig::default(),
            suggestions: SuggestionConfig::default(),
            staging: StagingConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.staging.root_for(&self.db.path)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.staging.archive_dir_for(&self.db.path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.batch_size == 0 || self.embedding.batch_size > 32 {
            anyhow::bail!("embedding.batch_size must be in 1..=32");
        }
        match self.embedding.provider.as_str() {
            "disabled" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled or ollama.",
                other
            ),
        }

        if self.retrieval.rrf_k <= 0.0 {
            anyhow::bail!("retrieval.rrf_k must be > 0");
        }
        if self.retrieval.final_limit == 0 || self.retrieval.query_cache_size == 0 {
            anyhow::bail!("retrieval.final_limit and retrieval.query_cache_size must be >= 1");
        }

        let weights = self.entropy.weights.as_array();
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            anyhow::bail!("entropy.weights must be non-negative with a positive sum");
        }
        if self.entropy.age_ceiling_days == 0 {
            anyhow::bail!("entropy.age_ceiling_days must be > 0");
        }

        let ratios = [
            ("graph.reference_strength", self.graph.reference_strength),
            ("graph.comod_min_strength", self.graph.comod_min_strength),
            ("graph.similarity_threshold", self.graph.similarity_threshold),
            ("graph.cross_directory_threshold", self.graph.cross_directory_threshold),
            ("graph.duplicate_similarity", self.graph.duplicate_similarity),
            ("graph.prune_below", self.graph.prune_below),
            ("suggestions.duplicate_ratio", self.suggestions.duplicate_ratio),
            ("suggestions.depth_waste", self.suggestions.depth_waste),
            ("suggestions.naming_entropy", self.suggestions.naming_entropy),
            ("suggestions.composite", self.suggestions.composite),
            ("scheduler.partial_complete_ratio", self.scheduler.partial_complete_ratio),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be in [0.0, 1.0]", name);
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
