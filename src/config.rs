//! Run configuration, read from a TOML file.
//!
//! ```toml
//! path = "data/"
//! output = "join.out"
//! bucksize = 1048576
//!
//! [build]
//! file = "part.tbl"
//! schema = ["long", "char(25)", "dec"]
//! jattr = 1
//! select = [2, 3]
//!
//! [probe]
//! file = "lineitem.tbl.bz2"
//! schema = ["long", "long", "int"]
//! jattr = 2
//! select = [1, 3]
//!
//! [algorithm]
//! copydata = true
//! threads = 4
//!
//! [experiment]
//! iterations = 10
//! selectivity = 10.0
//! domain = 200000
//! ```
//!
//! Column numbers are 1-based in the file and converted to 0-based here.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::{CacheConfig, DEFAULT_KEYS_PER_BUCKET, DEFAULT_REUSE_THRESHOLD, ReuseCache};
use crate::engine::{EngineConfig, Execution, ProbeMode, Storage};
use crate::error::{JoinError, Result};
use crate::schema::Schema;

/// Default cache budget, in whole-domain tables.
pub const DEFAULT_BUDGET_DOMAINS: u64 = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    /// Directory prefix for the input and output files.
    #[serde(default)]
    pub path: PathBuf,

    /// Output dump file name, relative to `path`.
    #[serde(default = "default_output")]
    pub output: String,

    /// Page size of loaded and output tables, in bytes.
    #[serde(default = "default_bucksize")]
    pub bucksize: usize,

    /// Field separator of the input files.
    #[serde(default = "default_separator")]
    pub separator: char,

    /// Write the output dump in release builds too.
    #[serde(default)]
    pub dump: bool,

    pub build: SideConfig,

    pub probe: SideConfig,

    #[serde(default)]
    pub algorithm: AlgorithmConfig,

    #[serde(default)]
    pub experiment: ExperimentConfig,

    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SideConfig {
    pub file: PathBuf,
    pub schema: Vec<String>,
    /// 1-based join column.
    pub jattr: usize,
    /// 1-based output columns.
    #[serde(default)]
    pub select: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlgorithmConfig {
    /// Copy build payloads into the hash table instead of storing
    /// back-references.
    #[serde(default = "default_true")]
    pub copydata: bool,

    /// Hash bucket page size, in bytes.
    #[serde(default = "default_buildpagesize")]
    pub buildpagesize: usize,

    /// Worker threads; 1 selects the single-threaded path.
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub hash_only: bool,

    #[serde(default)]
    pub prefetch: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Width of each pass's key range, in percent of `domain`.
    #[serde(default = "default_selectivity")]
    pub selectivity: f64,

    /// Join keys are drawn from `[0, domain)`.
    #[serde(default = "default_domain")]
    pub domain: i64,

    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache budget in key values. Defaults to
    /// [`DEFAULT_BUDGET_DOMAINS`] times the experiment domain.
    #[serde(default)]
    pub max_size: Option<u64>,

    #[serde(default = "default_reuse_threshold")]
    pub reuse_threshold: f64,

    #[serde(default = "default_keys_per_bucket")]
    pub keys_per_bucket: u64,
}

fn default_output() -> String {
    "output.tbl".to_string()
}

fn default_bucksize() -> usize {
    1 << 20
}

fn default_separator() -> char {
    '|'
}

fn default_true() -> bool {
    true
}

fn default_buildpagesize() -> usize {
    256
}

fn default_threads() -> usize {
    1
}

fn default_iterations() -> usize {
    1
}

fn default_selectivity() -> f64 {
    100.0
}

fn default_domain() -> i64 {
    1_000_000
}

fn default_reuse_threshold() -> f64 {
    DEFAULT_REUSE_THRESHOLD
}

fn default_keys_per_bucket() -> u64 {
    DEFAULT_KEYS_PER_BUCKET
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            copydata: true,
            buildpagesize: default_buildpagesize(),
            threads: default_threads(),
            hash_only: false,
            prefetch: false,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            selectivity: default_selectivity(),
            domain: default_domain(),
            seed: 0,
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: None,
            reuse_threshold: default_reuse_threshold(),
            keys_per_bucket: default_keys_per_bucket(),
        }
    }
}

impl JoinConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.build.validate("build")?;
        self.probe.validate("probe")?;
        if self.bucksize == 0 {
            return Err(invalid("bucksize must be positive"));
        }
        if self.separator == '\n' || self.separator == '\r' {
            return Err(invalid("separator cannot be a line break"));
        }

        let algo = &self.algorithm;
        if algo.buildpagesize == 0 {
            return Err(invalid("algorithm.buildpagesize must be positive"));
        }
        if algo.threads == 0 {
            return Err(invalid("algorithm.threads must be at least 1"));
        }

        let exp = &self.experiment;
        if exp.iterations == 0 {
            return Err(invalid("experiment.iterations must be at least 1"));
        }
        if !(exp.selectivity > 0.0 && exp.selectivity <= 100.0) {
            return Err(invalid("experiment.selectivity must be in (0, 100]"));
        }
        if exp.domain <= 0 {
            return Err(invalid("experiment.domain must be positive"));
        }

        let cache = &self.cache;
        if !(0.0..=1.0).contains(&cache.reuse_threshold) {
            return Err(invalid("cache.reuse_threshold must be in [0, 1]"));
        }
        if cache.keys_per_bucket == 0 {
            return Err(invalid("cache.keys_per_bucket must be at least 1"));
        }
        Ok(())
    }

    pub fn build_path(&self) -> PathBuf {
        self.path.join(&self.build.file)
    }

    pub fn probe_path(&self) -> PathBuf {
        self.path.join(&self.probe.file)
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join(&self.output)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let algo = &self.algorithm;
        EngineConfig {
            storage: if algo.copydata {
                Storage::CopyPayload
            } else {
                Storage::StorePointer
            },
            execution: if algo.threads > 1 {
                Execution::Parallel {
                    threads: algo.threads,
                }
            } else {
                Execution::Serial
            },
            probe_mode: if algo.hash_only {
                ProbeMode::HashOnly
            } else {
                ProbeMode::Assemble
            },
            output_page_size: self.bucksize,
            prefetch: algo.prefetch,
        }
    }

    /// Effective cache budget: the configured one, or enough for
    /// [`DEFAULT_BUDGET_DOMAINS`] tables spanning the whole domain.
    pub fn cache_budget(&self) -> u64 {
        self.cache.max_size.unwrap_or_else(|| {
            self.experiment
                .domain
                .unsigned_abs()
                .saturating_mul(DEFAULT_BUDGET_DOMAINS)
        })
    }

    pub fn reuse_cache(&self) -> ReuseCache {
        if !self.cache.enabled {
            return ReuseCache::disabled();
        }
        ReuseCache::new(CacheConfig {
            max_size: self.cache_budget(),
            reuse_threshold: self.cache.reuse_threshold,
            keys_per_bucket: self.cache.keys_per_bucket,
        })
    }
}

impl SideConfig {
    fn validate(&self, side: &str) -> Result<()> {
        let columns = self.parse_schema()?.columns();
        if self.jattr == 0 || self.jattr > columns {
            return Err(invalid(format!(
                "{side}.jattr {} is not a column of a {columns}-column schema",
                self.jattr
            )));
        }
        if let Some(&bad) = self.select.iter().find(|&&c| c == 0 || c > columns) {
            return Err(invalid(format!(
                "{side}.select {bad} is not a column of a {columns}-column schema"
            )));
        }
        Ok(())
    }

    pub fn parse_schema(&self) -> Result<Schema> {
        Schema::from_spec(&self.schema)
    }

    /// 0-based join column.
    pub fn join_column(&self) -> usize {
        self.jattr - 1
    }

    /// 0-based output columns.
    pub fn select_columns(&self) -> Vec<usize> {
        self.select.iter().map(|c| c - 1).collect()
    }
}

fn invalid(msg: impl Into<String>) -> JoinError {
    JoinError::Config(msg.into())
}
