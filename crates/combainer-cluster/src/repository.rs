//! Parsing and aggregation config documents
//!
//! A repository directory looks like:
//!
//! ```text
//! combaine.yaml          server defaults (CombainerConfig)
//! parsing/<name>.yaml    one ParsingConfig per file
//! aggregate/<name>.yaml  one AggregationConfig per file
//! ```
//!
//! `.json` files are accepted too. The config name is the file stem.

use crate::error::{ClusterError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const COMBAINE_CONFIG: &str = "combaine.yaml";
const PARSING_DIR: &str = "parsing";
const AGGREGATE_DIR: &str = "aggregate";
const CONFIG_EXTENSIONS: [&str; 2] = ["yaml", "json"];

/// Key naming the plugin implementation inside a plugin section
pub const PLUGIN_TYPE_KEY: &str = "type";

/// Read access to the config documents
pub trait Repository: Send + Sync {
    /// Names of all parsing configs. Re-read on every call.
    fn list_parsing_configs(&self) -> Result<Vec<String>>;

    fn get_parsing_config(&self, name: &str) -> Result<EncodedConfig>;

    fn get_aggregation_config(&self, name: &str) -> Result<EncodedConfig>;

    /// Server-level defaults
    fn get_combainer_config(&self) -> Result<CombainerConfig>;

    fn parsing_config_exists(&self, name: &str) -> bool;
}

// ============================================================================
// Documents
// ============================================================================

/// Raw config bytes as read from the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedConfig(pub Vec<u8>);

impl EncodedConfig {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_yaml::from_slice(&self.0)?)
    }

    /// Substitute `{{ .key }}` placeholders
    pub fn generate(&self, placeholders: &BTreeMap<String, serde_yaml::Value>) -> Result<Self> {
        let text = std::str::from_utf8(&self.0)
            .map_err(|e| ClusterError::Repository(format!("template is not utf-8: {}", e)))?;

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| ClusterError::Repository("unclosed `{{` in template".into()))?;
            let expr = after[..end].trim();
            let key = expr.strip_prefix('.').ok_or_else(|| {
                ClusterError::Repository(format!("unsupported template expression `{}`", expr))
            })?;
            let value = placeholders
                .get(key)
                .ok_or_else(|| ClusterError::Repository(format!("no placeholder `{}`", key)))?;
            out.push_str(&render_scalar(value)?);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(Self(out.into_bytes()))
    }
}

fn render_scalar(value: &serde_yaml::Value) -> Result<String> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Ok(serde_yaml::to_string(other)?.trim_end().to_string()),
    }
}

/// A user-defined plugin section. Must carry a `type` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginConfig(pub BTreeMap<String, serde_yaml::Value>);

impl PluginConfig {
    pub fn plugin_type(&self) -> Result<&str> {
        match self.0.get(PLUGIN_TYPE_KEY) {
            Some(serde_yaml::Value::String(t)) => Ok(t),
            Some(other) => Err(ClusterError::InvalidConfig(format!(
                "plugin `type` must be a string, got {:?}",
                other
            ))),
            None => Err(ClusterError::MissingPluginType),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    /// Decode the section into a typed plugin config
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_yaml::to_value(&self.0)?;
        Ok(serde_yaml::from_value(value)?)
    }

    /// Copy every key of `overrides` over `self`
    pub fn update(&mut self, overrides: &PluginConfig) {
        for (k, v) in &overrides.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `Cluster` section of `combaine.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    #[serde(rename = "BindAddr")]
    pub bind_addr: String,
    #[serde(rename = "RaftPort")]
    pub raft_port: u16,
    #[serde(rename = "BootstrapExpect")]
    pub bootstrap_expect: usize,
    #[serde(rename = "StartAsLeader")]
    pub start_as_leader: bool,
    #[serde(rename = "DataDir")]
    pub data_dir: String,
}

/// `Main` section, shared by `combaine.yaml` and per-config overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainSection {
    #[serde(rename = "Cluster")]
    pub cluster: ClusterSection,
    #[serde(rename = "ParallelParsings")]
    pub parallel_parsings: usize,
    /// Iteration duration in seconds
    #[serde(rename = "MINIMUM_PERIOD")]
    pub iteration_duration: u64,
    #[serde(rename = "cloud")]
    pub cloud_group: String,
    #[serde(rename = "Cache", alias = "cache")]
    pub cache: PluginConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombainerSection {
    #[serde(rename = "Main")]
    pub main: MainSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    #[serde(rename = "DataFetcher")]
    pub data_fetcher: PluginConfig,
    #[serde(rename = "HostFetcher")]
    pub host_fetcher: PluginConfig,
}

/// Server-level defaults (`combaine.yaml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombainerConfig {
    #[serde(rename = "Combainer")]
    pub combainer: CombainerSection,
    #[serde(rename = "cloud_config")]
    pub cloud: CloudSection,
}

impl CombainerConfig {
    pub fn main(&self) -> &MainSection {
        &self.combainer.main
    }

    pub fn verify(&self) -> Result<()> {
        if self.main().iteration_duration == 0 {
            return Err(ClusterError::InvalidConfig(
                "MINIMUM_PERIOD must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// What to fetch and which aggregations to run on it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsingConfig {
    /// Host groups to resolve
    pub groups: Vec<String>,
    /// Names of the aggregation configs to run
    pub agg_configs: Vec<String>,
    #[serde(rename = "DataFetcher")]
    pub data_fetcher: PluginConfig,
    pub metahost: String,
    #[serde(rename = "Combainer")]
    pub main: MainSection,
    #[serde(rename = "HostFetcher")]
    pub host_fetcher: PluginConfig,
    #[serde(rename = "Placeholders")]
    pub placeholders: BTreeMap<String, serde_yaml::Value>,
}

impl ParsingConfig {
    /// Fill unset values from the server defaults. Fetcher sections are merged
    /// key by key with the parsing config winning.
    pub fn update_by_combainer_config(&mut self, config: &CombainerConfig) {
        if self.main.iteration_duration == 0 {
            self.main.iteration_duration = config.main().iteration_duration;
        }
        if self.main.parallel_parsings == 0 {
            self.main.parallel_parsings = config.main().parallel_parsings;
        }

        let mut data_fetcher = config.cloud.data_fetcher.clone();
        data_fetcher.update(&self.data_fetcher);
        self.data_fetcher = data_fetcher;

        let mut host_fetcher = config.cloud.host_fetcher.clone();
        host_fetcher.update(&self.host_fetcher);
        self.host_fetcher = host_fetcher;

        if self.main.cache.is_empty() {
            self.main.cache = config.main().cache.clone();
        }

        if self.metahost.is_empty() {
            if let Some(group) = self.groups.first() {
                self.metahost = group.clone();
            }
        }
    }
}

/// How to reduce parsing results and where to send them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub senders: BTreeMap<String, PluginConfig>,
    pub data: BTreeMap<String, PluginConfig>,
}

/// Load and decode every aggregation config named by `parsing`.
///
/// Any failure aborts: a partial set of aggregation definitions is unusable.
pub fn load_aggregation_configs(
    repo: &dyn Repository,
    parsing: &ParsingConfig,
) -> Result<BTreeMap<String, AggregationConfig>> {
    let mut configs = BTreeMap::new();
    for name in &parsing.agg_configs {
        let agg_err = |e: ClusterError| {
            error!(aggregation = %name, error = %e, "Unable to load aggregation config");
            ClusterError::AggregationConfig {
                name: name.clone(),
                reason: e.to_string(),
            }
        };

        let mut content = repo.get_aggregation_config(name).map_err(agg_err)?;
        if !parsing.placeholders.is_empty() {
            content = content.generate(&parsing.placeholders).map_err(agg_err)?;
        }
        let config: AggregationConfig = content.decode().map_err(agg_err)?;
        configs.insert(name.clone(), config);
    }
    Ok(configs)
}

// ============================================================================
// Filesystem repository
// ============================================================================

/// [`Repository`] over a local directory
#[derive(Debug, Clone)]
pub struct FilesystemRepository {
    base: PathBuf,
    parsing: PathBuf,
    aggregate: PathBuf,
}

impl FilesystemRepository {
    /// Open `base`. Fails when `combaine.yaml` is missing or invalid.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        let repo = Self {
            parsing: base.join(PARSING_DIR),
            aggregate: base.join(AGGREGATE_DIR),
            base,
        };
        repo.get_combainer_config()?.verify()?;
        debug!(path = %repo.base.display(), "Opened config repository");
        Ok(repo)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn find(&self, dir: &Path, name: &str) -> Option<PathBuf> {
        CONFIG_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", name, ext)))
            .find(|p| p.is_file())
    }

    fn read(&self, dir: &Path, name: &str) -> Result<EncodedConfig> {
        let path = self
            .find(dir, name)
            .ok_or_else(|| ClusterError::ConfigNotFound(name.to_string()))?;
        Ok(EncodedConfig(std::fs::read(path)?))
    }

    /// Names of the aggregation configs
    pub fn list_aggregation_configs(&self) -> Result<Vec<String>> {
        list_configs(&self.aggregate)
    }
}

fn list_configs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_config = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| CONFIG_EXTENSIONS.contains(&e));
        if let (true, Some(stem)) = (is_config, path.file_stem().and_then(|s| s.to_str())) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

impl Repository for FilesystemRepository {
    fn list_parsing_configs(&self) -> Result<Vec<String>> {
        list_configs(&self.parsing)
    }

    fn get_parsing_config(&self, name: &str) -> Result<EncodedConfig> {
        self.read(&self.parsing, name)
    }

    fn get_aggregation_config(&self, name: &str) -> Result<EncodedConfig> {
        self.read(&self.aggregate, name)
    }

    fn get_combainer_config(&self) -> Result<CombainerConfig> {
        let data = std::fs::read(self.base.join(COMBAINE_CONFIG)).map_err(|e| {
            ClusterError::Repository(format!("read {}: {}", COMBAINE_CONFIG, e))
        })?;
        Ok(serde_yaml::from_slice(&data)?)
    }

    fn parsing_config_exists(&self, name: &str) -> bool {
        self.find(&self.parsing, name).is_some()
    }
}
