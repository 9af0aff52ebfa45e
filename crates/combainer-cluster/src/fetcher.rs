//! Host group resolution
//!
//! A [`HostFetcher`] turns a group name into hosts per datacenter. Fetchers
//! are plugins selected by the `type` key of a `HostFetcher` section and
//! built through a [`FetcherRegistry`] owned by the cluster context.

use crate::error::{ClusterError, Result};
use crate::repository::PluginConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Datacenter name used when a discovery service does not report one
pub const NO_DC: &str = "NoDC";

/// Hosts by datacenter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hosts(pub BTreeMap<String, Vec<String>>);

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dc: impl Into<String>, host: impl Into<String>) {
        self.0.entry(dc.into()).or_default().push(host.into());
    }

    /// Append every host of `other`, datacenter by datacenter
    pub fn merge(&mut self, other: Hosts) {
        for (dc, hosts) in other.0 {
            self.0.entry(dc).or_default().extend(hosts);
        }
    }

    /// Every host across datacenters
    pub fn all_hosts(&self) -> Vec<String> {
        self.0.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

/// Resolves a host group
#[async_trait]
pub trait HostFetcher: Send + Sync {
    async fn fetch(&self, group: &str) -> Result<Hosts>;
}

// ============================================================================
// TTL cache
// ============================================================================

/// Keyed cache with a fixed time-to-live.
///
/// When a refresh fails the previous value is served, however old.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone + Send> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh cached value, if any
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries
            .lock()
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.entries
            .lock()
            .insert(key.into(), (Instant::now(), value));
    }

    /// Return the cached value or run `fetch`. A failed fetch falls back to
    /// a stale entry when one exists.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        match fetch().await {
            Ok(value) => {
                self.put(key, value.clone());
                Ok(value)
            }
            Err(e) => {
                let stale = self.entries.lock().get(key).map(|(_, v)| v.clone());
                match stale {
                    Some(value) => {
                        warn!(key = %key, error = %e, "Fetch failed, serving stale cache entry");
                        Ok(value)
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Drop entries older than `max_age`
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (at, _)| at.elapsed() < max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Built-in fetchers
// ============================================================================

#[derive(Debug, Deserialize)]
struct PredefineConfig {
    #[serde(rename = "Clusters", default)]
    clusters: BTreeMap<String, Hosts>,
}

/// Static group map from the config
#[derive(Debug, Clone)]
pub struct PredefineFetcher {
    clusters: BTreeMap<String, Hosts>,
}

impl PredefineFetcher {
    pub fn new(clusters: BTreeMap<String, Hosts>) -> Self {
        Self { clusters }
    }

    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let cfg: PredefineConfig = config.decode()?;
        Ok(Self::new(cfg.clusters))
    }
}

#[async_trait]
impl HostFetcher for PredefineFetcher {
    async fn fetch(&self, group: &str) -> Result<Hosts> {
        self.clusters
            .get(group)
            .cloned()
            .ok_or_else(|| ClusterError::Fetcher(format!("hosts for group `{}` are not specified", group)))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HttpFetcherConfig {
    #[serde(rename = "BasicUrl")]
    basic_url: String,
    #[serde(rename = "Separator", default = "default_separator")]
    separator: String,
    #[serde(rename = "Format", default)]
    format: String,
    /// Seconds
    #[serde(rename = "ReadTimeout", default = "default_read_timeout")]
    read_timeout: u64,
    #[serde(rename = "Options", default)]
    options: HashMap<String, String>,
}

fn default_separator() -> String {
    "\t".to_string()
}

fn default_read_timeout() -> u64 {
    10
}

/// Discovery over HTTP. `BasicUrl` must contain `%s`, which is replaced by
/// the group name. The body is either `dc<sep>host` lines or, with
/// `Format: json`, an array of objects.
pub struct HttpFetcher {
    config: HttpFetcherConfig,
    client: reqwest::Client,
    cache: Arc<TtlCache<Vec<u8>>>,
}

impl HttpFetcher {
    pub fn from_config(
        config: &PluginConfig,
        client: reqwest::Client,
        cache: Arc<TtlCache<Vec<u8>>>,
    ) -> Result<Self> {
        let mut config: HttpFetcherConfig = config.decode()?;
        if !config.basic_url.contains("%s") {
            return Err(ClusterError::InvalidConfig(format!(
                "BasicUrl `{}` has no %s group placeholder",
                config.basic_url
            )));
        }
        if config.separator.is_empty() {
            config.separator = default_separator();
        }
        if config.read_timeout == 0 {
            config.read_timeout = default_read_timeout();
        }
        config
            .options
            .entry("fqdn_key_name".into())
            .or_insert_with(|| "fqdn".into());
        config
            .options
            .entry("dc_key_name".into())
            .or_insert_with(|| "root_datacenter_name".into());
        Ok(Self {
            config,
            client,
            cache,
        })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.read_timeout))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClusterError::Fetcher(format!(
                "{} answered with {}",
                url,
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    fn parse_tsv(&self, body: &[u8]) -> Result<Hosts> {
        let text = String::from_utf8_lossy(body);
        let mut hosts = Hosts::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let mut fields = line.split(self.config.separator.as_str());
            match (fields.next(), fields.next(), fields.next()) {
                (Some(dc), Some(host), None) if !host.is_empty() => {
                    let dc = if dc.is_empty() { NO_DC } else { dc };
                    hosts.insert(dc, host);
                }
                _ => warn!(line = %line, "Skipping malformed discovery line"),
            }
        }
        Ok(hosts)
    }

    fn parse_json(&self, body: &[u8]) -> Result<Hosts> {
        let items: Vec<HashMap<String, serde_json::Value>> = serde_json::from_slice(body)?;
        let fqdn_key = self.config.options["fqdn_key_name"].as_str();
        let dc_key = self.config.options["dc_key_name"].as_str();

        let mut hosts = Hosts::new();
        for item in items {
            let Some(fqdn) = item.get(fqdn_key).and_then(|v| v.as_str()) else {
                continue;
            };
            let dc = item
                .get(dc_key)
                .and_then(|v| v.as_str())
                .filter(|dc| !dc.is_empty())
                .unwrap_or(NO_DC);
            hosts.insert(dc, fqdn);
        }
        Ok(hosts)
    }
}

#[async_trait]
impl HostFetcher for HttpFetcher {
    async fn fetch(&self, group: &str) -> Result<Hosts> {
        let url = self.config.basic_url.replacen("%s", group, 1);
        let body = self.cache.get_or_fetch(&url, || self.get(&url)).await?;

        let hosts = if self.config.format == "json" {
            self.parse_json(&body)?
        } else {
            self.parse_tsv(&body)?
        };
        if hosts.is_empty() {
            return Err(ClusterError::NoHosts(vec![group.to_string()]));
        }
        debug!(group = %group, hosts = hosts.all_hosts().len(), "Fetched hosts");
        Ok(hosts)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Shared resources handed to fetcher constructors
#[derive(Clone)]
pub struct FetcherDeps {
    pub client: reqwest::Client,
    pub cache: Arc<TtlCache<Vec<u8>>>,
}

type FetcherLoader =
    Box<dyn Fn(&PluginConfig, &FetcherDeps) -> Result<Arc<dyn HostFetcher>> + Send + Sync>;

/// Maps a plugin type name to a fetcher constructor
pub struct FetcherRegistry {
    loaders: HashMap<String, FetcherLoader>,
    deps: FetcherDeps,
}

impl FetcherRegistry {
    /// Empty registry. Fetch results are cached for `cache_ttl`.
    pub fn new(cache_ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ClusterError::Network(format!("build http client: {}", e)))?;
        Ok(Self {
            loaders: HashMap::new(),
            deps: FetcherDeps {
                client,
                cache: Arc::new(TtlCache::new(cache_ttl)),
            },
        })
    }

    /// Registry with the `predefine` and `http` fetchers
    pub fn with_defaults(cache_ttl: Duration) -> Result<Self> {
        let mut registry = Self::new(cache_ttl)?;
        registry.register("predefine", |cfg, _| {
            Ok(Arc::new(PredefineFetcher::from_config(cfg)?) as Arc<dyn HostFetcher>)
        })?;
        registry.register("http", |cfg, deps| {
            Ok(Arc::new(HttpFetcher::from_config(
                cfg,
                deps.client.clone(),
                deps.cache.clone(),
            )?) as Arc<dyn HostFetcher>)
        })?;
        Ok(registry)
    }

    /// Add a loader. Names are unique.
    pub fn register<F>(&mut self, name: impl Into<String>, loader: F) -> Result<()>
    where
        F: Fn(&PluginConfig, &FetcherDeps) -> Result<Arc<dyn HostFetcher>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.loaders.contains_key(&name) {
            return Err(ClusterError::InvalidConfig(format!(
                "host fetcher `{}` is already registered",
                name
            )));
        }
        self.loaders.insert(name, Box::new(loader));
        Ok(())
    }

    /// Build the fetcher described by `config`
    pub fn load(&self, config: &PluginConfig) -> Result<Arc<dyn HostFetcher>> {
        let kind = config.plugin_type()?;
        let loader = self
            .loaders
            .get(kind)
            .ok_or_else(|| ClusterError::UnknownFetcher(kind.to_string()))?;
        loader(config, &self.deps)
    }

    pub fn cache(&self) -> &Arc<TtlCache<Vec<u8>>> {
        &self.deps.cache
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}
