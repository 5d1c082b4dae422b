//! Pipeline configuration: file model, defaults, environment overrides and
//! validation.
//!
//! The validated [`PipelineConfig`] is built once at startup, wrapped in an
//! `Arc` by the supervisor and never mutated afterwards.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_HOOK_URL: &str = "http://127.0.0.1:8080/detections";
const DEFAULT_QUEUE_CAPACITY: usize = 8;
const DEFAULT_FRAME_STRIDE: u64 = 1;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_WORKERS_PER_MODEL: usize = 1;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_DELIVERY_ATTEMPTS: u32 = 3;
const DEFAULT_DELIVERY_INITIAL_MS: u64 = 200;
const DEFAULT_DELIVERY_MAX_MS: u64 = 5_000;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DELIVERY_QUEUE: usize = 256;

// ----------------------------------------------------------------------------
// Public configuration types
// ----------------------------------------------------------------------------

/// A configured sub-area of one stream's frame, in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub shape: RegionShape,
    /// Model identifiers this region is evaluated against.
    pub models: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionShape {
    Rect {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Polygon {
        points: Vec<[u32; 2]>,
    },
}

/// Worker count: one global value or one per model id.
///
/// Each worker serves the streams that hash to its shard, so a model only
/// uses as many workers as it has streams spread over them. With a single
/// stream, workers beyond the first stay idle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThreadNums {
    Global(usize),
    PerModel(HashMap<String, usize>),
}

impl Default for ThreadNums {
    fn default() -> Self {
        ThreadNums::Global(DEFAULT_WORKERS_PER_MODEL)
    }
}

/// What `push` does when a lane is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Reject the incoming task. Favors freshness without disturbing queued work.
    #[default]
    DropNewest,
    /// Evict the oldest queued task and admit the incoming one.
    DropOldest,
    /// Wait for space. Abandoned on shutdown.
    Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub id: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            max_backoff: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    /// Batches waiting for the notifier before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DELIVERY_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_DELIVERY_INITIAL_MS),
            max_backoff: Duration::from_millis(DEFAULT_DELIVERY_MAX_MS),
            request_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            queue_capacity: DEFAULT_DELIVERY_QUEUE,
        }
    }
}

/// A resolved model: identifier, load path, accepted classes and worker count.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    pub id: String,
    pub path: String,
    /// Empty means every class the engine reports is accepted.
    pub classes: BTreeSet<String>,
    pub workers: usize,
    pub confidence_threshold: f32,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub model_paths: Vec<String>,
    pub model_classes: HashMap<String, BTreeSet<String>>,
    pub regions: HashMap<String, Vec<Region>>,
    pub thread_nums: ThreadNums,
    pub hook_http_url: String,
    pub streams: Vec<StreamSettings>,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub frame_stride: u64,
    pub confidence_threshold: f32,
    pub reconnect: ReconnectPolicy,
    pub delivery: DeliveryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_paths: Vec::new(),
            model_classes: HashMap::new(),
            regions: HashMap::new(),
            thread_nums: ThreadNums::default(),
            hook_http_url: DEFAULT_HOOK_URL.to_string(),
            streams: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backpressure: BackpressurePolicy::default(),
            frame_stride: DEFAULT_FRAME_STRIDE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            reconnect: ReconnectPolicy::default(),
            delivery: DeliveryPolicy::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// File model
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    #[serde(alias = "modelPaths")]
    model_paths: Option<Vec<String>>,
    #[serde(alias = "modelClasses")]
    model_classes: Option<HashMap<String, BTreeSet<String>>>,
    regions: Option<HashMap<String, Vec<Region>>>,
    #[serde(alias = "threadNums")]
    thread_nums: Option<ThreadNums>,
    #[serde(alias = "hookHttpUrl")]
    hook_http_url: Option<String>,
    streams: Option<Vec<StreamSettings>>,
    queue_capacity: Option<usize>,
    backpressure: Option<BackpressurePolicy>,
    frame_stride: Option<u64>,
    confidence_threshold: Option<f32>,
    reconnect: Option<ReconnectConfigFile>,
    delivery: Option<DeliveryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_ms: Option<u64>,
    max_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    max_attempts: Option<u32>,
    initial_ms: Option<u64>,
    max_ms: Option<u64>,
    timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

impl PipelineConfig {
    /// Load from an optional JSON/TOML file, apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect = file.reconnect.unwrap_or_default();
        let delivery = file.delivery.unwrap_or_default();
        Self {
            model_paths: file.model_paths.unwrap_or_default(),
            model_classes: file.model_classes.unwrap_or_default(),
            regions: file.regions.unwrap_or_default(),
            thread_nums: file.thread_nums.unwrap_or_default(),
            hook_http_url: file.hook_http_url.unwrap_or(defaults.hook_http_url),
            streams: file.streams.unwrap_or_default(),
            queue_capacity: file.queue_capacity.unwrap_or(defaults.queue_capacity),
            backpressure: file.backpressure.unwrap_or(defaults.backpressure),
            frame_stride: file.frame_stride.unwrap_or(defaults.frame_stride),
            confidence_threshold: file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            reconnect: ReconnectPolicy {
                initial_backoff: reconnect
                    .initial_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect.initial_backoff),
                max_backoff: reconnect
                    .max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect.max_backoff),
                max_attempts: reconnect.max_attempts,
            },
            delivery: DeliveryPolicy {
                max_attempts: delivery
                    .max_attempts
                    .unwrap_or(defaults.delivery.max_attempts),
                initial_backoff: delivery
                    .initial_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.delivery.initial_backoff),
                max_backoff: delivery
                    .max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.delivery.max_backoff),
                request_timeout: delivery
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.delivery.request_timeout),
                queue_capacity: delivery
                    .queue_capacity
                    .unwrap_or(defaults.delivery.queue_capacity),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("DETECT_HOOK_URL") {
            if !url.trim().is_empty() {
                self.hook_http_url = url.trim().to_string();
            }
        }
        if let Ok(capacity) = std::env::var("DETECT_QUEUE_CAPACITY") {
            self.queue_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Ok(stride) = std::env::var("DETECT_FRAME_STRIDE") {
            self.frame_stride = stride
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_FRAME_STRIDE must be a positive integer"))?;
        }
        if let Ok(threads) = std::env::var("DETECT_THREAD_NUMS") {
            let threads: usize = threads
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_THREAD_NUMS must be a positive integer"))?;
            self.thread_nums = ThreadNums::Global(threads);
        }
        Ok(())
    }

    /// Check every cross-reference and bound. Called by `load` and by the supervisor.
    pub fn validate(&self) -> Result<()> {
        if self.model_paths.is_empty() {
            return Err(anyhow!("at least one model path is required"));
        }

        let mut model_ids = HashSet::new();
        for path in &self.model_paths {
            let id = model_id_for_path(path);
            validate_identifier("model", &id)?;
            if !model_ids.insert(id.clone()) {
                return Err(anyhow!("duplicate model id '{}' (from '{}')", id, path));
            }
        }

        for model in self.model_classes.keys() {
            if !model_ids.contains(model) {
                return Err(anyhow!("model_classes refers to unknown model '{}'", model));
            }
        }

        match &self.thread_nums {
            ThreadNums::Global(0) => return Err(anyhow!("thread_nums must be greater than zero")),
            ThreadNums::Global(_) => {}
            ThreadNums::PerModel(map) => {
                for (model, count) in map {
                    if !model_ids.contains(model) {
                        return Err(anyhow!("thread_nums refers to unknown model '{}'", model));
                    }
                    if *count == 0 {
                        return Err(anyhow!("thread_nums for '{}' must be greater than zero", model));
                    }
                }
            }
        }

        let mut stream_ids = HashSet::new();
        for stream in &self.streams {
            validate_identifier("stream", &stream.id)?;
            if !stream_ids.insert(stream.id.as_str()) {
                return Err(anyhow!("duplicate stream id '{}'", stream.id));
            }
            if stream.url.trim().is_empty() {
                return Err(anyhow!("stream '{}' has an empty url", stream.id));
            }
        }

        for (stream, regions) in &self.regions {
            if !stream_ids.contains(stream.as_str()) {
                return Err(anyhow!("regions configured for unknown stream '{}'", stream));
            }
            let mut region_ids = HashSet::new();
            for region in regions {
                validate_identifier("region", &region.id)?;
                if !region_ids.insert(region.id.as_str()) {
                    return Err(anyhow!(
                        "duplicate region id '{}' on stream '{}'",
                        region.id,
                        stream
                    ));
                }
                validate_shape(&region.id, &region.shape)?;
                if region.models.is_empty() {
                    return Err(anyhow!("region '{}' names no models", region.id));
                }
                for model in &region.models {
                    if !model_ids.contains(model) {
                        return Err(anyhow!(
                            "region '{}' refers to unknown model '{}'",
                            region.id,
                            model
                        ));
                    }
                }
            }
        }

        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than zero"));
        }
        if self.frame_stride == 0 {
            return Err(anyhow!("frame_stride must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0..=1"));
        }
        if self.reconnect.initial_backoff.is_zero()
            || self.reconnect.max_backoff < self.reconnect.initial_backoff
        {
            return Err(anyhow!("reconnect backoff must be non-zero and max >= initial"));
        }
        if self.delivery.max_attempts == 0 {
            return Err(anyhow!("delivery.max_attempts must be greater than zero"));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(anyhow!("delivery.queue_capacity must be greater than zero"));
        }
        if self.delivery.max_backoff < self.delivery.initial_backoff {
            return Err(anyhow!("delivery backoff max must be >= initial"));
        }

        let hook = url::Url::parse(&self.hook_http_url)
            .with_context(|| format!("hook_http_url '{}' is not a valid URL", self.hook_http_url))?;
        if !matches!(hook.scheme(), "http" | "https") {
            return Err(anyhow!(
                "hook_http_url must use http or https, got '{}'",
                hook.scheme()
            ));
        }

        Ok(())
    }

    /// Resolved models in configuration order.
    pub fn models(&self) -> Vec<ModelSpec> {
        self.model_paths
            .iter()
            .map(|path| {
                let id = model_id_for_path(path);
                ModelSpec {
                    classes: self.model_classes.get(&id).cloned().unwrap_or_default(),
                    workers: self.workers_for(&id),
                    confidence_threshold: self.confidence_threshold,
                    path: path.clone(),
                    id,
                }
            })
            .collect()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.model_paths.iter().map(|p| model_id_for_path(p)).collect()
    }

    pub fn workers_for(&self, model_id: &str) -> usize {
        match &self.thread_nums {
            ThreadNums::Global(count) => *count,
            ThreadNums::PerModel(map) => map
                .get(model_id)
                .copied()
                .unwrap_or(DEFAULT_WORKERS_PER_MODEL),
        }
    }

    pub fn regions_for(&self, stream_id: &str) -> &[Region] {
        self.regions
            .get(stream_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Model identifier derived from its path: the file stem (`/m/det1.onnx` -> `det1`).
pub fn model_id_for_path(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or(path)
        .to_string()
}

/// Identifiers end up in logs and hook payloads; keep them to a safe alphabet.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    static ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,64}$").expect("identifier pattern is valid")
    });
    if !re.is_match(value) {
        return Err(anyhow!(
            "{} id '{}' must match ^[A-Za-z0-9_.:-]{{1,64}}$",
            kind,
            value
        ));
    }
    Ok(())
}

fn validate_shape(region_id: &str, shape: &RegionShape) -> Result<()> {
    match shape {
        RegionShape::Rect { width, height, .. } if *width == 0 || *height == 0 => Err(anyhow!(
            "region '{}' has a zero-sized rectangle",
            region_id
        )),
        RegionShape::Polygon { points } if points.len() < 3 => Err(anyhow!(
            "region '{}' polygon needs at least 3 points",
            region_id
        )),
        _ => Ok(()),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
