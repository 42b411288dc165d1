//! The request and result types flowing through the loader.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::caching::MemoryKey;
use crate::decode::DecodedImage;
use crate::error::ImageError;
use crate::transform::Transformation;

/// A width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Where an image that was handed out came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Served by the in-memory cache.
    Memory,
    /// Served by the disk cache, or read from the local filesystem.
    Disk,
    /// Fetched over the network.
    Network,
    /// Already present in memory as part of the request itself.
    Inline,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Inline => "inline",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controls whether a cache tier may be read from and/or written to for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    Enabled,
    ReadOnly,
    WriteOnly,
    Disabled,
}

impl CachePolicy {
    pub fn read_enabled(&self) -> bool {
        matches!(self, Self::Enabled | Self::ReadOnly)
    }

    pub fn write_enabled(&self) -> bool {
        matches!(self, Self::Enabled | Self::WriteOnly)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// The thing to load.
#[derive(Clone)]
pub enum ImageModel {
    /// A remote image, fetched over the network.
    Url(Url),
    /// An image file on the local filesystem.
    Path(PathBuf),
    /// Encoded image bytes that are already in memory.
    ///
    /// The `id` has to uniquely identify the bytes, it is used for caching.
    Bytes { id: Arc<str>, bytes: Bytes },
    /// An image that is already decoded.
    Bitmap {
        id: Arc<str>,
        image: Arc<DecodedImage>,
    },
}

impl ImageModel {
    /// Parses a model from user input.
    ///
    /// Anything with a URL scheme other than `file` is treated as a URL, everything else as a
    /// filesystem path.
    pub fn parse(input: &str) -> Self {
        match Url::parse(input) {
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Self::Path(path),
                Err(_) => Self::Url(url),
            },
            // single letter schemes are windows drive letters
            Ok(url) if url.scheme().len() > 1 => Self::Url(url),
            _ => Self::Path(PathBuf::from(input)),
        }
    }

    pub fn bytes(id: impl Into<Arc<str>>, bytes: impl Into<Bytes>) -> Self {
        Self::Bytes {
            id: id.into(),
            bytes: bytes.into(),
        }
    }

    pub fn bitmap(id: impl Into<Arc<str>>, image: Arc<DecodedImage>) -> Self {
        Self::Bitmap {
            id: id.into(),
            image,
        }
    }

    /// A stable identifier of this model, used for cache keys and events.
    pub fn id(&self) -> String {
        match self {
            Self::Url(url) => url.as_str().to_owned(),
            Self::Path(path) => format!("file://{}", path.display()),
            Self::Bytes { id, .. } => format!("bytes:{id}"),
            Self::Bitmap { id, .. } => format!("bitmap:{id}"),
        }
    }
}

impl fmt::Debug for ImageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes { id, bytes } => f
                .debug_struct("Bytes")
                .field("id", id)
                .field("len", &bytes.len())
                .finish(),
            Self::Bitmap { id, image } => f
                .debug_struct("Bitmap")
                .field("id", id)
                .field("size", &image.size())
                .finish(),
        }
    }
}

impl fmt::Display for ImageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl From<Url> for ImageModel {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<PathBuf> for ImageModel {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&str> for ImageModel {
    fn from(input: &str) -> Self {
        Self::parse(input)
    }
}

/// A request to load an image.
///
/// Requests are immutable values. Interceptors that want to change a request create a modified
/// copy using the `with_*` methods.
#[derive(Clone)]
pub struct ImageRequest {
    pub model: ImageModel,
    pub memory_cache_policy: CachePolicy,
    pub disk_cache_policy: CachePolicy,
    pub headers: BTreeMap<String, String>,
    pub transformations: Vec<Arc<dyn Transformation>>,
    /// The size the image should be decoded to fit into.
    pub size: Option<Size>,
    pub priority: Priority,
    /// An opaque tag used to cancel a group of enqueued requests at once.
    pub tag: Option<Arc<str>>,
    /// A memory cache key whose image is shown as an intermediate result while loading.
    pub placeholder_key: Option<MemoryKey>,
}

impl ImageRequest {
    pub fn new(model: impl Into<ImageModel>) -> Self {
        Self {
            model: model.into(),
            memory_cache_policy: CachePolicy::Enabled,
            disk_cache_policy: CachePolicy::Enabled,
            headers: BTreeMap::new(),
            transformations: Vec::new(),
            size: None,
            priority: Priority::Normal,
            tag: None,
            placeholder_key: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<ImageModel>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_memory_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.memory_cache_policy = policy;
        self
    }

    pub fn with_disk_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.disk_cache_policy = policy;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_transformation(mut self, transformation: Arc<dyn Transformation>) -> Self {
        self.transformations.push(transformation);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<Arc<str>>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_placeholder_key(mut self, key: MemoryKey) -> Self {
        self.placeholder_key = Some(key);
        self
    }

    /// The keys of all transformations, in application order.
    pub fn transformation_keys(&self) -> Vec<String> {
        self.transformations.iter().map(|t| t.key()).collect()
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("model", &self.model)
            .field("memory_cache_policy", &self.memory_cache_policy)
            .field("disk_cache_policy", &self.disk_cache_policy)
            .field("headers", &self.headers)
            .field("transformations", &self.transformation_keys())
            .field("size", &self.size)
            .field("priority", &self.priority)
            .field("tag", &self.tag)
            .finish()
    }
}

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct SuccessResult {
    pub image: Arc<DecodedImage>,
    pub data_source: DataSource,
    pub duration: Duration,
    /// `false` for intermediate results that will be followed by a better one.
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureResult {
    pub error: ImageError,
    pub duration: Duration,
}

impl FailureResult {
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

/// The state of an image load.
#[derive(Debug, Clone)]
pub enum ImageResult {
    Loading,
    Success(SuccessResult),
    Failure(FailureResult),
}

impl ImageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether this is a final result, either a complete success or a failure.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Loading => false,
            Self::Success(success) => success.is_complete,
            Self::Failure(_) => true,
        }
    }

    pub fn error(&self) -> Option<&ImageError> {
        match self {
            Self::Failure(failure) => Some(&failure.error),
            _ => None,
        }
    }

    pub fn image(&self) -> Option<&Arc<DecodedImage>> {
        match self {
            Self::Success(success) => Some(&success.image),
            _ => None,
        }
    }

    pub(crate) fn failure(error: ImageError, duration: Duration) -> Self {
        Self::Failure(FailureResult { error, duration })
    }
}
