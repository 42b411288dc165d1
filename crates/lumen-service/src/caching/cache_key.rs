use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{ImageRequest, Size};

/// Identifies a decoded image in the memory cache.
///
/// Unlike the [`DiskKey`], this includes the target size, as the same source decoded at two
/// different sizes results in two different images.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryKey {
    model: Arc<str>,
    transformations: Arc<[String]>,
    size: Option<Size>,
}

impl MemoryKey {
    pub fn new(model: impl Into<Arc<str>>, transformations: Vec<String>, size: Option<Size>) -> Self {
        Self {
            model: model.into(),
            transformations: transformations.into(),
            size,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn transformations(&self) -> &[String] {
        &self.transformations
    }

    pub fn size(&self) -> Option<Size> {
        self.size
    }
}

impl fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.model)?;
        for transformation in self.transformations.iter() {
            write!(f, "|{transformation}")?;
        }
        if let Some(size) = self.size {
            write!(f, "@{size}")?;
        }
        Ok(())
    }
}

/// Identifies the canonical bytes of an image in the disk cache.
///
/// The key is content-addressed: the human readable [`metadata`](Self::metadata) is hashed
/// with sha-256, and the hex-formatted hash is used as the file name.
#[derive(Debug, Clone, Eq)]
pub struct DiskKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for DiskKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for DiskKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

impl DiskKey {
    /// Create a [`DiskKeyBuilder`] for the given model id.
    pub fn builder(model: &str) -> DiskKeyBuilder {
        DiskKeyBuilder {
            metadata: format!("model: {model}\n"),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`DiskKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The name of the cache file, a lowercase hex-formatted sha-256 hash.
    pub fn file_name(&self) -> String {
        hex::encode(self.hash)
    }

    /// Reconstructs a key from a file name found in the cache directory.
    ///
    /// The metadata is lost in that case, which is fine as keys compare by hash only.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let mut hash = [0; 32];
        hex::decode_to_slice(name, &mut hash).ok()?;
        Some(Self {
            metadata: Arc::from(""),
            hash,
        })
    }

    #[cfg(test)]
    pub fn for_testing(key: &str) -> Self {
        Self::builder(key).build()
    }
}

/// A builder for [`DiskKey`]s.
///
/// This accepts human readable, but most importantly **stable** input, which is hashed to form
/// the key.
pub struct DiskKeyBuilder {
    metadata: String,
}

impl DiskKeyBuilder {
    /// Writes a transformation into the key. Order matters.
    pub fn write_transformation(&mut self, key: &str) -> Result<(), fmt::Error> {
        self.metadata
            .write_fmt(format_args!("transformation: {key}\n"))
    }

    pub fn build(self) -> DiskKey {
        let mut hash = [0; 32];
        hash.copy_from_slice(&Sha256::digest(&self.metadata));
        DiskKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for DiskKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// The memory and disk projections of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub memory: MemoryKey,
    pub disk: DiskKey,
}

impl CacheKey {
    pub fn from_request(request: &ImageRequest) -> Self {
        let model = request.model.id();
        let transformations = request.transformation_keys();

        let mut builder = DiskKey::builder(&model);
        for transformation in &transformations {
            // writing into a `String` is infallible
            let _ = builder.write_transformation(transformation);
        }

        Self {
            memory: MemoryKey::new(model, transformations, request.size),
            disk: builder.build(),
        }
    }
}
