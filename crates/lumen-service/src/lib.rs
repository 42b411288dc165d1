#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decode;
pub mod error;
pub mod events;
pub mod fetch;
pub mod interceptor;
pub mod loader;
pub mod logging;
pub mod subsampling;
pub mod transform;
pub mod types;
pub mod utils;

pub use error::ImageError;
pub use loader::{Disposable, ImageLoader, ImageLoaderBuilder};
pub use types::{CachePolicy, DataSource, ImageModel, ImageRequest, ImageResult, Priority, Size};
