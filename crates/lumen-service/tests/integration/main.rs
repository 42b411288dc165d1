mod disk;
mod e2e;
mod http;
mod interceptors;
mod tiling;
mod utils;
