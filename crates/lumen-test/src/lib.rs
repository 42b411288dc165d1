//! Helpers for testing the image loader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk cache would silently recreate
//!    the directory and leak it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let _cache_dir = lumen_test::tempdir()`).
//!
//!  - When using [`image_server`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, all connections to it will fail.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{self, OriginalUri, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use image::{ImageFormat, Rgba, RgbaImage};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// The token the image server expects for `/protected` images.
pub const AUTH_TOKEN: &str = "Bearer lumen";

/// How many times a `/flaky` image fails before it is served.
pub const FLAKY_FAILURES: usize = 2;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `lumen` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("lumen_service=trace,lumen=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Creates an RGBA image with a deterministic gradient.
///
/// Every pixel encodes its own coordinates, which allows tests to check which region of an
/// image they are looking at.
pub fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x / 256) + (y / 256) * 16) as u8, 255])
    })
}

/// Encodes a [`gradient`] of the given size as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    gradient(width, height)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Parses a `{width}x{height}.png` file name.
fn parse_size(name: &str) -> Option<(u32, u32)> {
    let (width, height) = name.strip_suffix(".png")?.split_once('x')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}

fn png_response(name: &str) -> Response {
    match parse_size(name) {
        Some((width, height)) => {
            ([(header::CONTENT_TYPE, "image/png")], png_bytes(width, height)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.addr(), path).parse().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A server for synthetic images, which counts the requests it receives.
///
/// It serves the following routes:
///
///  - `/images/{width}x{height}.png`: a [`gradient`] of the given size.
///  - `/protected/{width}x{height}.png`: the same, but only with an `Authorization: Bearer lumen`
///    header, otherwise `403`.
///  - `/flaky/{width}x{height}.png`: responds with `503` for the first [`FLAKY_FAILURES`]
///    requests, then serves the image.
///  - `/delay/{millis}/{width}x{height}.png`: serves the image after the given delay.
///  - `/status/{code}`: responds with the given status code.
///  - `/garbage.png`: responds with bytes that are not an image.
pub struct ImageServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ImageServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    *hits.lock().unwrap().entry(uri.path().to_owned()).or_default() += 1;
                    next.run(req).await
                }
            }
        };

        let flaky = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, extract::Path(name): extract::Path<String>| {
                let hits = hits.clone();
                async move {
                    let attempts = hits.lock().unwrap().get(uri.path()).copied().unwrap_or(0);
                    if attempts <= FLAKY_FAILURES {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        png_response(&name)
                    }
                }
            }
        };

        let router = Router::new()
            .route(
                "/images/:name",
                get(|extract::Path(name): extract::Path<String>| async move { png_response(&name) }),
            )
            .route(
                "/protected/:name",
                get(
                    |headers: HeaderMap, extract::Path(name): extract::Path<String>| async move {
                        let authorized = headers
                            .get(header::AUTHORIZATION)
                            .is_some_and(|value| value.as_bytes() == AUTH_TOKEN.as_bytes());
                        match authorized {
                            true => png_response(&name),
                            false => (StatusCode::FORBIDDEN, "missing token").into_response(),
                        }
                    },
                ),
            )
            .route("/flaky/:name", get(flaky))
            .route(
                "/delay/:millis/:name",
                get(
                    |extract::Path((millis, name)): extract::Path<(u64, String)>| async move {
                        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
                        png_response(&name)
                    },
                ),
            )
            .route(
                "/status/:code",
                get(|extract::Path(code): extract::Path<u16>| async move {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route(
                "/garbage.png",
                get(|| async { "definitely not a png" }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns and resets the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the number of requests per path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns an [`ImageServer`].
pub fn image_server() -> ImageServer {
    ImageServer::new()
}
