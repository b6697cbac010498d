//! Helpers for testing the engine against real HTTP and file system state.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, this might silently leak the temp
//!    directory, since the disk cache will create it again lazily after it has been deleted. To
//!    avoid this, assign it to a variable in the test function (e.g. `let _cache_dir =
//!    test::tempdir()`).
//!
//!  - When using [`HitCounter`] or [`short_read_server`], make sure that the server is held until
//!    all requests to the server have been made. The server stops serving when dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `webimage_service` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("webimage_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
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

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

async fn hitcounter(
    State(hits): State<Hits>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    req: Request,
    next: Next,
) -> Response {
    {
        let mut hits = hits.lock().unwrap();
        let hits = hits.entry(format!("{method} {uri}")).or_default();
        *hits += 1;
    }

    next.run(req).await
}

/// Formats `time` the way HTTP date headers are written.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn image(path: &str, expires: Option<DateTime<Utc>>) -> Response {
    let body = format!("image:{path}");
    match expires {
        Some(expires) => ([(header::EXPIRES, http_date(expires))], body).into_response(),
        None => body.into_response(),
    }
}

/// A server for image fixtures which counts every request it receives.
///
/// Requests are counted as `"<METHOD> <path>"`. Every `GET` route also answers `HEAD`.
///
/// - `/images/*path`: responds with `image:<path>`, expiring in one hour.
/// - `/expired/*path`: responds with `image:<path>`, already expired.
/// - `/noexpiry/*path`: responds with `image:<path>`, without an `Expires` header.
/// - `/garbage_expiry/*path`: responds with `image:<path>` and an unparseable `Expires` header.
/// - `/redirect/*path`: redirects to `/<path>`. Nest it to build redirect chains.
/// - `/delay/:time/*path`: waits for the given humantime duration, then redirects to `/<path>`.
/// - `/respond_statuscode/:num/*tail`: responds with the given status code.
pub struct HitCounter {
    server: Server,
    hits: Hits,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Hits::default();

        let router = Router::new()
            .route(
                "/images/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    image(&path, Some(Utc::now() + chrono::Duration::hours(1)))
                }),
            )
            .route(
                "/expired/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    image(&path, Some(Utc::now() - chrono::Duration::hours(1)))
                }),
            )
            .route(
                "/noexpiry/*path",
                get(|extract::Path(path): extract::Path<String>| async move { image(&path, None) }),
            )
            .route(
                "/garbage_expiry/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    ([(header::EXPIRES, "not a date")], format!("image:{path}"))
                }),
            )
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .layer(middleware::from_fn_with_state(hits.clone(), hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests since the last call, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests per method and path since the last call, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a server that announces a body of 100 bytes, sends only 5 and closes the connection.
pub fn short_read_server() -> Server {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.set_nonblocking(true).unwrap();
    let socket = listener.local_addr().unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();

    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort",
                    )
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });

    Server { handle, socket }
}
