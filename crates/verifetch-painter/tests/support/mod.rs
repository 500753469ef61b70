//! In-process HTTP fixture serving an artifact and its `.mref` sidecar,
//! with byte-range support, optional corruption, per-request delay, and a
//! request log the tests assert against.

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Clone)]
pub struct FixtureOptions {
    pub content: Vec<u8>,
    pub mref: Vec<u8>,
    /// Honor `Range` with 206; when false, every GET answers 200 full-body.
    pub support_ranges: bool,
    /// Flip the byte at this artifact offset in every served window.
    pub corrupt_offset: Option<usize>,
    /// Sleep before answering artifact GETs.
    pub response_delay: Duration,
}

impl FixtureOptions {
    pub fn new(content: Vec<u8>, mref: Vec<u8>) -> Self {
        Self {
            content,
            mref,
            support_ranges: true,
            corrupt_offset: None,
            response_delay: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

struct ServerState {
    opts: FixtureOptions,
    requests: Mutex<Vec<RequestRecord>>,
}

pub struct FixtureServer {
    base_url: String,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FixtureServer {
    pub async fn start(opts: FixtureOptions) -> Self {
        let state = Arc::new(ServerState {
            opts,
            requests: Mutex::new(Vec::new()),
        });

        let svc_state = Arc::clone(&state);
        let make = make_service_fn(move |_conn| {
            let st = Arc::clone(&svc_state);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&st), req)))
            }
        });

        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = Server::bind(&addr).serve(make);
        let local = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = rx.await;
        });
        tokio::spawn(graceful);

        Self {
            base_url: format!("http://{local}"),
            state,
            shutdown: Some(tx),
        }
    }

    pub fn artifact_url(&self) -> String {
        format!("{}/artifact", self.base_url)
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.requests.lock().unwrap().clone()
    }

    /// All GETs for the artifact itself (ranged or not).
    pub fn artifact_gets(&self) -> Vec<RequestRecord> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET" && r.path == "/artifact")
            .collect()
    }

    /// GETs for the artifact that carried a `Range` header.
    pub fn ranged_gets(&self) -> Vec<RequestRecord> {
        self.artifact_gets()
            .into_iter()
            .filter(|r| r.range.is_some())
            .collect()
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle(
    state: Arc<ServerState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.requests.lock().unwrap().push(RequestRecord {
        method: method.to_string(),
        path: path.clone(),
        range: range.clone(),
    });

    let opts = &state.opts;
    let resp = match path.as_str() {
        "/artifact.mref" => Response::new(Body::from(opts.mref.clone())),
        "/artifact" => {
            if method == Method::HEAD {
                Response::builder()
                    .header(header::CONTENT_LENGTH, opts.content.len())
                    .body(Body::empty())
                    .unwrap()
            } else {
                if !opts.response_delay.is_zero() {
                    tokio::time::sleep(opts.response_delay).await;
                }
                serve_artifact(opts, range.as_deref())
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(resp)
}

fn serve_artifact(opts: &FixtureOptions, range: Option<&str>) -> Response<Body> {
    let total = opts.content.len();
    match range.and_then(parse_range) {
        Some((start, end_incl)) if opts.support_ranges && start <= end_incl && end_incl < total as u64 => {
            let (start, end_incl) = (start as usize, end_incl as usize);
            let body = window(opts, start, end_incl + 1);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end_incl}/{total}"),
                )
                .body(Body::from(body))
                .unwrap()
        }
        _ => Response::new(Body::from(window(opts, 0, total))),
    }
}

/// Content slice `[start, end)` with the optional corruption applied.
fn window(opts: &FixtureOptions, start: usize, end: usize) -> Vec<u8> {
    let mut body = opts.content[start..end].to_vec();
    if let Some(off) = opts.corrupt_offset {
        if (start..end).contains(&off) {
            body[off - start] ^= 0xFF;
        }
    }
    body
}

/// Parse `bytes=a-b`.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (a, b) = spec.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}
