use crate::catalog::SegmentCatalog;
use crate::config::is_contained;
use crate::ingester::Ingester;
use crate::session::StreamSessionManager;
use crate::storage::{segment_key, StorageProvider};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error};
use transcoder::MANIFEST_NAME;

type Body = BoxBody<Bytes, Infallible>;

const COMMON_HEADERS: [(&str, &str); 1] = [("Access-Control-Allow-Origin", "*")];
const PLAYLIST_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_TYPE: &str = "video/mp2t";

#[derive(Clone)]
pub struct IngesterService {
    ingester: Arc<dyn Ingester + Send + Sync>,
    remote: SocketAddr,
}

impl IngesterService {
    pub fn new(ingester: Arc<dyn Ingester + Send + Sync>, remote: SocketAddr) -> Self {
        IngesterService { ingester, remote }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        let status = self.ingester.ingest(self.remote, req).await;
        Ok(empty_response(status))
    }
}

impl Service<Request<Incoming>> for IngesterService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.handle(req).await })
    }
}

/// Playlists, segments, stream status and the static web root.
#[derive(Clone)]
pub struct ServingService {
    catalog: Arc<SegmentCatalog>,
    sessions: Arc<StreamSessionManager>,
    storage: Arc<dyn StorageProvider>,
    webroot: PathBuf,
}

impl ServingService {
    pub fn new(
        catalog: Arc<SegmentCatalog>,
        sessions: Arc<StreamSessionManager>,
        storage: Arc<dyn StorageProvider>,
        webroot: PathBuf,
    ) -> Self {
        ServingService {
            catalog,
            sessions,
            storage,
            webroot,
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
        }

        let path = req.uri().path();
        let res = match path.strip_prefix("/hls/") {
            Some(rest) => self.hls(rest).await,
            None if path == "/api/status" => self.status(),
            None => self.static_file(path.trim_start_matches('/')).await,
        };

        if req.method() == Method::HEAD {
            let (parts, _) = res.into_parts();
            return Ok(Response::from_parts(parts, BoxBody::default()));
        }
        Ok(res)
    }

    async fn hls(&self, rest: &str) -> Response<Body> {
        if rest == MANIFEST_NAME {
            return playlist_response(self.catalog.master_manifest().to_string());
        }

        let Some((rendition, file)) = rest.split_once('/') else {
            return empty_response(StatusCode::NOT_FOUND);
        };
        if file == MANIFEST_NAME {
            return match self.catalog.current_playlist(rendition) {
                Some(playlist) => playlist_response(playlist.manifest().to_string()),
                None => empty_response(StatusCode::NOT_FOUND),
            };
        }

        if !file.ends_with(".ts") || !is_contained(Path::new(rest)) || file.contains('/') {
            return empty_response(StatusCode::NOT_FOUND);
        }

        let path = self.catalog.layout().segment_path(rendition, file);
        match read_file(&path).await {
            Ok(Some(data)) => return file_response(data, SEGMENT_TYPE),
            Ok(None) => {}
            Err(e) => {
                error!("read {}: {}", path.display(), e);
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        // Evicted from local disk but still kept by storage.
        match self.catalog.archived_locator(&segment_key(rendition, file)) {
            Some(locator) if locator.is_remote() => {
                let url = self.storage.resolve_serving_url(&locator);
                debug!(%locator, url, "redirecting to archived segment");
                let mut res = empty_response(StatusCode::FOUND);
                if let Ok(value) = url.parse() {
                    res.headers_mut().insert(LOCATION, value);
                }
                res
            }
            _ => empty_response(StatusCode::NOT_FOUND),
        }
    }

    fn status(&self) -> Response<Body> {
        match serde_json::to_vec(&self.sessions.status()) {
            Ok(body) => {
                let mut res = file_response(Bytes::from(body), "application/json");
                res.headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                res
            }
            Err(e) => {
                error!("encode status: {}", e);
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn static_file(&self, relative: &str) -> Response<Body> {
        let relative = if relative.is_empty() { "index.html" } else { relative };
        if !is_contained(Path::new(relative)) {
            return empty_response(StatusCode::NOT_FOUND);
        }

        let path = self.webroot.join(relative);
        match read_file(&path).await {
            Ok(Some(data)) => file_response(data, content_type(&path)),
            Ok(None) => empty_response(StatusCode::NOT_FOUND),
            Err(e) => {
                error!("read {}: {}", path.display(), e);
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl Service<Request<Incoming>> for ServingService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.handle(req).await })
    }
}

async fn read_file(path: &Path) -> io::Result<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::IsADirectory => Ok(None),
        Err(e) => Err(e),
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("m3u8") => PLAYLIST_TYPE,
        Some("ts") => SEGMENT_TYPE,
        _ => "application/octet-stream",
    }
}

fn playlist_response(manifest: String) -> Response<Body> {
    let mut res = file_response(Bytes::from(manifest), PLAYLIST_TYPE);
    res.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    res
}

fn file_response(data: Bytes, content_type: &'static str) -> Response<Body> {
    let mut res = Response::new(Full::new(data).boxed());
    for header in COMMON_HEADERS {
        res.headers_mut()
            .insert(header.0, HeaderValue::from_static(header.1));
    }
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    res
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(BoxBody::default());
    *res.status_mut() = status;
    for header in COMMON_HEADERS {
        res.headers_mut()
            .insert(header.0, HeaderValue::from_static(header.1));
    }
    res
}
