use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use std::net::SocketAddr;

pub mod push_ingester;

/// Accepts a broadcaster's media upload and answers with the final status.
#[async_trait]
pub trait Ingester {
    async fn ingest(&self, remote: SocketAddr, req: Request<Incoming>) -> StatusCode;
}
