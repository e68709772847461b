use crate::errors::ServerError;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
pub struct HttpOptions {
    pub max_buffer_size: Option<usize>,
    pub shutdown_timeout: Duration,
}

pub fn listen(addr: String) -> Result<TcpListener, ServerError> {
    let addr = common::socket::parse_address(addr)
        .map_err(|e| ServerError::NetworkError(e.to_string()))?;
    let socket = common::socket::listen_reuse_socket(&addr)
        .map_err(|e| ServerError::NetworkError(format!("{}: {}", addr, e)))?;
    TcpListener::from_std(socket.into()).map_err(|e| ServerError::NetworkError(e.to_string()))
}

/// Serves http/1 connections until the notifier fires, then drains them.
/// `make_service` builds one service per connection from the peer address.
pub async fn serve<F, S>(
    name: &'static str,
    notifier: Arc<Notify>,
    listener: TcpListener,
    options: HttpOptions,
    make_service: F,
) -> Result<(), ServerError>
where
    F: Fn(SocketAddr) -> S,
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, Infallible>>, Error = Infallible>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let local = listener
        .local_addr()
        .map_err(|e| ServerError::NetworkError(e.to_string()))?;
    info!("{}: listening on http://{}", name, local);

    let mut http = http1::Builder::new();
    match options.max_buffer_size {
        Some(max_buffer_size) if max_buffer_size > 0 => {
            info!("{}: max buffer size is set to {}", name, max_buffer_size);
            http.max_buf_size(max_buffer_size);
        }
        _ => info!("{}: max buffer size is default ~400KB", name),
    }

    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let mut signal = pin::pin!(notifier.notified());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("{}: accept: {}", name, e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let conn = http.serve_connection(io, make_service(remote));
                let fut = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        error!("{}: downstream: serve: {:?}", name, e);
                    }
                });
            },
            _ = &mut signal => {
                info!("{}: http server: graceful shutdown", name);
                break;
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => {
            info!("{}: http server: all connections gracefully closed", name);
        },
        _ = tokio::time::sleep(options.shutdown_timeout) => {
            info!("{}: timed out wait for all connections to close", name);
        }
    }
    Ok(())
}
