//! The HTTP packet endpoint.
//!
//! A packet travels as `POST /fed` with a base64 (standard alphabet) body.
//! The `X-Reply` header carries the sender's gossip port, so the receiver
//! can answer at `<remote ip>:<X-Reply>`.

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use orkv_gossip::Packet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub const FED_PATH: &str = "/fed";
pub const REPLY_HEADER: &str = "X-Reply";

pub fn encode_body(buf: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(buf)
}

/// Largest body accepted for packets of up to `max_packet` bytes.
pub fn body_limit(max_packet: usize) -> usize {
    max_packet.div_ceil(3) * 4
}

fn reply(status: StatusCode, msg: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(msg.as_bytes())));
    *resp.status_mut() = status;
    resp
}

/// Handle one request to the packet endpoint. Bodies longer than
/// `body_limit` bytes are rejected without being buffered in full.
pub async fn handle<B>(
    req: Request<B>,
    remote: SocketAddr,
    packets: mpsc::Sender<Packet>,
    body_limit: usize,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() != Method::POST || req.uri().path() != FED_PATH {
        return Ok(reply(StatusCode::NOT_FOUND, "not found"));
    }

    let port = match req
        .headers()
        .get(REPLY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u16>().ok())
    {
        Some(port) => port,
        None => {
            tracing::warn!("packet from {} without a valid {} header", remote, REPLY_HEADER);
            return Ok(reply(StatusCode::BAD_REQUEST, "bad reply header"));
        }
    };

    let body = match Limited::new(req.into_body(), body_limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            tracing::warn!("packet from {} exceeds {} bytes", remote, body_limit);
            orkv_metrics::metrics().packets_failed.inc();
            return Ok(reply(StatusCode::PAYLOAD_TOO_LARGE, "packet too large"));
        }
        Err(e) => {
            tracing::warn!("failed to read packet body from {}: {}", remote, e);
            orkv_metrics::metrics().packets_failed.inc();
            return Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, "unreadable body"));
        }
    };
    let buf = match base64::engine::general_purpose::STANDARD.decode(&body) {
        Ok(buf) => buf,
        Err(e) => {
            tracing::warn!("undecodable packet from {}: {}", remote, e);
            orkv_metrics::metrics().packets_failed.inc();
            return Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, "bad encoding"));
        }
    };

    let packet = Packet {
        buf,
        from: SocketAddr::new(remote.ip(), port),
        timestamp: Instant::now(),
    };
    if packets.send(packet).await.is_err() {
        return Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, "shutting down"));
    }
    orkv_metrics::metrics().packets_received.inc();
    Ok(reply(StatusCode::OK, ""))
}

/// Serve the packet endpoint on `listener` until `stop` fires.
pub async fn serve(
    listener: TcpListener,
    packets: mpsc::Sender<Packet>,
    body_limit: usize,
    shutdown: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!("packet endpoint accept failed: {}", e);
                continue;
            }
        };

        let tx = packets.clone();
        let mut conn_stop = stop.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, remote, tx.clone(), body_limit));
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            // Pooled client connections stay open; drop them with the listener.
            tokio::select! {
                res = conn => {
                    if let Err(e) = res {
                        tracing::debug!("packet connection from {} ended: {}", remote, e);
                    }
                }
                _ = conn_stop.changed() => {}
            }
        });
    }
}
