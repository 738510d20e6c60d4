//! orkv-api: the REST front of a node.
//!
//! | Route | Effect |
//! |-------|--------|
//! | `POST /add/{key}` | add the body as a new value, tagged with the request `Content-Type` |
//! | `GET /get/{key}` | visible value(s) of the key |
//! | `DELETE /del/{key}` | remove every observed value of the key |
//! | `POST /cluster/join` | join peers, body `{"Peers": ["host:port", ...]}` |
//! | `GET /cluster/leave` | leave the cluster |
//!
//! Keys are percent-decoded, so `/add/a%20b` addresses the key `a b`.
//! Responses use the [`Envelope`] JSON shape.

pub mod envelope;

pub use envelope::{Envelope, JoinRequest, ValueView};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use orkv_crdt::CrdtError;
use orkv_oplog::OpLogError;
use orkv_peering::PeeringError;
use orkv_server::{Server, ServerError};
use std::borrow::Cow;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Server(#[from] ServerError),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Server(e) if is_caller_error(e) => StatusCode::BAD_REQUEST,
            ApiError::Server(_) | ApiError::Body(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn is_caller_error(e: &ServerError) -> bool {
    matches!(
        e,
        ServerError::OpLog(OpLogError::Crdt(CrdtError::InvalidKey(_)))
            | ServerError::Peering(PeeringError::BadPeerAddress(_))
    )
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

enum Route<'a> {
    Add(&'a str),
    Get(&'a str),
    Del(&'a str),
    Join,
    Leave,
}

fn route<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let keyed = |prefix: &str| {
        path.strip_prefix(prefix)
            .filter(|key| !key.is_empty() && !key.contains('/'))
    };
    if *method == Method::POST {
        if path == "/cluster/join" {
            return Some(Route::Join);
        }
        keyed("/add/").map(Route::Add)
    } else if *method == Method::GET {
        if path == "/cluster/leave" {
            return Some(Route::Leave);
        }
        keyed("/get/").map(Route::Get)
    } else if *method == Method::DELETE {
        keyed("/del/").map(Route::Del)
    } else {
        None
    }
}

fn decode_key(raw: &str) -> Result<Cow<'_, str>, ApiError> {
    let key = percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| ApiError::BadRequest(format!("key is not valid utf-8: {}", e)))?;
    if key.is_empty() {
        return Err(ApiError::BadRequest("empty key".to_string()));
    }
    Ok(key)
}

async fn read_body<B>(body: B) -> Result<Bytes, ApiError>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ApiError::Body(e.to_string()))
}

async fn dispatch<B>(req: Request<B>, server: &Server) -> Result<Envelope, ApiError>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let Some(route) = route(&method, &path) else {
        return Err(ApiError::NotFound(format!("no route for {} {}", method, path)));
    };

    match route {
        Route::Add(key) => {
            let key = decode_key(key)?;
            let content_type = req
                .headers()
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = read_body(req.into_body()).await?;
            server.add(&key, body.to_vec(), &content_type).await?;
            Ok(Envelope::ok(format!("added {}", key)))
        }
        Route::Get(key) => match server.load(&decode_key(key)?).await? {
            Some(payload) => Ok(Envelope::ok(envelope::payload_data(&payload))),
            None => Err(ApiError::NotFound("not found".to_string())),
        },
        Route::Del(key) => {
            let key = decode_key(key)?;
            server.remove(&key).await?;
            Ok(Envelope::ok(format!("deleted {}", key)))
        }
        Route::Join => {
            let body = read_body(req.into_body()).await?;
            let join: JoinRequest = serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("bad join request: {}", e)))?;
            if join.peers.is_empty() {
                return Err(ApiError::BadRequest("no peers given".to_string()));
            }
            let n = server.join(&join.peers).await?;
            tracing::info!("api join contacted {} of {} peers", n, join.peers.len());
            Ok(Envelope::ok(format!("joined {}", join.peers.join(","))))
        }
        Route::Leave => {
            server.leave().await?;
            Ok(Envelope::ok("leave ok"))
        }
    }
}

/// Handle one API request.
pub async fn handle<B>(
    req: Request<B>,
    server: Arc<Server>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let resp = match dispatch(req, &server).await {
        Ok(envelope) => envelope.into_response(StatusCode::OK),
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                tracing::error!("api request failed: {}", e);
            } else {
                tracing::debug!("api request rejected: {}", e);
            }
            Envelope::error(e.to_string()).into_response(status)
        }
    };
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Serve the API on `listener` until `stop` fires.
pub async fn serve(
    listener: TcpListener,
    server: Arc<Server>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ApiError> {
    tracing::info!("api listening on http://{}", listener.local_addr()?);
    loop {
        let (stream, remote) = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted?,
        };

        let server = server.clone();
        let mut conn_stop = stop.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, server.clone()));
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::select! {
                res = conn => {
                    if let Err(e) = res {
                        tracing::debug!("api connection from {} ended: {}", remote, e);
                    }
                }
                _ = conn_stop.changed() => {}
            }
        });
    }
    Ok(())
}
