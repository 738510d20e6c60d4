//! JSON bodies of the REST API.

use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use orkv_crdt::{Payload, TsValue};
use serde::{Deserialize, Serialize};

/// Every response is wrapped in this envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Error", default)]
    pub error: String,
    #[serde(rename = "Data", default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn ok(data: impl Into<serde_json::Value>) -> Self {
        Self {
            status: "ok".to_string(),
            error: String::new(),
            data: data.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: msg.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn into_response(self, status: StatusCode) -> Response<Full<Bytes>> {
        let (status, body) = match serde_json::to_vec(&self) {
            Ok(body) => (status, body),
            Err(e) => {
                tracing::error!("failed to encode response: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes())
            }
        };
        let mut resp = Response::new(Full::new(Bytes::from(body)));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        resp
    }
}

/// `POST /cluster/join` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "Peers", default)]
    pub peers: Vec<String>,
}

/// One stored value as returned by `GET /get/{key}`. `Value` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueView {
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "ContentType")]
    pub content_type: String,
}

impl From<&TsValue> for ValueView {
    fn from(v: &TsValue) -> Self {
        Self {
            timestamp: v.timestamp,
            value: base64::engine::general_purpose::STANDARD.encode(&v.payload),
            content_type: v.content_type.clone(),
        }
    }
}

impl ValueView {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.value)
    }
}

/// A single visible value is returned bare, several as an array.
pub fn payload_data(payload: &Payload) -> serde_json::Value {
    let view = |v: &TsValue| serde_json::to_value(ValueView::from(v)).unwrap_or_default();
    match payload.extract() {
        Some(v) => view(v),
        None => serde_json::Value::Array(payload.values().map(view).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orkv_crdt::ObservationId;

    #[test]
    fn test_envelope_field_names() {
        let js = serde_json::to_string(&Envelope::ok("added k")).unwrap();
        assert_eq!(js, r#"{"Status":"ok","Error":"","Data":"added k"}"#);

        let js = serde_json::to_string(&Envelope::error("not found")).unwrap();
        assert_eq!(js, r#"{"Status":"error","Error":"not found","Data":null}"#);
    }

    #[test]
    fn test_join_request_parse() {
        let req: JoinRequest = serde_json::from_str(r#"{"Peers":["a:1","b:2"]}"#).unwrap();
        assert_eq!(req.peers, vec!["a:1".to_string(), "b:2".to_string()]);
        let req: JoinRequest = serde_json::from_str("{}").unwrap();
        assert!(req.peers.is_empty());
    }

    #[test]
    fn test_single_value_is_bare() {
        let mut payload = Payload::new();
        payload.insert(ObservationId::mint(), TsValue::at(7, b"hi".to_vec(), "text/plain"));
        let data = payload_data(&payload);
        let view: ValueView = serde_json::from_value(data).unwrap();
        assert_eq!(view.timestamp, 7);
        assert_eq!(view.decode().unwrap(), b"hi");
        assert_eq!(view.content_type, "text/plain");
    }

    #[test]
    fn test_several_values_are_listed() {
        let mut payload = Payload::new();
        payload.insert(ObservationId::mint(), TsValue::at(1, b"a".to_vec(), ""));
        payload.insert(ObservationId::mint(), TsValue::at(2, b"b".to_vec(), ""));
        let views: Vec<ValueView> = serde_json::from_value(payload_data(&payload)).unwrap();
        assert_eq!(views.len(), 2);
    }
}
