//! The operation record shared by the pipeline, the anti-entropy log and
//! the gossip wire.

use orkv_crdt::{now_nanos, ObservationId, TsValue};
use orkv_storage::{codec, keys, CodecError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REM")]
    Rem,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Add => "ADD",
            OpKind::Rem => "REM",
        }
    }

    /// Storage key prefix for this kind.
    fn row_prefix(self) -> &'static str {
        match self {
            OpKind::Add => keys::ADD,
            OpKind::Rem => keys::REM,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLog {
    /// `<20-digit nanos>.<KIND>.<key>`; sorts by time.
    #[serde(rename = "operationID")]
    pub id: String,
    /// `add.<key>.<obs>` or `rem.<key>.<obs>`.
    #[serde(rename = "keyID")]
    pub key_id: String,
    pub key: String,
    pub kind: OpKind,
    pub value: TsValue,
    #[serde(rename = "isFromRemote", default)]
    pub is_from_remote: bool,
    /// For REM: the observations the originating node tombstoned.
    #[serde(default)]
    pub tombstones: Vec<ObservationId>,
}

impl OpLog {
    pub fn new(key: &str, payload: Vec<u8>, kind: OpKind, content_type: &str) -> Self {
        let ts = now_nanos();
        let obs = ObservationId::mint();
        Self {
            id: operation_id(ts, kind, key),
            key_id: format!("{}.{}.{}", kind.row_prefix(), key, obs),
            key: key.to_string(),
            kind,
            value: TsValue::at(ts, payload, content_type),
            is_from_remote: false,
            tombstones: Vec::new(),
        }
    }

    pub fn add(key: &str, payload: Vec<u8>, content_type: &str) -> Self {
        Self::new(key, payload, OpKind::Add, content_type)
    }

    pub fn remove(key: &str) -> Self {
        Self::new(key, Vec::new(), OpKind::Rem, "")
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        codec::decode(buf)
    }
}

/// Zero-padded so lexical order matches time order.
pub fn operation_id(ts: i64, kind: OpKind, key: &str) -> String {
    format!("{:020}.{}.{}", ts, kind, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_add_layout() {
        let op = OpLog::add("k1", b"foo".to_vec(), "text/plain");
        assert_eq!(op.kind, OpKind::Add);
        assert!(op.key_id.starts_with("add.k1."));
        assert!(op.id.ends_with(".ADD.k1"));
        assert_eq!(op.id.split('.').next().unwrap().len(), 20);
        assert_eq!(op.value.payload, b"foo");
        assert_eq!(op.value.content_type, "text/plain");
        assert!(!op.is_from_remote);

        let (kind, key, _) = keys::split_key_id(&op.key_id).unwrap();
        assert_eq!(kind, "add");
        assert_eq!(key, "k1");
    }

    #[test]
    fn test_new_rem_layout() {
        let op = OpLog::remove("a.b");
        assert!(op.key_id.starts_with("rem.a.b."));
        assert!(op.id.ends_with(".REM.a.b"));
        assert!(op.value.payload.is_empty());
    }

    #[test]
    fn test_operation_ids_sort_by_time() {
        let early = operation_id(999, OpKind::Add, "z");
        let late = operation_id(1000, OpKind::Add, "a");
        assert!(early < late);
    }

    #[test]
    fn test_wire_field_names() {
        let mut op = OpLog::remove("k1");
        op.tombstones = vec![ObservationId::mint()];
        let buf = op.encode().unwrap();

        let raw = String::from_utf8_lossy(&buf);
        for field in ["operationID", "keyID", "isFromRemote", "tombstones", "contentType"] {
            assert!(raw.contains(field), "missing wire field {}", field);
        }
        assert_eq!(OpLog::decode(&buf).unwrap(), op);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        #[derive(Serialize)]
        struct Legacy<'a> {
            #[serde(rename = "operationID")]
            id: &'a str,
            #[serde(rename = "keyID")]
            key_id: &'a str,
            key: &'a str,
            kind: OpKind,
            value: TsValue,
        }
        let buf = codec::encode(&Legacy {
            id: "00000000000000000001.ADD.k",
            key_id: "add.k.x:1",
            key: "k",
            kind: OpKind::Add,
            value: TsValue::at(1, b"v".to_vec(), ""),
        })
        .unwrap();

        let op = OpLog::decode(&buf).unwrap();
        assert!(!op.is_from_remote);
        assert!(op.tombstones.is_empty());
    }
}
