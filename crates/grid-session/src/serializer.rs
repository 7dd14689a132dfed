//! Codecs converting stored session state to and from bytes.
//!
//! A [`SessionSerializer`] is used wherever session state leaves the
//! process, e.g. by [`ProxyRegion`](crate::region::proxy::ProxyRegion) when
//! shipping state to and from the server tier.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{SessionId, SessionState};

/// Converts [`SessionState`] to and from its wire representation.
pub trait SessionSerializer: Debug + Send + Sync {
    /// Name identifying the codec, e.g. in logs and configuration.
    fn name(&self) -> &'static str;

    fn serialize(&self, state: &SessionState) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<SessionState>;
}

/// Built-in codec selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// Compact bincode framing.
    #[default]
    Binary,
    /// Self-describing JSON documents.
    Json,
}

impl SerializerKind {
    /// Instantiate the selected codec.
    pub fn build(self) -> Arc<dyn SessionSerializer> {
        match self {
            SerializerKind::Binary => Arc::new(BinarySessionSerializer),
            SerializerKind::Json => Arc::new(JsonSessionSerializer),
        }
    }
}

/// First byte of every binary frame.
const BINARY_FORMAT_VERSION: u8 = 1;

/// Binary frame layout. Attribute values are embedded as JSON text since
/// bincode is not self-describing.
#[derive(Serialize, Deserialize)]
struct BinaryFrame {
    id: String,
    creation_secs: i64,
    creation_nanos: u32,
    last_accessed_secs: i64,
    last_accessed_nanos: u32,
    max_inactive_interval_ms: i64,
    attributes: Vec<(String, String)>,
    principal_name: Option<String>,
    version: u64,
}

fn split_timestamp(ts: DateTime<Utc>) -> (i64, u32) {
    (ts.timestamp(), ts.timestamp_subsec_nanos())
}

fn join_timestamp(secs: i64, nanos: u32) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Serialization(format!("timestamp out of range: {secs}.{nanos}")))
}

/// Versioned bincode codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySessionSerializer;

impl SessionSerializer for BinarySessionSerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn serialize(&self, state: &SessionState) -> Result<Vec<u8>> {
        let mut attributes = Vec::with_capacity(state.attributes.len());
        for (key, value) in &state.attributes {
            attributes.push((key.clone(), serde_json::to_string(value)?));
        }

        let (creation_secs, creation_nanos) = split_timestamp(state.creation_time);
        let (last_accessed_secs, last_accessed_nanos) = split_timestamp(state.last_accessed_time);
        let frame = BinaryFrame {
            id: state.id.to_string(),
            creation_secs,
            creation_nanos,
            last_accessed_secs,
            last_accessed_nanos,
            max_inactive_interval_ms: state.max_inactive_interval_ms,
            attributes,
            principal_name: state.principal_name.clone(),
            version: state.version,
        };

        let mut bytes = vec![BINARY_FORMAT_VERSION];
        bytes.extend(bincode::serialize(&frame)?);
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<SessionState> {
        let (format, payload) = bytes
            .split_first()
            .ok_or_else(|| Error::Serialization("empty session frame".to_string()))?;
        if *format != BINARY_FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported session frame version {format}"
            )));
        }

        let frame: BinaryFrame = bincode::deserialize(payload)?;
        let mut attributes = std::collections::HashMap::with_capacity(frame.attributes.len());
        for (key, json) in frame.attributes {
            attributes.insert(key, serde_json::from_str(&json)?);
        }

        Ok(SessionState {
            id: SessionId::from(frame.id),
            creation_time: join_timestamp(frame.creation_secs, frame.creation_nanos)?,
            last_accessed_time: join_timestamp(frame.last_accessed_secs, frame.last_accessed_nanos)?,
            max_inactive_interval_ms: frame.max_inactive_interval_ms,
            attributes,
            principal_name: frame.principal_name,
            version: frame.version,
        })
    }
}

/// JSON codec, readable by anything that speaks JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSessionSerializer;

impl SessionSerializer for JsonSessionSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, state: &SessionState) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<SessionState> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
