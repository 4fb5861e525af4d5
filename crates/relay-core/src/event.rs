//! Telemetry events exchanged between producers, the daemon and viewers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::SignalKind;

/// One observed export batch.
///
/// `payload` is the protobuf encoding of the export request for `kind`.
/// The daemon never looks inside it; viewers decode it as needed.
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Which export request the payload holds
    pub kind: SignalKind,

    /// Serialized export request (base64 on the wire)
    #[serde(with = "base64_payload")]
    pub payload: Bytes,
}

impl TelemetryEvent {
    /// Creates a new event.
    pub fn new(kind: SignalKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Returns the payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Serde adapter encoding the payload as standard base64 text.
mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
