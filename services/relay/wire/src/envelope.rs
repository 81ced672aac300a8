//! Envelope tagged union and its JSON encoding.
//!
//! Inbound text is parsed once into [`Envelope`]; anything that does not match
//! one of the four variants (optionally wrapped in a `From` object) is
//! rejected with a [`WireError`].

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::trace;

/// Key of the optional forwarding wrapper around inbound envelopes
pub const FORWARD_TAG: &str = "From";

const VARIANT_TAGS: [&str; 4] = ["Req", "Resp", "Error", "Notif"];

/// Correlation identifier linking a request to its reply
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One protocol frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Request carrying `{"<MethodName>": params}`
    Req {
        /// Correlation identifier
        id: RequestId,
        /// Single-key object naming the remote operation
        req: Value,
    },
    /// Successful reply
    Resp {
        /// Identifier of the request being answered
        id: RequestId,
        /// Opaque result payload
        resp: Value,
    },
    /// Rejected request
    Error {
        /// Identifier of the request being answered
        id: RequestId,
        /// Opaque error payload
        err: Value,
    },
    /// Unsolicited notification, not correlated to any request
    Notif(Value),
}

impl Envelope {
    /// Build a request envelope for `method` with opaque `params`
    pub fn request(id: RequestId, method: &str, params: Value) -> Self {
        let mut req = Map::with_capacity(1);
        req.insert(method.to_string(), params);
        Envelope::Req {
            id,
            req: Value::Object(req),
        }
    }

    /// Correlation identifier, if this variant carries one
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Envelope::Req { id, .. } | Envelope::Resp { id, .. } | Envelope::Error { id, .. } => {
                Some(*id)
            }
            Envelope::Notif(_) => None,
        }
    }

    /// Variant tag as it appears on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::Req { .. } => "Req",
            Envelope::Resp { .. } => "Resp",
            Envelope::Error { .. } => "Error",
            Envelope::Notif(_) => "Notif",
        }
    }

    /// Serialize to the JSON text sent in a single frame
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one inbound text frame
pub fn decode(text: &str) -> Result<Envelope, WireError> {
    let mut value: Value = serde_json::from_str(text)?;

    // Unwrap at most one forwarding layer
    if let Value::Object(map) = &mut value {
        if map.len() == 1 {
            if let Some(inner) = map.remove(FORWARD_TAG) {
                trace!("Unwrapping forwarded envelope");
                value = inner;
            }
        }
    }

    let map = match &value {
        Value::Object(map) => map,
        _ => return Err(WireError::NotObject),
    };
    let tag = match map.len() {
        0 => return Err(WireError::Empty),
        1 => map.keys().next().map(String::as_str).unwrap_or_default(),
        n => return Err(WireError::Ambiguous(n)),
    };
    if !VARIANT_TAGS.contains(&tag) {
        return Err(WireError::UnknownVariant(tag.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

/// Parse one inbound binary frame holding UTF-8 JSON text
pub fn decode_bytes(data: &[u8]) -> Result<Envelope, WireError> {
    let text = std::str::from_utf8(data).map_err(|_| WireError::NotText)?;
    decode(text)
}
