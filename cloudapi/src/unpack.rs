use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// Parse a response body. An empty body and a JSON array both mean "no
/// command" and unpack to an empty object.
pub fn unpack(body: &[u8]) -> Result<Map<String, Value>, Error> {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Array(_)) => Ok(Map::new()),
        Ok(other) => Err(Error::NotAnObject(other.to_string())),
        Err(_) => Err(Error::InvalidJson(text.into_owned())),
    }
}

/// Error object the server may attach to any reply.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerError {
    /// Server-side error code.
    pub code: Option<i64>,
    /// Human readable message.
    pub message: Option<String>,
}

/// Reply to a status poll: either empty, or a single command.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CommandReply {
    /// Command name.
    pub command: Option<String>,
    /// Sequence number of the command. Kept loose so a malformed number can
    /// be reported instead of failing the whole reply.
    pub number: Option<Value>,
    /// Inline payload, or a URL when `is_link` is set.
    pub payload: Option<Value>,
    /// The payload is a URL to be downloaded.
    #[serde(default)]
    pub is_link: bool,
    /// The linked payload is a zip archive.
    #[serde(default)]
    pub zip: bool,
    /// Job file name for linked payloads.
    pub filename: Option<String>,
    /// Server-side error, if any.
    pub error: Option<ServerError>,
}

impl CommandReply {
    /// Interpret an unpacked body as a command reply.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }

    /// The command number, if it is an integer.
    pub fn number(&self) -> Option<i64> {
        self.number.as_ref().and_then(Value::as_i64)
    }
}
