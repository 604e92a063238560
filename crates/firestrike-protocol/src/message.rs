//! Request and response messages
//!
//! Every exchange is one request and one response. On the wire both are
//! JSON objects discriminated by a `type` field; responses additionally
//! carry a `status`. Decoding goes through a flat record of optional
//! fields and is then validated into the closed enums below, so a missing
//! or mistyped field is reported by name instead of surfacing later in a
//! handler.
//!
//! `store` requests and `found` responses announce an object payload in
//! their `length` field. The payload itself is not part of the JSON; it
//! follows the header frame as exactly `length` raw bytes.

use firestrike_crypto::{ContentId, Salt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::types::{base64_opt, ErrorCode, PeerInfo, Status};

/// Request type names understood by this protocol version
pub const REQUEST_TYPES: [&str; 4] = ["ping", "store", "find", "get_peers"];

/// Response type names understood by this protocol version
pub const RESPONSE_TYPES: [&str; 5] = [
    "pong",
    "store_response",
    "find_response",
    "peers_response",
    "error",
];

/// An inbound or outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Liveness check; also introduces the sender to the responder
    Ping { sender: String, public_key: String },

    /// Ask the responder to keep an object
    Store {
        hash: ContentId,
        salt: Salt,
        sender: String,
        /// Plaintext size, when the sender knows it
        size: Option<u64>,
        /// Payload bytes following the header
        length: u64,
    },

    /// Look up an object by content id
    Find { hash: ContentId },

    /// Ask for the responder's peer directory
    GetPeers { sender: String },
}

/// A response to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong {
        address: String,
        public_key: String,
    },
    Stored {
        hash: ContentId,
    },
    Found {
        hash: ContentId,
        salt: Salt,
        size: Option<u64>,
        /// Payload bytes following the header
        length: u64,
    },
    NotFound {
        hash: ContentId,
        /// Addresses believed to hold the object
        peers: Vec<String>,
    },
    Peers {
        peers: Vec<PeerInfo>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RequestRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    salt: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseRecord {
    #[serde(rename = "type")]
    kind: String,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    salt: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ResponseRecord {
    fn new(kind: &str, status: Status) -> Self {
        ResponseRecord {
            kind: kind.to_string(),
            status,
            address: None,
            public_key: None,
            hash: None,
            salt: None,
            size: None,
            length: None,
            peers: None,
            code: None,
            message: None,
        }
    }
}

fn require<T>(field: Option<T>, name: &'static str) -> Result<T> {
    field.ok_or(ProtocolError::MissingField(name))
}

fn parse_hash(hex: String) -> Result<ContentId> {
    ContentId::from_hex(&hex).map_err(|e| ProtocolError::Malformed(format!("hash: {}", e)))
}

fn parse_salt(bytes: Vec<u8>) -> Result<Salt> {
    Salt::from_slice(&bytes).ok_or_else(|| {
        ProtocolError::Malformed(format!("salt must be 32 bytes, got {}", bytes.len()))
    })
}

/// Parse a JSON object and pull out its `type` discriminator
fn parse_typed(bytes: &[u8], known: &[&str]) -> Result<(String, Value)> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if !value.is_object() {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    }

    let kind = match value.get("type") {
        None => return Err(ProtocolError::MissingField("type")),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ProtocolError::Malformed("type must be a string".to_string())),
    };

    if !known.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    Ok((kind, value))
}

impl Request {
    /// Wire name of this request's type
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::Store { .. } => "store",
            Request::Find { .. } => "find",
            Request::GetPeers { .. } => "get_peers",
        }
    }

    /// Number of raw payload bytes that follow this request's header
    pub fn payload_length(&self) -> u64 {
        match self {
            Request::Store { length, .. } => *length,
            _ => 0,
        }
    }

    /// Serialize to a JSON body
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut record = RequestRecord {
            kind: self.kind().to_string(),
            ..Default::default()
        };

        match self {
            Request::Ping { sender, public_key } => {
                record.sender = Some(sender.clone());
                record.public_key = Some(public_key.clone());
            }
            Request::Store {
                hash,
                salt,
                sender,
                size,
                length,
            } => {
                record.hash = Some(hash.to_hex());
                record.salt = Some(salt.as_bytes().to_vec());
                record.sender = Some(sender.clone());
                record.size = *size;
                record.length = Some(*length);
            }
            Request::Find { hash } => {
                record.hash = Some(hash.to_hex());
            }
            Request::GetPeers { sender } => {
                record.sender = Some(sender.clone());
            }
        }

        Ok(serde_json::to_vec(&record)?)
    }

    /// Decode and validate a JSON body
    ///
    /// An unrecognised `type` is reported as [`ProtocolError::UnknownType`]
    /// before any other field is looked at.
    pub fn decode(bytes: &[u8]) -> Result<Request> {
        let (kind, value) = parse_typed(bytes, &REQUEST_TYPES)?;
        let record: RequestRecord =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let request = match kind.as_str() {
            "ping" => Request::Ping {
                sender: require(record.sender, "sender")?,
                public_key: require(record.public_key, "public_key")?,
            },
            "store" => Request::Store {
                hash: parse_hash(require(record.hash, "hash")?)?,
                salt: parse_salt(require(record.salt, "salt")?)?,
                sender: require(record.sender, "sender")?,
                size: record.size,
                length: require(record.length, "length")?,
            },
            "find" => Request::Find {
                hash: parse_hash(require(record.hash, "hash")?)?,
            },
            "get_peers" => Request::GetPeers {
                sender: require(record.sender, "sender")?,
            },
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        Ok(request)
    }
}

impl Response {
    /// Build an error response from a protocol failure
    pub fn from_error(err: &ProtocolError) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Wire name of this response's type
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Pong { .. } => "pong",
            Response::Stored { .. } => "store_response",
            Response::Found { .. } | Response::NotFound { .. } => "find_response",
            Response::Peers { .. } => "peers_response",
            Response::Error { .. } => "error",
        }
    }

    /// Number of raw payload bytes that follow this response's header
    pub fn payload_length(&self) -> u64 {
        match self {
            Response::Found { length, .. } => *length,
            _ => 0,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Pong { .. } | Response::Stored { .. } | Response::Peers { .. } => Status::Ok,
            Response::Found { .. } => Status::Found,
            Response::NotFound { .. } => Status::NotFound,
            Response::Error { .. } => Status::Error,
        }
    }

    /// Serialize to a JSON body
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut record = ResponseRecord::new(self.kind(), self.status());

        match self {
            Response::Pong {
                address,
                public_key,
            } => {
                record.address = Some(address.clone());
                record.public_key = Some(public_key.clone());
            }
            Response::Stored { hash } => {
                record.hash = Some(hash.to_hex());
            }
            Response::Found {
                hash,
                salt,
                size,
                length,
            } => {
                record.hash = Some(hash.to_hex());
                record.salt = Some(salt.as_bytes().to_vec());
                record.size = *size;
                record.length = Some(*length);
            }
            Response::NotFound { hash, peers } => {
                record.hash = Some(hash.to_hex());
                record.peers = Some(serde_json::to_value(peers)?);
            }
            Response::Peers { peers } => {
                record.peers = Some(serde_json::to_value(peers)?);
            }
            Response::Error { code, message } => {
                record.code = Some(*code);
                record.message = Some(message.clone());
            }
        }

        Ok(serde_json::to_vec(&record)?)
    }

    /// Decode and validate a JSON body
    pub fn decode(bytes: &[u8]) -> Result<Response> {
        let (kind, value) = parse_typed(bytes, &RESPONSE_TYPES)?;
        let record: ResponseRecord =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let response = match (kind.as_str(), record.status) {
            ("pong", Status::Ok) => Response::Pong {
                address: require(record.address, "address")?,
                public_key: require(record.public_key, "public_key")?,
            },
            ("store_response", Status::Ok) => Response::Stored {
                hash: parse_hash(require(record.hash, "hash")?)?,
            },
            ("find_response", Status::Found) => Response::Found {
                hash: parse_hash(require(record.hash, "hash")?)?,
                salt: parse_salt(require(record.salt, "salt")?)?,
                size: record.size,
                length: require(record.length, "length")?,
            },
            ("find_response", Status::NotFound) => {
                let peers = match record.peers {
                    Some(v) => serde_json::from_value(v)
                        .map_err(|e| ProtocolError::Malformed(format!("peers: {}", e)))?,
                    None => Vec::new(),
                };
                Response::NotFound {
                    hash: parse_hash(require(record.hash, "hash")?)?,
                    peers,
                }
            }
            ("peers_response", Status::Ok) => {
                let peers = serde_json::from_value(require(record.peers, "peers")?)
                    .map_err(|e| ProtocolError::Malformed(format!("peers: {}", e)))?;
                Response::Peers { peers }
            }
            // Any response type may come back as an error
            (_, Status::Error) => Response::Error {
                code: record.code.unwrap_or(ErrorCode::Internal),
                message: record.message.unwrap_or_default(),
            },
            (kind, status) => {
                return Err(ProtocolError::Malformed(format!(
                    "status {:?} is not valid for {}",
                    status, kind
                )))
            }
        };

        Ok(response)
    }
}
