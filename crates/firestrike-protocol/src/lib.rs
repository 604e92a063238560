//! FireStrike Protocol Module
//!
//! Defines the closed set of request/response messages exchanged between
//! nodes (`ping`, `store`, `find`, `get_peers`), their JSON encoding, and
//! the length-delimited framing and raw payload streaming used on a
//! connection.

pub mod error;
pub mod frame;
pub mod message;
pub mod types;

pub use error::{ProtocolError, Result};
pub use frame::{
    copy_payload, read_frame, read_request, read_response, write_frame, write_request,
    write_response, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_OBJECT_BYTES, PAYLOAD_CHUNK_SIZE,
};
pub use message::{Request, Response};
pub use types::{ErrorCode, PeerInfo, Status};
