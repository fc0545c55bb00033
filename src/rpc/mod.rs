//! Client/server RPC framing: the line-oriented request/response envelope
//! and the polymorphic operation family speaking it.

mod envelope;
mod ops;
mod properties;

pub use envelope::{
    add_default_request_headers, content_checksum, parse_request,
    parse_response, RequestWriter, CLIENT_PROTO_VERSION,
};
pub use ops::{
    Buffer, ChunkAccessInfo, IdempotentInfo, MetaOp, OpCode, OpRequest,
    REQ_ID_NONE,
};
pub use properties::Properties;
