//! Control-channel protocol for the haxorport client
//!
//! Every frame exchanged with the broker is a JSON text message carrying an
//! [`Envelope`]: a tag, a protocol version, a millisecond timestamp, and an
//! opaque payload. This crate defines the envelope, the payload shapes for
//! every known tag, and the codec that moves them on and off the wire.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, to_text, CodecError};
pub use messages::{
    AuthPayload, DataPayload, Envelope, ErrorPayload, HeaderMap, HttpRequestData,
    HttpRequestPayload, HttpResponseData, HttpResponsePayload, MessageType, RegisterPayload,
    RegisterResponsePayload, TunnelAuth, TunnelType, UnregisterPayload, PROTOCOL_VERSION,
};
