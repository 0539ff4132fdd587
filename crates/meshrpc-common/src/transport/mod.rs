//! MeshRPC Transport Layer
//!
//! This module provides the wire contract used by the connection multiplexer
//! and a reference TCP channel.
//!
//! # Components
//!
//! - **[`MessageCodec`]** / **[`JsonCodec`]**: encode/decode invocation messages
//! - **[`MessageSender`]** / **[`InboundHandler`]**: the two halves of a logical channel
//! - **[`TcpChannel`]**: length-prefixed TCP channel with a background reader
//!
//! # Wire Format
//!
//! `[4-byte length prefix as u32 big-endian] + [payload]`, payloads capped at
//! 100 MB by default.

pub mod channel;
pub mod codec;
pub mod tcp;

pub use channel::{InboundHandler, MessageSender};
pub use codec::{JsonCodec, MessageCodec};
pub use tcp::{read_frame, write_frame, TcpChannel, TcpChannelConfig, MAX_MESSAGE_SIZE};
