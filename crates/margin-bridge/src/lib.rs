//! Margin Bridge - native-messaging framing
//!
//! Browser extensions talk to native hosts with length-prefixed JSON frames.
//! This crate provides the frame codec and a transport built on it.

pub mod codec;
pub mod error;
pub mod transport;

pub use codec::{DEFAULT_MAX_FRAME_LEN, NativeMessageCodec};
pub use error::{BridgeError, Result};
pub use transport::{FramedTransport, Transport};
