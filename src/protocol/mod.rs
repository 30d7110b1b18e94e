//! Client-server wire protocol.
//!
//! This module defines how a client talks to a tether server: the connection handshake, the
//! chunked framing that carries messages, the request messages a client may send and the
//! responses the server writes back.
//!
//! # Overview
//!
//! A connection begins with a handshake. The client sends the magic preamble followed by
//! four version proposals; the server answers with the version it picked (or zero, closing
//! the connection when nothing matches). From then on both sides exchange PackStream
//! structs, one message per frame.
//!
//! # Binary Format
//!
//! - Handshake: `60 60 B0 17`, then four big-endian `u32` proposals laid out as
//!   `[0, range, minor, major]`. A proposal covers `major.minor` down to
//!   `major.(minor - range)`.
//! - Frames: a message is split into chunks, each prefixed with its `u16` big-endian length,
//!   and terminated by an empty chunk.
//! - Messages: a PackStream struct whose tag identifies the message kind. Tags are looked up
//!   in the [`SignatureTable`] of the negotiated version.
//!
//! # Key Components
//!
//! - [`MessageDecoder`]: turns a frame into a [`RequestMessage`](message::RequestMessage).
//! - [`Response`]: SUCCESS, RECORD, IGNORED and FAILURE messages.
//! - [`ProtocolTransport`]: handshake and framing over any `Read + Write` stream.
//! - [`TetherServer`]: accept loop handing connections to a worker pool.
//!
//! # See Also
//!
//! - [`runtime`](crate::runtime): the session state machine every decoded request is fed to.
use std::fmt;

mod decoder;
pub mod message;
mod response;
mod server;
mod thread;
mod transport;

use thread::ThreadPool;

pub use decoder::{DecodeError, MessageDecoder, SignatureTable};
pub use response::{FAILURE, IGNORED, Metadata, RECORD, Response, SUCCESS};
pub use server::{ServerError, ShutdownHandle, TetherServer};
pub use transport::{MAGIC, MAX_MESSAGE_SIZE, ProtocolTransport, TransportError};

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Handshake encoding: `[0, 0, minor, major]`.
    pub fn encode(self) -> u32 {
        (u32::from(self.minor) << 8) | u32::from(self.major)
    }

    pub fn decode(value: u32) -> Self {
        Self {
            major: (value & 0xFF) as u8,
            minor: ((value >> 8) & 0xFF) as u8,
        }
    }

    /// Version chosen by a server's handshake reply; zero means none was acceptable.
    pub fn negotiated(reply: u32) -> Option<Self> {
        (reply != 0).then(|| Self::decode(reply))
    }

    /// Whether a handshake proposal covers this version.
    pub fn matches(self, proposal: u32) -> bool {
        let proposed = Self::decode(proposal);
        let range = ((proposal >> 16) & 0xFF) as u8;
        proposed.major == self.major
            && self.minor <= proposed.minor
            && self.minor >= proposed.minor.saturating_sub(range)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_encoding() {
        let version = ProtocolVersion::new(4, 3);

        assert_eq!(version.encode(), 0x0000_0304);
        assert_eq!(ProtocolVersion::decode(0x0000_0304), version);
        assert_eq!(version.to_string(), "4.3");
    }

    #[test]
    fn version_ranges() {
        let inputs = vec![
            (ProtocolVersion::new(4, 4), 0x0000_0404, true),
            (ProtocolVersion::new(4, 2), 0x0002_0404, true),
            (ProtocolVersion::new(4, 1), 0x0002_0404, false),
            (ProtocolVersion::new(4, 0), 0x0000_0003, false),
            (ProtocolVersion::new(4, 0), 0x0000_0000, false),
        ];

        for (version, proposal, expected) in inputs {
            assert_eq!(version.matches(proposal), expected, "{version} / {proposal:#010x}");
        }
    }
}
