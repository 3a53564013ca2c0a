#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate implements the client side of the remote printer control
//! service protocol: message packing, response unpacking, and a resilient
//! request/response transport with connect backoff and health tracking.

pub mod codes;
mod message;
mod sink;
mod transport;
mod unpack;

pub use message::{Ack, Login, MessageKind, Packed, Request};
pub use sink::{ErrorSink, Severity};
pub use transport::{Transport, TransportConfig};
pub use unpack::{unpack, CommandReply, ServerError};

/// Protocol-level failures. These never escape the [Transport]; they are
/// converted into error reports on its [ErrorSink].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The message kind is not one this protocol knows how to pack.
    #[error("no such target for packaging: {0}")]
    UnknownKind(String),

    /// The fields provided for a known kind did not fit its shape.
    #[error("bad fields for {kind}: {source}")]
    BadFields {
        /// Kind being packed.
        kind: MessageKind,
        /// Underlying decode failure.
        source: serde_json::Error,
    },

    /// The response body was not valid JSON.
    #[error("received data is not valid json: {0}")]
    InvalidJson(String),

    /// The response body was JSON, but neither an object nor an array.
    #[error("received json is not an object: {0}")]
    NotAnObject(String),
}
