//! DHCP server errors

use thiserror::Error;

/// Errors raised by the lease table and the packet server.
#[derive(Debug, Error)]
pub enum DhcpError {
    /// A lease is already bound to this MAC
    #[error("lease for {0} already exists")]
    AlreadyExists(String),

    /// No lease bound to this MAC
    #[error("lease for {0} not found")]
    NotFound(String),

    /// MAC is empty or not a 48-bit EUI
    #[error("invalid mac address {0:?}")]
    InvalidMac(String),

    /// Pool options cannot be turned into a lease
    #[error("invalid pool options: {0}")]
    InvalidPool(String),

    /// A server is already running on this interface
    #[error("dhcp server already running on interface {0}")]
    InterfaceInUse(String),

    /// Socket could not be bound
    #[error("failed to bind dhcp socket on {nic}: {source}")]
    Bind {
        /// Interface name
        nic: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Socket IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound packet could not be parsed
    #[error("decode error: {0}")]
    Decode(#[from] dhcproto::error::DecodeError),

    /// Reply could not be serialized
    #[error("encode error: {0}")]
    Encode(#[from] dhcproto::error::EncodeError),
}
