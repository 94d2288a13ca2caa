//! CRD field parsing errors

use thiserror::Error;

/// Errors raised while interpreting CRD fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrdError {
    /// CIDR could not be parsed as an IPv4 network
    #[error("invalid cidr {0}")]
    InvalidCidr(String),

    /// CIDR has host bits set
    #[error("cidr {0} is not a network address (host bits set)")]
    HostBitsSet(String),

    /// Address could not be parsed as IPv4
    #[error("invalid ipv4 address {field}: {value}")]
    InvalidAddress {
        /// Field the value came from
        field: &'static str,
        /// Raw value
        value: String,
    },

    /// Network name is not of the form `namespace/name` or `name`
    #[error("invalid network name {0}")]
    InvalidNetworkName(String),
}
