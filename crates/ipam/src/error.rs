//! IPAM errors

use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors raised by [`crate::IpAllocator`] and [`crate::CacheAllocator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// Address is outside the subnet or is its broadcast address
    #[error("ip {0} is out of range")]
    OutOfRange(Ipv4Addr),

    /// Requested address is already allocated or revoked
    #[error("ip {0} is unavailable")]
    Unavailable(Ipv4Addr),

    /// No free address left in the pool range
    #[error("no more ip addresses available in subnet {0}")]
    Exhausted(String),

    /// CIDR could not be parsed
    #[error("invalid cidr {0}")]
    InvalidCidr(String),

    /// Pool range is not usable within the CIDR
    #[error("invalid range {start}-{end}: {reason}")]
    InvalidRange {
        /// Range start
        start: Ipv4Addr,
        /// Range end
        end: Ipv4Addr,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Release of an address that is not allocated
    #[error("ip {0} is not allocated")]
    NotAllocated(Ipv4Addr),

    /// Unknown subnet
    #[error("subnet {0} not found")]
    SubnetNotFound(String),

    /// MAC already indexed in the MAC set
    #[error("mac {0} already exists")]
    MacAlreadyExists(String),

    /// MAC not indexed in the MAC set
    #[error("mac {0} not found")]
    MacNotFound(String),

    /// Unknown MAC set
    #[error("mac set {0} not found")]
    MacSetNotFound(String),
}
