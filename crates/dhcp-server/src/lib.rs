//! Binding DHCPv4 server
//!
//! Answers DISCOVER/REQUEST only for MAC addresses bound in the
//! [`LeaseTable`]; there is no dynamic pool. Addresses are assigned by the
//! controller at reconcile time and the server just reflects them.
//!
//! - [`lease`]: MAC → lease table shared by the reconciler and the server
//! - [`handler`]: pure request → reply construction
//! - [`server`]: per-interface UDP/67 listeners and their registry

pub mod error;
pub mod handler;
pub mod lease;
pub mod server;

pub use error::DhcpError;
pub use handler::{build_reply, reply_target};
pub use lease::{DhcpLease, LeaseTable};
pub use server::{DhcpServer, DhcpServerSet};
