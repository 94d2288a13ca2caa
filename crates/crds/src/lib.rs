//! VM DHCP CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the VM DHCP controller, agent
//! and webhook, plus the subsets of foreign resources (KubeVirt
//! `VirtualMachine`, Multus `NetworkAttachmentDefinition`) they read.

pub mod conditions;
pub mod error;
pub mod ip_pool;
pub mod labels;
pub mod network_attachment;
pub mod references;
pub mod time;
pub mod virtual_machine;
pub mod vm_network_config;

pub use conditions::*;
pub use error::*;
pub use ip_pool::*;
pub use network_attachment::*;
pub use references::*;
pub use virtual_machine::*;
pub use vm_network_config::*;
