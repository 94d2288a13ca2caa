//! In-memory IPAM
//!
//! Per-network address bookkeeping owned by the controller process:
//! - [`IpAllocator`]: subnet arithmetic and the allocation map
//! - [`CacheAllocator`]: MAC → IP index used to recover assignments
//!
//! Both are process-wide and rebuilt from cluster state at startup.
//! Every public operation takes the structure's single mutex; none suspend.

pub mod allocator;
pub mod cache;
pub mod error;

pub use allocator::IpAllocator;
pub use cache::CacheAllocator;
pub use error::IpamError;
