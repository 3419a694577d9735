//! A concurrent, ordered key-value map backed by a red-black tree.
//!
//! Writers coordinate through per-node writer flags acquired by CAS on a
//! bounded "local area" of neighboring nodes, reserve pending rebalancing
//! paths with ancestor markers, and readers traverse under per-node reader
//! counts. Detached nodes are reclaimed with epoch-based reclamation
//! ([`crossbeam_epoch`]), so every operation takes a pinned [`Guard`].
//!
//! Based on the locking discipline of:
//!
//! - Ma J. Lock-Free Insertions on Red-Black Trees. Master's thesis,
//!   University of Manitoba, 2003.
//! - Kim J. H., Cameron H., Graham P. Lock-free red-black trees using CAS.
//!   Concurrency and Computation: Practice and Experience, 2006.
//!
//! [`Guard`]: crossbeam_epoch::Guard

pub mod concurrent_map;
pub mod rbtree;

pub use self::concurrent_map::ConcurrentMap;
pub use self::rbtree::{CheckError, RBTree};
