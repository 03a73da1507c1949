//! Distributed NAT leases.
//!
//! A binding is two cache entries written by whichever agent first sees
//! the flow:
//!
//! ```text
//! <prefix>:fwd:<flow>                    -> NatBinding
//! <prefix>:rev:<proto>:<addr>:<port>     -> ReverseEntry { flow, reserved_at }
//! ```
//!
//! The reverse entry is the slot reservation and is always written first
//! with a conditional put, so two flows can never hold the same slot. The
//! forward entry is then written conditionally too; the agent that loses
//! that race gives its slot back and adopts the winner's binding. Both
//! entries carry the lease TTL and expire on their own unless refreshed.

mod manager;
mod types;

pub use manager::NatLeaseManager;
pub use types::{NatBinding, NatPool, ReverseEntry};
