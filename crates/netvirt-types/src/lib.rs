//! Value types shared by the netvirt control plane.
//!
//! - [`MacAddress`]: 48-bit Ethernet hardware address
//! - [`FlowKey`]: a single typed match field (in-port, L2, L3, L4, tunnel)
//! - [`FlowMatch`]: ordered sequence of flow keys identifying a flow
//!
//! `FlowMatch` equality is order-sensitive. Two matches holding the same
//! keys appended in a different order are different flows unless the
//! producer calls [`FlowMatch::canonical`] first.

mod flow;
mod mac;

pub use flow::{FlowKey, FlowKeyKind, FlowMatch};
pub use mac::MacAddress;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid flow key: {0}")]
    InvalidFlowKey(String),
}
