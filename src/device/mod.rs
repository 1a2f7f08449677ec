//! The TUN-backed local endpoint and the iptables masquerade rules a
//! bridge keeps in sync with it.

pub mod rule;
pub mod veth;

pub use rule::RuleManager;
pub use veth::{PairVeth, TunVeth, Veth};
