//! Membership service: SWIM failure detection and gossip dissemination
//!
//! A single actor owns the member table; peers exchange probe/ack/join
//! traffic with piggybacked state claims, resolved by incarnation
//! number. Other components consume read-only view snapshots and
//! liveness events.

pub mod gossip;
pub mod member;
pub mod swim;
pub mod table;

pub use member::{Member, MemberState, MemberUpdate, MembershipEvent, MembershipView};
pub use swim::Membership;
