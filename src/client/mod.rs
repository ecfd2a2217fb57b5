//! Outbound side of the peer fabric: one long-lived connection per
//! peer, shared by every address routed to that peer.

pub(crate) mod holder;
