//! View-change agreement for the Bulwark checkpoint core.
//!
//! When leadership changes, replicas must agree on which state follows the
//! last agreed sequence number. Each replica contributes the chain of
//! (digest, history digest) pairs it has seen; [`AgreementTree`] merges the
//! chains and reports the path certified by a [`QuorumPolicy`] threshold.
//!
//! # Terminology
//!
//! - **Candidate**: a (state digest, history digest) pair at one sequence
//!   number.
//! - **Support**: the set of replicas asserting a candidate. Bits are set,
//!   never cleared.
//! - **Weak / strong quorum**: `f + 1` and `2f + 1` supporters in a cluster
//!   of `3f + 1` replicas.

mod agreement;

pub use agreement::{AgreementNode, AgreementTree, NodeIndex, Quorum, QuorumPolicy};
