//! Core types for the Bulwark checkpoint and recovery core.
//!
//! This crate provides the value types shared by every other crate:
//!
//! - **Primitives**: `Hash`, identifiers, the big-endian binary codec
//! - **State tokens**: digest-carrying descriptors of snapshot and log ranges
//! - **Manifests**: the token set describing a replica's durable state, and
//!   the full-versus-incremental diff between two of them
//! - **Batches**: ordered batches, read-only requests and log records
//! - **Support**: the per-replica bitfield used by view-change agreement
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod batch;
pub mod codec;
mod hash;
mod identifiers;
mod manifest;
mod support;
mod token;

pub use batch::{Entry, NonDeterminism, OrderedBatch, ReadOnlyRequest, RequestInfo};
pub use codec::CodecError;
pub use hash::{Hash, HexError};
pub use identifiers::{ClientId, ReplicaId, SeqNo};
pub use manifest::{CheckpointManifest, ManifestDiff, DEFAULT_PENDING_LOG_CEILING};
pub use support::SupportBitfield;
pub use token::{StateToken, TokenKind};
