//! Deterministic simulation for the Bulwark replica core.
//!
//! Provides in-memory stand-ins for every collaborator of a replica and a
//! runner that wires several real replicas together:
//!
//! - [`SimStorage`]: named byte ranges in memory, with injectable failures
//! - [`CounterApp`]: a deterministic counter whose state digest covers every
//!   executed command and its request info
//! - [`LoopbackTransport`] and [`SimulatedNetwork`]: fragment traffic with
//!   seeded loss, duplication, corruption and reordering
//! - [`RecordingOrdering`]: records every signal the core sends
//! - [`Workload`]: seeded ordered-batch generator
//!
//! # Determinism
//!
//! Network decisions and workloads are driven by `ChaCha8Rng` seeded from
//! the test. Task scheduling is not, so tests assert on converged state
//! rather than on interleavings.

mod app;
mod network;
mod ordering;
mod runner;
mod storage;
mod workload;

pub use app::{CounterApp, CounterState};
pub use network::{LoopbackTransport, NetworkConfig, NetworkStats, SimulatedNetwork};
pub use ordering::{OrderingSignal, RecordingOrdering};
pub use runner::{SimNode, SimulationError, SimulationRunner, SimulationStats};
pub use storage::SimStorage;
pub use workload::Workload;
