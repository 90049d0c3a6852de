//! Process twin: stochastic model, state store, simulation and loop control.
//!
//! ## Architecture
//!
//! - `stochastic`: mean-reverting drift steps over `rand_distr` standard normals
//! - `state`: `TwinState`, the owned aggregate of batches and equipment
//! - `simulation`: `TwinSimulation::tick()` and snapshot subscriptions
//! - `ticker`: `TickSource` scheduler abstraction (interval or manual)
//! - `runner`: `TwinLoop` start/stop/speed control over a tokio task

pub mod runner;
pub mod simulation;
pub mod state;
pub mod stochastic;
pub mod ticker;

use thiserror::Error;

pub use runner::{LoopOptions, SharedTwin, TwinLoop};
pub use simulation::{SnapshotListener, SubscriptionId, TickReport, TwinSimulation};
pub use state::TwinState;
pub use ticker::{IntervalTicker, ManualTicker, TickHandle, TickSource};

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("Invalid probability for {0}: {1}")]
    InvalidProbability(&'static str, String),

    #[error("Simulated seconds per tick must be finite and > 0 (got {0})")]
    InvalidSpeed(f64),

    #[error("Monitor sampling interval must be finite and > 0 (got {0})")]
    InvalidSamplingInterval(f64),

    #[error("Tick interval must be > 0 ms")]
    InvalidTickInterval,

    #[error("Twin loop is already running")]
    AlreadyRunning,

    #[error("Twin state lock poisoned")]
    Poisoned,
}
