//! Shared data structures for the process twin
//!
//! - Batch: BatchState, CPP readings/bounds, timeline, product templates
//! - Equipment: EquipmentTelemetryState
//! - Snapshot: TwinSnapshot (immutable copy handed to subscribers)
//! - Prediction: Prediction, PredictionRecord (monitor ledger rows)
//! - Deviation: Deviation, AutomationSuggestion, ProposalEvent (detector output)

mod batch;
mod deviation;
mod equipment;
mod prediction;
mod snapshot;

pub use batch::*;
pub use deviation::*;
pub use equipment::*;
pub use prediction::*;
pub use snapshot::*;
