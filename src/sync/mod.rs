// Convergence driver - debounces sync requests, serializes the
// reconcilers, heals drift on a timer, and tracks liveness.

pub mod engine;
pub mod error;
pub mod health;

pub use engine::{SyncEngine, SyncPeriods, SyncTrigger};
pub use error::EngineError;
pub use health::SyncHealth;
