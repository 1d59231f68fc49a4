// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// core/  - event model, commit codec, pagination cursor
// store/ - store contracts, replay protocol, ScyllaDB and in-memory backends
//
// ============================================================================

pub mod core;
pub mod store;

pub use self::core::*;
pub use self::store::*;
