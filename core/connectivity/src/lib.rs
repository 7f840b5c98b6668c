//! Reachability monitoring for the Driftwood engine.
//!
//! The [`ConnectionMonitor`] combines host link signals with a periodic
//! backend reachability probe and publishes debounced online/offline
//! transitions. Everything else in the engine gates on it.

pub mod debounce;
pub mod monitor;
pub mod probe;
pub mod state;

pub use debounce::Debouncer;
pub use monitor::{ConnectionMonitor, MonitorConfig};
pub use probe::{classify_rtt, HttpProbe, ReachabilityProbe};
pub use state::{ConnectionState, EffectiveType};
