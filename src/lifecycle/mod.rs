//! The `lifecycle` module wires a broker client, an emitter and the consume
//! loop together and exposes the single shutdown operation the host needs.

pub mod controller;

pub use controller::{LifecycleController, LifecycleOptions, ShutdownHandle, StopOutcome};
