//! Cross-worker coordination around the pool engine

pub mod gate;

pub use gate::{ImportedPoolRegistry, PoolEngineGate};
