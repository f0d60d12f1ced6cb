//! Runtime module for loading and invoking connectors
//!
//! - [`ConnectorModule`] / [`ModuleFactory`]: the capability-checked contract
//!   a loaded connector satisfies, and the seam that produces one
//! - [`WasmModuleFactory`]: loads `main.wasm` entry files with Extism
//! - [`ConnectorLoader`]: resolves, caches and invokes connectors, isolating
//!   the engine from anything they do
//! - [`normalize`]: schema-driven coercion of properties and settings

pub mod loader;
pub mod module;
pub mod normalize;
pub mod wasm;

pub use loader::{ConnectorLoader, HandleKey};
pub use module::{Capability, ConnectorModule, ModuleFactory};
pub use wasm::WasmModuleFactory;
