//! Loom Engine Library
//!
//! This library provides the core functionality of the Loom engine: the
//! connector runtime, the execution orchestrator, the workflow sequencer and
//! the storage they share. It is used by both the main binary and
//! integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Engine facade
pub mod engine;

/// Message bus for engine-to-UI events
pub mod message_bus;

/// Run-matrix dispatch and startup recovery
pub mod orchestrator;

/// Runtime module for loading and invoking connectors
pub mod runtime;

/// Workflow step sequencing
pub mod sequencer;

/// Telemetry and Observability
pub mod telemetry;

/// Prompt template expansion
pub mod template;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

pub use engine::Engine;
