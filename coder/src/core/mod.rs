//! Deterministic, pure logic shared by the engine.
//!
//! Core modules are free of filesystem and network side effects. They operate
//! on in-memory data and return deterministic outputs suitable for tests.

pub mod accumulator;
pub mod budget;
pub mod lenient;
pub mod parser;
pub mod session;
pub mod types;
