//! Side-effecting modules: filesystem, processes, HTTP, templates.
//!
//! Everything that touches the outside world lives here so the `core`
//! modules stay pure and the driver can be tested against fakes.

pub mod config;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod transcript;
