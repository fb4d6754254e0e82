// Application layer - use cases and orchestration.
// The service is the only mutation path to wallet balances; the CLI and
// any future API surface go through it.

pub mod error;
pub mod reporting;
pub mod service;

pub use error::*;
pub use reporting::*;
pub use service::*;
