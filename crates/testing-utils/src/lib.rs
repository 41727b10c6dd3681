//! # Job Queue Testing Utils
//!
//! Shared testing utilities for the job queue workspace: repository and
//! transaction runtime doubles with failure injection, entity builders and
//! instrumented process sections.
//!
//! ```toml
//! [dev-dependencies]
//! jobqueue-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
