//! Core data types shared by the optical-flow crates.

pub mod error;
pub mod field;
pub mod runtime;

pub use error::*;
pub use field::*;
pub use runtime::*;
