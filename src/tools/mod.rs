//! Tool executor contract.
//!
//! Concrete tools (filesystem, shell, sandbox back-ends) are external
//! collaborators; the crate defines the trait they implement and the
//! validation applied before every invocation.

pub mod tool;
pub mod validation;

pub use tool::{FnTool, Tool, ToolOutput, ToolUpdateFn};
pub use validation::validate_arguments;
