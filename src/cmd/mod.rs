//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `project` | `Init`, `Status` |
//! | `serve`   | `Serve`          |

pub mod project;
pub mod serve;

pub use project::{cmd_init, cmd_status};
pub use serve::cmd_serve;
