//! Request handlers for the control API.

mod collections;
mod sync;

pub use collections::*;
pub use sync::*;
