//! Small, self-contained helpers shared across modules.

pub mod http;
