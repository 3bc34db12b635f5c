// stalk-common - Shared types and protocol definitions for the stalk client
//
// This crate defines tube names, status keywords and command framing for the
// text work-queue protocol.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
