//! # Stalk Work-Queue Client
//!
//! Purpose: Provide a synchronous client for a beanstalk-style work queue,
//! with request pipelining, transparent recovery from dropped connections and
//! a thread-safe connection pool.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Borrowed Handles**: `Tube` and `TubeSet` are short-lived views over a
//!    `Conn`, so tube state never outlives the connection it describes.
//! 3. **Minimal Allocation**: Reuse buffers for command framing and parsing.
//! 4. **Typed Failures**: Server status keywords surface as `Status` values.

mod conn;
mod error;
mod pool;
mod resp;
mod tube;
mod tubeset;

pub use conn::{Conn, ConnConfig, Request, Stream, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY};
pub use error::{StalkError, StalkResult};
pub use pool::{JobConn, LeasedConn, Pool, PoolBuilder, PoolConfig};
pub use resp::{Expect, Job, Reply};
pub use stalk_common::{Arg, NameError, Status, TubeName, DEFAULT_TUBE, MAX_TUBE_NAME_LEN};
pub use tube::Tube;
pub use tubeset::TubeSet;
