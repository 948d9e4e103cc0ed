//! Foundational primitives shared across coda crates.
//!
//! Provides the error taxonomy every component reports failures through,
//! the cooperative cancellation token threaded from the CLI into tool calls,
//! opaque id generation, and atomic-write / time helpers.

pub mod atomic_io;
pub mod cancellation;
pub mod errors;
pub mod ids;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use cancellation::CancellationToken;
pub use errors::{code_of, is_code, BoxError, CodaError, CodaResult, ErrorCode, ResultExt};
pub use ids::generate_id;
pub use time_utils::current_unix_timestamp_ms;
