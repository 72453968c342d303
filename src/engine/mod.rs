//! The request lifecycle engine: capability cache, concurrency limiter,
//! and the synchronous / asynchronous advice paths.

pub mod capability;
pub mod limiter;
pub mod sync;
pub mod turn;
