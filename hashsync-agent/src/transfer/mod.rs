//! Transfer plumbing: progress aggregation, checked body streams and bounded
//! remote operations.

pub mod digest_stream;
pub mod progress;
pub mod retry;
