//! Integration tests: whole passes and sweeps against an in-memory
//! marketplace.

mod mock_market;
mod pipeline;
