//! HTTP layer for the metadata caching proxy.
//!
//! This module provides the axum-based front door: it classifies every
//! incoming request as a health probe, a passthrough, or a metadata GET,
//! serves cache hits directly, and tees misses to the client while a copy
//! is buffered for the asynchronous strip pipeline.

pub mod handler;
