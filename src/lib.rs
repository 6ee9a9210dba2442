//! Tollgate - Persistent Token Bucket Rate Limiting
//!
//! This crate implements token bucket rate limiting whose state lives in
//! durable storage, so limits survive restarts and are shared by every
//! process that points at the same store. Buckets are tracked per opaque
//! identifier; what a token stands for is up to the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
