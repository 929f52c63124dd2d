//! Floodgate - Distributed Request Admission Control
//!
//! This crate decides, per request, whether an HTTP call may proceed based
//! on how many requests the same client made to the same scope within a
//! time window. Counters live in a shared store (Redis in production) so
//! every server instance enforces one budget, and admission is exposed as
//! tower layers for axum routers.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod server;
pub mod store;
