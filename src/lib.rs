//! Tollgate - Admission Control Service
//!
//! This crate implements named, fixed-window rate limiters with a penalty
//! block. Budgets are shared across processes through Redis when it is
//! configured and enforced per process otherwise. Decisions are exposed as
//! tower middleware, a framework hook, HTTP check endpoints and Envoy's global
//! rate limiting API.

pub mod adapter;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod ratelimit;
pub mod store;
