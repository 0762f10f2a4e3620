//! # Time Capsule Gateway
//! HTTP surface over the capsule service and the reconciliation sweep.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
