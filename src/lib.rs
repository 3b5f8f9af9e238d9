//! In-process HTTP response cache with an axum adapter.

pub mod cache;
pub mod config;
pub mod infra;
