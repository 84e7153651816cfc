//! Keel Orchestrator
//!
//! Job admission, matching and lifecycle engine.
//!
//! This crate contains:
//! - Repository: the job store (in-memory and Postgres) with its audit log
//! - Service: matcher, lifecycle coordinator, result reconciler, query service
//! - API: the HTTP layer in front of the coordinator and query service

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod repository;
pub mod service;

pub use config::OrchestratorConfig;
pub use error::{Result, SchedulerError};
