//! Keel Core
//!
//! Core types and abstractions for the Keel job scheduling engine.
//!
//! This crate contains:
//! - Domain types: Core business entities (JobSpec, JobRecord, Bid, etc.)
//! - DTOs: Wire projections and request bodies for the client-facing layer

pub mod domain;
pub mod dto;
