//! Core domain types
//!
//! This module contains the core domain structures used across Keel services.
//! The orchestrator persists them; nodes and clients see them through the
//! DTOs in [`crate::dto`].

pub mod bid;
pub mod job;
pub mod node;
pub mod result;

/// Identifier assigned to every job at submission
pub type JobId = uuid::Uuid;

/// Identifier advertised by an executor node
pub type NodeId = String;
