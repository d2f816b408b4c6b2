//! Data models for signaling
//!
//! This module contains the core data structures shared by the relay and the
//! negotiation client: wire messages, session membership, negotiation phases
//! and media handles.

pub mod media;
pub mod message;
pub mod negotiation;
pub mod session;
