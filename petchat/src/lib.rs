//! Real-time chat core for a pet-care marketplace.
//!
//! Talks STOMP over WebSocket to the backend broker, merges live pushes
//! with REST history into one deduplicated log per conversation, and runs
//! the adoption confirm/cancel flow with a durable local cache.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod location;
pub mod session;
pub mod storage;
pub mod transport;
