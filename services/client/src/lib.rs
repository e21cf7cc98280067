//! Sitegen Client Library Crate
//!
//! This library contains the client-side session layer for the generation
//! service: the reconnecting channel, request/response correlation, room
//! presence, the per-project generation lifecycle and the fallback path used
//! while the channel is down. The `sitegen` binary is a thin driver around it.

pub mod config;
pub mod error;
pub mod generation;
pub mod rooms;
pub mod studio;
pub mod ws;
