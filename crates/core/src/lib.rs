//! Sitegen Core
//!
//! Transport-free domain logic for the generation client: conversation
//! models, the per-project generation lifecycle, the conversation history
//! cache and the collaborator traits used to reach the service without the
//! persistent channel.

pub mod fallback;
pub mod history;
pub mod history_source;
pub mod models;
pub mod session;
