//! One module per route group. `router.rs` wires these into the `Router`.

pub mod admin;
pub mod chat;
pub mod chat_sync;
pub mod conversations;
pub mod health;
pub mod preferences;
pub mod resume;
pub mod tools;
