//! Shared types for the Tau GitLab issue ⇄ Matrix room bridge.
//!
//! This crate holds the synchronous building blocks consumed by
//! `tau-gitlab-issues-runtime`: the comment de-duplication ledger, persisted
//! connection state, GitLab webhook payload models, Matrix event models, and
//! room/body rendering helpers.

pub mod comment_ledger;
pub mod gitlab_webhook_types;
pub mod issue_connection_state;
pub mod issue_room_render;
pub mod matrix_event_types;

pub use comment_ledger::*;
pub use gitlab_webhook_types::*;
pub use issue_connection_state::*;
pub use issue_room_render::*;
pub use matrix_event_types::*;
