//! # tether-core
//!
//! Foundation types for the Tether bridge server.
//!
//! This crate provides the shared vocabulary the other Tether crates depend on:
//!
//! - **Conversation ids**: [`ids::ConversationId`] as a validated newtype
//! - **Wire events**: [`events::ClientEvent`] (inbound) and
//!   [`events::ServerEvent`] (outbound), both tagged on `type`
//! - **History segments**: [`history::Segment`] and [`history::Role`] — the
//!   persisted shape of a turn, split text / tool-use
//! - **Text utilities**: [`text`] char-boundary-safe clipping for summaries
//! - **Logging**: [`logging::init`] tracing subscriber setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other tether crates.

#![deny(unsafe_code)]

pub mod events;
pub mod history;
pub mod ids;
pub mod logging;
pub mod text;
