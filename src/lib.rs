//! CleanMail: rule-based mailbox triage over Microsoft Graph.

pub mod config;
pub mod engine;
pub mod error;
pub mod mailbox;
pub mod notify;
pub mod rules;
pub mod scheduler;
pub mod server;
pub mod store;
