//! CRM agent: classifies support email, runs the requested action once,
//! logs it, and replies.

pub mod actions;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod error;
pub mod http;
pub mod llm;
pub mod locks;
pub mod pipeline;
pub mod services;
pub mod store;
