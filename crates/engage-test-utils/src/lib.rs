//! Shared fakes and fixtures for engage tests.

pub mod fixtures;
pub mod provider;

pub use fixtures::*;
pub use provider::{ScriptedProvider, ScriptedReply};
