//! Reactive bridge - follow-up tasks from code execution outcomes.

#![warn(missing_docs)]

pub mod action;
pub mod rule;
pub mod builtin;
pub mod bridge;

pub use action::{install_command, ReactionAction};
pub use rule::{Reaction, ReactionRule};
pub use builtin::{default_rules, extract_module};
pub use bridge::{ReactiveBridge, ReactiveError};
