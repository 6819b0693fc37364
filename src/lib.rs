//! Engine of the fnug command runner.
//!
//! Turns a declarative tree of lint/test commands into executable,
//! observable work: a resolved configuration model with inheritance, git-
//! and watch-based auto-selection, and one pseudo-terminal per running
//! command with a live frame stream for the UI to subscribe to.
//!
//! The terminal UI, CLI parsing and key handling live in the embedding
//! application; they consume this crate through [`Fnug`], [`CommandStream`]
//! and [`PtyProcess`].

pub mod config;
mod core;
pub mod error;
pub mod git;
pub mod logger;
pub mod process;
pub mod select;
pub mod watch;

pub use crate::config::{Auto, AutoConfig, Command, CommandConfig, CommandGroup, GroupConfig};
pub use crate::core::Fnug;
pub use crate::error::{Error, Result};
pub use crate::process::{Cell, Color, Frame, OutputStream, ProcessStatus, PtyProcess};
pub use crate::watch::{CommandStream, WatchDebouncer};
