//! Shared building blocks of the curio workspace.
//!
//! Besides the [`EventQueue`] this crate re-exports the third-party crates that all
//! other crates of the workspace use so that their versions are pinned in one place.

mod event_queue;

pub use event_queue::*;

pub use bitflags;
pub use blake3;
pub use byteorder;
pub use chrono;
pub use crossbeam_channel;
pub use indoc;
pub use itertools;
pub use log;
pub use maplit;
pub use parking_lot;
pub use pathdiff;
pub use thiserror;
pub use uuid;
pub use walkdir;
