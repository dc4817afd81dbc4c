//! Domain types and wire codec shared by the drafter backend and client.

pub mod domain;
pub mod error;
pub mod pointer;
pub mod tokens;
pub mod wire;

pub use domain::*;
pub use error::{CoreError, Result};
pub use pointer::SessionPointer;
pub use tokens::{ApproxTokenCounter, TokenCounter};
pub use wire::{ChunkTag, Frame, WireChunk};
