#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[cfg(test)]
mod test_utils;

mod logging;
pub(crate) mod ptr_utils;

mod base;
mod error;
mod span;
mod sync;

pub mod source;

pub use base::{CallSite, FENCE, HEADER_SIZE, Heap, HeapStats, PointerKind};
pub use error::{Corruption, HeapError};
pub use span::Span;
pub use sync::HeapLock;

#[cfg(all(feature = "system-backed", unix))]
pub use sync::{SystemHeap, default_heap};

#[cfg(test)]
mod scenarios;
