//! Collector Layer
//!
//! A [`Collector`] binds a registered name to a data-acquisition [`Source`]
//! and its processing configuration (event ops, joins, post ops). The
//! pipeline in this module drives a raw event stream through join-cache
//! warm-up, per-event transforms, enrichment and delivery, under
//! cancellation.

pub mod local;
mod pipeline;
mod traits;

pub use pipeline::Collector;
pub use traits::{CollectorError, PostOps, Source};

#[cfg(test)]
pub(crate) mod test_support;
