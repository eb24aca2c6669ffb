//! crsync continuously mirrors container images from a source registry
//! (Quay) into a destination registry (Docker Hub or Azure Container
//! Registry).
//!
//! The heart of the crate is the [`sync`] module: a two-stage, rate-limited
//! fan-out/fan-in pipeline that enumerates repositories on the source,
//! computes the set of tags missing at the destination, and performs the
//! pull, retag, push and cleanup sequence for each missing tag with bounded
//! concurrency.

pub mod cli;
pub mod image;
pub mod metrics;
pub mod registry;
pub mod sync;
