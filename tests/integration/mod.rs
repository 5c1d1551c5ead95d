//! Integration tests for image-analyzer
//!
//! These tests drive the public pipeline end to end: a source resolves an
//! image, layers are applied into a fresh workspace, and the analysis or the
//! HTTP handler reads the result.

pub mod common;
pub mod layout;
pub mod pipeline;
pub mod server;
