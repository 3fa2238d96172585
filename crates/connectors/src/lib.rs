//! Remote sources for the cirrus engine.
//!
//! Each source speaks SQL over HTTPS to a hosted service and exposes the
//! remote tables to DataFusion as `TableProvider`s.
pub mod sources;
