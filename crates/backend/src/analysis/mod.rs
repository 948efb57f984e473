//! Bytecode analysis: metadata, templates, source maps and matching.

pub mod matcher;
pub mod metadata;
pub mod source_map;
pub mod template;
