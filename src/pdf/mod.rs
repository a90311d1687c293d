//! PDF tooling: counting pages, rasterizing them, and extracting text.
//!
//! Everything here shells out to Poppler's command-line utilities.

pub mod page_count;
pub mod render;
pub mod text;
