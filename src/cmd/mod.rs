//! Command-line entry points.

pub mod ocr;
pub mod pages;
pub mod schema;
pub mod text;
pub mod worker;
