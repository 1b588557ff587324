//! This library renders structured crash reports into the apple crash
//! report text format.
//!
//! Reports are decoded from a JSON wire format with serde and rendered
//! with [`Report::render_crash`], which produces the plain text plus a
//! list of styling annotations for rich-text consumers.
mod render;
mod report;

pub use crate::render::*;
pub use crate::report::*;
