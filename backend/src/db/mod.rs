//! File-backed local databases.

mod file;
mod opener;

pub use file::{BriefcaseFile, JsonDatabase};
pub use opener::JsonOpener;
