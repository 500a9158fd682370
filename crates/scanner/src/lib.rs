#![allow(clippy::collapsible_if)]
pub mod filter;
pub mod scan;
pub mod walk;

pub use scan::{LibraryRoot, ScanError, Scanner, ScannerConfig};
