//! I/O modules for reading MISR granules and writing output artifacts

pub mod export;
pub mod granule;

pub use export::ExportManager;
pub use granule::{detect_format, GranuleMetadata, GranuleReader};
