//! Script package reading.

mod descriptor;
mod source;

pub use descriptor::{PackageDescriptor, DESCRIPTOR_PATH};
pub use source::{PackageSource, DEFAULT_CONFIG_PATH};
