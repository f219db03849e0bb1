pub mod blob;
pub mod file;
pub mod stats;

pub use blob::*;
pub use file::*;
pub use stats::*;
