pub mod content;
pub mod deadline;
pub mod file;
pub mod hashing;
pub mod locks;
pub mod query;
pub mod stats;
#[cfg(test)]
pub mod testing;

pub use content::ContentStore;
pub use file::FileService;
pub use query::QueryService;
pub use stats::StatsService;
