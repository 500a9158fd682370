pub mod jobs;
pub mod stats;
