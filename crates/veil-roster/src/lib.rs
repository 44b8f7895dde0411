pub mod service;

pub use service::{FirstEpochSubmission, RosterService};
