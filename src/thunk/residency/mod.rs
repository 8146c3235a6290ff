//! Per engine-context residency tracking and the trim policies.

pub mod controller;
pub mod trim_list;

pub use controller::{ResidencyController, ResidencyStats};
pub use trim_list::TrimCandidateList;
