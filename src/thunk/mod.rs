pub mod context;
pub mod fence;
pub mod memory;
pub mod residency;
