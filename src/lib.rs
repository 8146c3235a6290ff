//! GPU memory residency and eviction control.
//!
//! Each engine context owns a [`ResidencyController`] that keeps the
//! allocations referenced by upcoming submissions resident, parks idle ones on a
//! trim candidate list, and evicts from that list when the OS signals memory
//! pressure. Eviction never races the GPU: work still in flight is waited on
//! through the context's monitored fence first.

pub mod config;
pub mod error;
pub mod kmd;
pub mod thunk;
pub mod utils;

pub use config::ResidencyConfig;
pub use error::{ResidencyError, ResidencyResult};
pub use kmd::device::SimulatedDevice;
pub use kmd::trim::{TrimFlags, TrimNotification};
pub use kmd::{KernelDriver, MakeResidentStatus, OsHandle};
pub use thunk::context::{Context, OsContext};
pub use thunk::memory::residency::ContextId;
pub use thunk::memory::{GraphicsAllocation, MemoryManager};
pub use thunk::residency::{ResidencyController, ResidencyStats};
