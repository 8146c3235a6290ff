use crate::config::ResidencyConfig;
use crate::error::ResidencyResult;
use crate::kmd::KernelDriver;
use crate::thunk::memory::MemoryManager;
use crate::thunk::memory::residency::ContextId;
use crate::thunk::residency::ResidencyController;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

// ===============================================================================================
// Context Structures
// ===============================================================================================

/// One engine context: an independent GPU submission queue with its own
/// residency controller and monitored fence.
#[derive(Debug, Clone)]
pub struct OsContext {
    id: ContextId,
    residency_controller: Arc<ResidencyController>,
}

impl OsContext {
    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    #[must_use]
    pub const fn residency_controller(&self) -> &Arc<ResidencyController> {
        &self.residency_controller
    }
}

/// The runtime context: the kernel driver, its memory manager and the engine
/// contexts created on top of them.
pub struct Context {
    driver: Arc<dyn KernelDriver>,
    config: ResidencyConfig,
    memory_manager: Arc<MemoryManager>,
    next_context_id: AtomicU32,
}

impl Context {
    #[must_use]
    pub fn new(driver: Arc<dyn KernelDriver>, config: ResidencyConfig) -> Self {
        let memory_manager = MemoryManager::new(driver.clone());
        Self {
            driver,
            config,
            memory_manager,
            next_context_id: AtomicU32::new(0),
        }
    }

    /// Builds a context whose configuration is read from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid configuration.
    pub fn from_config_file(driver: Arc<dyn KernelDriver>, path: &Path) -> ResidencyResult<Self> {
        let config = ResidencyConfig::from_path(path)?;
        Ok(Self::new(driver, config))
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn KernelDriver> {
        &self.driver
    }

    #[must_use]
    pub const fn config(&self) -> &ResidencyConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    /// Creates the next engine context and registers its residency controller
    /// with the memory manager.
    ///
    /// # Errors
    /// Fails with `InvalidContextId` once every engine context slot is taken, or
    /// with the driver error if the monitored fence cannot be created.
    pub fn create_engine_context(&self) -> ResidencyResult<OsContext> {
        let id = ContextId::new(self.next_context_id.fetch_add(1, Ordering::Relaxed))?;
        let residency_controller = ResidencyController::new(self.driver.clone(), id, &self.config)?;
        self.memory_manager
            .register_os_context(residency_controller.clone());

        info!(context = %id, "engine context created");
        Ok(OsContext {
            id,
            residency_controller,
        })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("memory_manager", &self.memory_manager)
            .field("engine_contexts", &self.next_context_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
