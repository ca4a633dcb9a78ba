//! Core orchestration crate: spec registry, window calculation, source
//! connectors, load planning, compute delegation, and the schedule engine.

pub mod compute;
pub mod connector;
pub mod loader;
pub mod registry;
pub mod scheduler;
pub mod slots;
pub mod window;

// Re-export public API for convenience
pub use compute::{ComputeJobSubmitter, ComputePlatform, DelegateJobId, DelegatePhase};
pub use connector::{RelationalClient, SheetClient, SourceConnector};
pub use loader::{LoadPlanner, MemoryWarehouse, WarehouseClient};
pub use registry::SpecRegistry;
pub use scheduler::{EngineOptions, ScheduleEngine};
