pub mod cli;
pub mod error;
pub mod logging;
pub mod neighborhood;
pub mod pretty;
pub mod queue;
pub mod scan;
pub mod scanner;
pub mod target;
pub mod types;

// Re-export key types and functions at the crate root
pub use error::ScanError;
pub use neighborhood::{Neighborhood, accumulate};
pub use queue::{TaskQueue, TaskQueueRegistry};
pub use scan::{create_default_scanners, spawn_scanner_tasks};
pub use scanner::Scanner;
pub use target::Host;
pub use types::{AppState, OutcomeData, OutcomeSink, ScanKind, ScanOutcome, ScanStatus, ScanTask};
pub use logging::init_logging;
