pub mod batch;
pub mod errors;
pub mod factory;
pub mod local;
pub mod task_runner;

pub use batch::BatchCounts;
pub use errors::AppError;
pub use factory::{AppFactory, AppPaths};
pub use local::AppLocal;
pub use task_runner::{QueueDump, RefreshJob, TaskScheduler};
