/// Check execution and scheduling
///
/// `checker` issues the HTTP probe, `executor` turns it into a
/// [`CheckResult`], `pipeline` wraps it with capture and classification and
/// `scheduler` runs pipelines on each target's interval.
pub mod checker;
pub mod executor;
pub mod pipeline;
pub mod scheduler;
pub mod types;

pub use executor::CheckExecutor;
pub use pipeline::CheckPipeline;
pub use scheduler::{MonitoringScheduler, ReportHandler, SchedulerError};
pub use types::{CheckReport, CheckResult, MonitorStatus};
