pub mod context;
pub mod job_worker;

pub use context::WorkerContext;
pub use job_worker::JobWorker;
