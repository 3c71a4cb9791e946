pub mod cancel;
pub mod config;
pub mod consumer;
pub mod executor;
pub mod service;
pub mod worker;

pub use cancel::CancellationSignal;
pub use config::QueueSettings;
pub use consumer::{ConsumerReport, ConsumerState, TailingConsumer};
pub use executor::{CommandExecutor, FnExecutor, executor_fn};
pub use service::QueueService;
pub use worker::{QueueWorker, spawn_queue_worker};
