pub mod bridge;
pub mod executor;
pub mod runner;

pub use bridge::ProcessExecutor;
pub use executor::{CallTrace, Executor, ExecutorError, FunctionDescriptor};
pub use runner::{execute_generation, DeliveryOutcome, PoisonPolicy, RunnerConfig, RunnerNode};
