use async_trait::async_trait;
use diffuzz_common::StorageSlot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failures reported by a backend
///
/// All of them end up as call outcome data; none of them stops a runner.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Deploy(String),

    #[error("{0}")]
    Runtime(String),

    /// The channel to the backend broke down
    #[error("backend bridge failure: {0}")]
    Bridge(String),
}

/// Externally callable function, as listed by the backend's ABI manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
}

/// What a successful call produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallTrace {
    pub return_value: Value,
    #[serde(default)]
    pub gas_used: Option<u64>,
    /// Raw memory contents, when the backend exposes them
    #[serde(default)]
    pub memory: Option<Vec<u8>>,
}

/// Compiler-plus-runtime capability of one backend
#[async_trait]
pub trait Executor: Send {
    type Handle: Send + Sync;

    /// Compile and deploy a candidate with the given constructor arguments
    async fn deploy(
        &mut self,
        source: &str,
        constructor_args: &[Value],
    ) -> Result<Self::Handle, ExecutorError>;

    /// Functions the deployed candidate exports
    async fn manifest(
        &mut self,
        handle: &Self::Handle,
    ) -> Result<Vec<FunctionDescriptor>, ExecutorError>;

    async fn call(
        &mut self,
        handle: &Self::Handle,
        function: &str,
        args: &[Value],
    ) -> Result<CallTrace, ExecutorError>;

    /// Storage in slot order
    async fn dump_state(&mut self, handle: &Self::Handle) -> Result<Vec<StorageSlot>, ExecutorError>;

    /// Drop every deployment made since the last reset
    async fn reset(&mut self) -> Result<(), ExecutorError>;
}
