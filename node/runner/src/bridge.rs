//! Executor bridge to an external backend process.
//!
//! The backend runs as a child process and speaks newline-delimited JSON on
//! stdin/stdout. Every request is one object carrying a numeric `id` and
//! tagged by `op`, and every reply echoes the `id` of its request:
//!
//! ```text
//! {"id":1,"op":"deploy","source":"...","args":[...]}   -> {"id":1,"ok":{"handle":"..."}}
//! {"id":2,"op":"manifest","handle":"..."}              -> {"id":2,"ok":[{"name":"...","inputs":[...]}]}
//! {"id":3,"op":"call","handle":"...","function":"...","args":[...]}
//!                                                      -> {"id":3,"ok":{"return_value":...,"gas_used":...,"memory":"<hex>"}}
//! {"id":4,"op":"dump_state","handle":"..."}            -> {"id":4,"ok":[{"slot":"...","value":...}]}
//! {"id":5,"op":"reset"}                                -> {"id":5,"ok":null}
//! ```
//!
//! Any request may instead be answered with `{"id":N,"error":"<message>"}`.
//! Output lines that are not a reply to the pending request (debug prints,
//! stale replies) are skipped.

use async_trait::async_trait;
use diffuzz_common::StorageSlot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::executor::{CallTrace, Executor, ExecutorError, FunctionDescriptor};

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Deploy { source: &'a str, args: &'a [Value] },
    Manifest { handle: &'a str },
    Call { handle: &'a str, function: &'a str, args: &'a [Value] },
    DumpState { handle: &'a str },
    Reset,
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: &'a Request<'a>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Deployed {
    handle: String,
}

#[derive(Deserialize)]
struct CallReply {
    #[serde(default)]
    return_value: Value,
    #[serde(default)]
    gas_used: Option<u64>,
    #[serde(default)]
    memory: Option<String>,
}

struct BackendProcess {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl BackendProcess {
    fn spawn(program: &str, args: &[String]) -> Result<Self, ExecutorError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Bridge(format!("failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Bridge("backend stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Bridge("backend stdout unavailable".into()))?;

        Ok(Self {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    /// Read until the reply tagged `id`, skipping every other line
    async fn reply_to(&mut self, id: u64) -> std::io::Result<Option<Response>> {
        while let Some(line) = self.stdout.next_line().await? {
            match serde_json::from_str::<Response>(&line) {
                Ok(response) if response.id == Some(id) => return Ok(Some(response)),
                Ok(_) => debug!(id, "skipping stale backend reply: {}", line),
                Err(_) => debug!(id, "skipping backend output: {}", line),
            }
        }
        Ok(None)
    }
}

/// Executor backed by a long-lived child process, respawned if it dies
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    process: Option<BackendProcess>,
    next_id: u64,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            process: None,
            next_id: 0,
        }
    }

    fn process(&mut self) -> Result<&mut BackendProcess, ExecutorError> {
        if self.process.is_none() {
            info!(program = %self.program, "starting backend process");
            self.process = Some(BackendProcess::spawn(&self.program, &self.args)?);
        }
        self.process
            .as_mut()
            .ok_or_else(|| ExecutorError::Bridge("backend process unavailable".into()))
    }

    /// Send one request; `Ok(Err(message))` is an error reported by the backend itself
    async fn roundtrip(&mut self, request: &Request<'_>) -> Result<Result<Value, String>, ExecutorError> {
        self.next_id += 1;
        let id = self.next_id;
        let line = serde_json::to_string(&Envelope { id, request })
            .map_err(|e| ExecutorError::Bridge(format!("failed to encode request: {e}")))?;

        let process = self.process()?;
        let reply = match process.send(&line).await {
            Ok(()) => process.reply_to(id).await,
            Err(e) => Err(e),
        };
        let response = match reply {
            Ok(Some(response)) => response,
            Ok(None) => {
                warn!(program = %self.program, "backend process closed its output");
                self.process = None;
                return Err(ExecutorError::Bridge("backend process exited".into()));
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "backend process unreachable");
                self.process = None;
                return Err(ExecutorError::Bridge(e.to_string()));
            }
        };

        match (response.ok, response.error) {
            (_, Some(message)) => Ok(Err(message)),
            (Some(value), None) => Ok(Ok(value)),
            (None, None) => Ok(Ok(Value::Null)),
        }
    }

    /// Decode a reply payload. A payload of the wrong shape drops the process,
    /// so the next request starts from a clean backend.
    fn parse<T: serde::de::DeserializeOwned>(&mut self, value: Value) -> Result<T, ExecutorError> {
        serde_json::from_value(value).map_err(|e| {
            warn!(program = %self.program, error = %e, "unexpected backend payload, restarting backend");
            self.process = None;
            ExecutorError::Bridge(format!("unexpected backend payload: {e}"))
        })
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    type Handle = String;

    async fn deploy(&mut self, source: &str, constructor_args: &[Value]) -> Result<String, ExecutorError> {
        let reply = self
            .roundtrip(&Request::Deploy {
                source,
                args: constructor_args,
            })
            .await?
            .map_err(ExecutorError::Deploy)?;

        Ok(self.parse::<Deployed>(reply)?.handle)
    }

    async fn manifest(&mut self, handle: &String) -> Result<Vec<FunctionDescriptor>, ExecutorError> {
        let reply = self
            .roundtrip(&Request::Manifest { handle })
            .await?
            .map_err(ExecutorError::Runtime)?;

        self.parse(reply)
    }

    async fn call(
        &mut self,
        handle: &String,
        function: &str,
        args: &[Value],
    ) -> Result<CallTrace, ExecutorError> {
        let reply = self
            .roundtrip(&Request::Call {
                handle,
                function,
                args,
            })
            .await?
            .map_err(ExecutorError::Runtime)?;

        let reply: CallReply = self.parse(reply)?;
        let memory = reply
            .memory
            .map(hex::decode)
            .transpose()
            .map_err(|e| ExecutorError::Bridge(format!("memory is not hex: {e}")))?;

        Ok(CallTrace {
            return_value: reply.return_value,
            gas_used: reply.gas_used,
            memory,
        })
    }

    async fn dump_state(&mut self, handle: &String) -> Result<Vec<StorageSlot>, ExecutorError> {
        let reply = self
            .roundtrip(&Request::DumpState { handle })
            .await?
            .map_err(ExecutorError::Runtime)?;

        self.parse(reply)
    }

    async fn reset(&mut self) -> Result<(), ExecutorError> {
        self.roundtrip(&Request::Reset)
            .await?
            .map_err(ExecutorError::Runtime)?;

        Ok(())
    }
}
