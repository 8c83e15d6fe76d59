//! Host engine running as a child process, spoken to with JSON-RPC over
//! stdin/stdout, one message per line.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::store::lock;

use super::events::{EngineEvent, EngineSegment, EventBus, Subscription};
use super::{HostEngine, LoadModelRequest, TranscribeRequest};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

type Pending = Arc<Mutex<HashMap<u64, Sender<Result<Value, String>>>>>;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcNotification {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response(RpcResponse),
    Notification(RpcNotification),
}

struct SidecarProcess {
    child: Child,
    stdin: ChildStdin,
}

pub struct SidecarEngine {
    program: PathBuf,
    args: Vec<String>,
    request_timeout: Duration,
    bus: Arc<EventBus>,
    pending: Pending,
    process: Mutex<Option<SidecarProcess>>,
    next_id: AtomicU64,
}

impl SidecarEngine {
    pub fn new(program: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            request_timeout,
            bus: EventBus::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            process: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn call(&self, method: &'static str, params: Value) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(err) = self.write_request(id, method, params) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }

        match rx.recv_timeout(self.request_timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(EngineError::Request(message)),
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).remove(&id);
                Err(EngineError::Timeout(method, self.request_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Unavailable(
                "host engine exited before answering".to_string(),
            )),
        }
    }

    fn write_request(&self, id: u64, method: &str, params: Value) -> Result<(), EngineError> {
        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|e| EngineError::Protocol(format!("Failed to serialize request: {e}")))?;

        let mut slot = lock(&self.process);
        let process = self.ensure_running(&mut slot)?;
        process.stdin.write_all(line.as_bytes())?;
        process.stdin.write_all(b"\n")?;
        process.stdin.flush()?;
        log::debug!("Sent {method} request #{id} to host engine");
        Ok(())
    }

    fn ensure_running<'a>(
        &self,
        slot: &'a mut Option<SidecarProcess>,
    ) -> Result<&'a mut SidecarProcess, EngineError> {
        let exited = match slot.as_mut() {
            Some(process) => !matches!(process.child.try_wait(), Ok(None)),
            None => true,
        };
        if exited {
            if slot.is_some() {
                log::warn!("Host engine process exited, restarting");
            }
            *slot = Some(self.spawn_process()?);
        }
        slot.as_mut()
            .ok_or_else(|| EngineError::Unavailable("host engine failed to start".to_string()))
    }

    fn spawn_process(&self) -> Result<SidecarProcess, EngineError> {
        if !self.program.exists() {
            return Err(EngineError::Unavailable(format!(
                "{} not found",
                self.program.display()
            )));
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Unavailable("host engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Unavailable("host engine stdout unavailable".to_string()))?;

        let pending = self.pending.clone();
        let bus = self.bus.clone();
        thread::Builder::new()
            .name("host-engine-reader".to_string())
            .spawn(move || read_loop(stdout, pending, bus))?;

        log::info!("Started host engine {} (pid {})", self.program.display(), child.id());
        Ok(SidecarProcess { child, stdin })
    }
}

impl HostEngine for SidecarEngine {
    fn load_model(&self, request: &LoadModelRequest) -> Result<(), EngineError> {
        let params = serde_json::to_value(request)
            .map_err(|e| EngineError::Protocol(format!("Failed to serialize request: {e}")))?;
        self.call("load_model", params).map(|_| ())
    }

    fn transcribe(&self, request: &TranscribeRequest) -> Result<(), EngineError> {
        let params = serde_json::to_value(request)
            .map_err(|e| EngineError::Protocol(format!("Failed to serialize request: {e}")))?;
        self.call("transcribe", params).map(|_| ())
    }

    fn cancel(&self) -> Result<(), EngineError> {
        self.call("cancel", Value::Null).map(|_| ())
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}

impl Drop for SidecarEngine {
    fn drop(&mut self) {
        if let Some(mut process) = lock(&self.process).take() {
            if let Err(err) = process.child.kill() {
                log::debug!("Host engine already stopped: {err}");
            }
            let _ = process.child.wait();
        }
    }
}

fn read_loop(stdout: ChildStdout, pending: Pending, bus: Arc<EventBus>) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::error!("Failed to read from host engine: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(Message::Reply(id, reply)) => match lock(&pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => log::debug!("Dropping late reply #{id} from host engine"),
            },
            Some(Message::Event(event)) => bus.publish(event),
            None => {}
        }
    }

    log::warn!("Host engine output closed");
    lock(&pending).clear();
    bus.publish(EngineEvent::Failed("host engine exited".to_string()));
}

#[derive(Debug, PartialEq)]
enum Message {
    Reply(u64, Result<Value, String>),
    Event(EngineEvent),
}

fn parse_line(line: &str) -> Option<Message> {
    let incoming: Incoming = match serde_json::from_str(line) {
        Ok(incoming) => incoming,
        Err(err) => {
            log::warn!("Ignoring malformed host engine line ({err}): {line}");
            return None;
        }
    };

    match incoming {
        Incoming::Response(response) => {
            let reply = match response.error {
                Some(error) => Err(error.message),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            Some(Message::Reply(response.id, reply))
        }
        Incoming::Notification(notification) => {
            notification_to_event(notification).map(Message::Event)
        }
    }
}

fn notification_to_event(notification: RpcNotification) -> Option<EngineEvent> {
    let RpcNotification { method, params } = notification;
    match method.as_str() {
        "transcribe_progress" => {
            let progress = params
                .get("progress")
                .and_then(Value::as_f64)
                .or_else(|| params.as_f64())?;
            Some(EngineEvent::Progress(progress as f32))
        }
        "new_segment" => match serde_json::from_value::<EngineSegment>(params) {
            Ok(segment) => Some(EngineEvent::NewSegment(segment)),
            Err(err) => {
                log::warn!("Ignoring malformed segment from host engine: {err}");
                None
            }
        },
        "transcribe_completed" => Some(EngineEvent::Completed),
        "transcribe_cancelled" => Some(EngineEvent::Cancelled),
        "transcribe_error" => {
            let message = match params {
                Value::String(message) => message,
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            Some(EngineEvent::Failed(message))
        }
        other => {
            log::debug!("Ignoring host engine notification {other}");
            None
        }
    }
}
