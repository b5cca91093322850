//! Shared fixtures

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use patch_protocol::{PatchStatus, PatchStep, StatusEvent};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Notify};

use branchpatch::errors::AgentError;
use branchpatch::mqtt::broker::MqttMessage;
use branchpatch::mqtt::dispatch::MessageHandler;
use branchpatch::patch::host::HostControl;
use branchpatch::patch::reporter::StatusSink;
use branchpatch::transfer::remote::{BoxedReader, BoxedWriter, FsRemoteStore, RemoteSession, RemoteStore};

// ================================= HOST ===================================== //

/// Process table and restart counter standing in for the OS
#[derive(Default)]
pub struct FakeHost {
    processes: Mutex<HashMap<u32, String>>,
    /// PIDs that ignore `kill`
    survivors: Mutex<Vec<u32>>,
    restarts: AtomicUsize,
}

impl FakeHost {
    pub fn with_process(pid: u32, name: &str) -> Self {
        let host = Self::default();
        host.processes.lock().unwrap().insert(pid, name.to_string());
        host
    }

    /// A process that stays up whatever the agent does
    pub fn with_surviving_process(pid: u32, name: &str) -> Self {
        let host = Self::with_process(pid, name);
        host.survivors.lock().unwrap().push(pid);
        host
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn running(&self, name: &str) -> usize {
        self.processes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.as_str() == name)
            .count()
    }
}

#[async_trait]
impl HostControl for FakeHost {
    async fn list_processes(&self, name: &str) -> Result<Vec<u32>, AgentError> {
        let processes = self.processes.lock().unwrap();
        let mut pids: Vec<u32> = processes
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort();
        Ok(pids)
    }

    async fn kill(&self, pid: u32) -> Result<(), AgentError> {
        if !self.survivors.lock().unwrap().contains(&pid) {
            self.processes.lock().unwrap().remove(&pid);
        }
        Ok(())
    }

    async fn wait_exit(&self, pid: u32, _timeout: Duration) -> Result<bool, AgentError> {
        Ok(!self.processes.lock().unwrap().contains_key(&pid))
    }

    async fn schedule_restart(&self, _service: &str) -> Result<(), AgentError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ================================= STATUS =================================== //

/// Keeps every status event the engine publishes
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<(PatchStatus, PatchStep, u8)> {
        self.events()
            .into_iter()
            .map(|e| (e.status, e.step, e.progress_percent))
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn publish(&self, event: &StatusEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ================================= REMOTE =================================== //

/// Remote store whose sessions drop the link after a per-connect byte budget
pub struct FlakyStore {
    inner: FsRemoteStore,
    budgets: Mutex<VecDeque<Option<u64>>>,
    connects: AtomicUsize,
}

impl FlakyStore {
    /// `budgets[n]` applies to the n-th connect; `None` and later connects are healthy
    pub fn new(root: &Path, budgets: Vec<Option<u64>>) -> Self {
        Self {
            inner: FsRemoteStore::new(root),
            budgets: Mutex::new(budgets.into()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, AgentError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.connect().await?;
        let budget = self.budgets.lock().unwrap().pop_front().flatten();
        Ok(Box::new(FlakySession {
            inner,
            budget: Mutex::new(budget),
        }))
    }

    fn describe(&self) -> String {
        format!("flaky+{}", self.inner.describe())
    }
}

struct FlakySession {
    inner: Box<dyn RemoteSession>,
    budget: Mutex<Option<u64>>,
}

#[async_trait]
impl RemoteSession for FlakySession {
    async fn size(&self, path: &str) -> Result<Option<u64>, AgentError> {
        self.inner.size(path).await
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, AgentError> {
        let reader = self.inner.open_read(path, offset).await?;
        let budget = self.budget.lock().unwrap().take();
        Ok(match budget {
            Some(remaining) => Box::new(DroppingReader { inner: reader, remaining }),
            None => reader,
        })
    }

    async fn open_write(&self, path: &str, offset: u64) -> Result<BoxedWriter, AgentError> {
        self.inner.open_write(path, offset).await
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), AgentError> {
        self.inner.create_dir_all(path).await
    }
}

/// Yields `remaining` bytes, then fails like a reset connection
struct DroppingReader {
    inner: BoxedReader,
    remaining: u64,
}

impl AsyncRead for DroppingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if self.remaining == 0 {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "link dropped",
            )));
        }

        let limit = (self.remaining as usize).min(buf.remaining());
        let mut scratch = vec![0u8; limit];
        let mut limited = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let filled = limited.filled();
                buf.put_slice(filled);
                let read = filled.len() as u64;
                self.remaining -= read;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Remote store whose connects wait for [`GatedStore::open`]
pub struct GatedStore {
    inner: FsRemoteStore,
    gate: Notify,
}

impl GatedStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: FsRemoteStore::new(root),
            gate: Notify::new(),
        }
    }

    /// Let one pending or future connect through
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl RemoteStore for GatedStore {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, AgentError> {
        self.gate.notified().await;
        self.inner.connect().await
    }

    fn describe(&self) -> String {
        format!("gated+{}", self.inner.describe())
    }
}

// ================================= MQTT ===================================== //

/// Forwards every message into a channel
pub struct Forward(pub mpsc::UnboundedSender<MqttMessage>);

#[async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, message: MqttMessage) -> Result<(), AgentError> {
        let _ = self.0.send(message);
        Ok(())
    }
}

pub async fn next_message(receiver: &mut mpsc::UnboundedReceiver<MqttMessage>) -> MqttMessage {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

// ================================= HELPERS ================================== //

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}
