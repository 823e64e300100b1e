//! Outbound TCP connections owned by plugins
//!
//! A plugin creates a socket id, then asks for a connection. Each connection
//! runs as one tokio task that reads into the socket's receive queue and
//! writes whatever the plugin sends. The plugin side never blocks: `send`
//! queues bytes for the task and the `recv_*` calls pop what already arrived.
//!
//! Sockets start in line mode, where input is split on `\n` (a trailing
//! `\r` is dropped) and empty lines are skipped. Raw mode queues each read
//! as one chunk.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::host::lock;

/// Lines or chunks kept per socket; the oldest are dropped beyond this
pub const MAX_QUEUED_ITEMS: usize = 1000;
const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug)]
struct Inbox {
    connected: bool,
    line_mode: bool,
    partial: Vec<u8>,
    lines: VecDeque<String>,
    chunks: VecDeque<Vec<u8>>,
    error: Option<String>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self {
            connected: false,
            line_mode: true,
            partial: Vec::new(),
            lines: VecDeque::new(),
            chunks: VecDeque::new(),
            error: None,
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T) {
    if queue.len() >= MAX_QUEUED_ITEMS {
        queue.pop_front();
    }
    queue.push_back(item);
}

impl Inbox {
    fn receive(&mut self, data: &[u8]) {
        if !self.line_mode {
            push_bounded(&mut self.chunks, data.to_vec());
            return;
        }
        self.partial.extend_from_slice(data);
        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                push_bounded(&mut self.lines, String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    fn pending(&self) -> usize {
        if self.line_mode {
            self.lines.len()
        } else {
            self.chunks.len()
        }
    }
}

struct ManagedStream {
    plugin_id: String,
    inbox: Arc<Mutex<Inbox>>,
    outgoing: Option<UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Drop for ManagedStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct StreamTable {
    next_id: i32,
    streams: HashMap<i32, ManagedStream>,
}

#[derive(Default)]
pub struct TcpManager {
    table: Mutex<StreamTable>,
}

async fn run_connection(
    host: String,
    port: u16,
    inbox: Arc<Mutex<Inbox>>,
    mut outgoing: UnboundedReceiver<Vec<u8>>,
) {
    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%host, port, error = %e, "tcp connect failed");
            lock(&inbox).error = Some(e.to_string());
            return;
        }
    };
    lock(&inbox).connected = true;
    debug!(%host, port, "tcp connected");

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(%host, port, "tcp connection closed by remote");
                    break;
                }
                Ok(n) => lock(&inbox).receive(&buf[..n]),
                Err(e) => {
                    lock(&inbox).error = Some(e.to_string());
                    break;
                }
            },
            data = outgoing.recv() => match data {
                Some(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        lock(&inbox).error = Some(e.to_string());
                        break;
                    }
                }
                None => break,
            },
        }
    }
    lock(&inbox).connected = false;
}

impl TcpManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<R>(
        &self,
        plugin_id: &str,
        socket_id: i32,
        f: impl FnOnce(&mut ManagedStream) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut table = lock(&self.table);
        match table.streams.get_mut(&socket_id) {
            Some(managed) if managed.plugin_id == plugin_id => f(managed),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("tcp socket {socket_id} not owned by {plugin_id}"),
            )),
        }
    }

    fn with_inbox<R>(&self, plugin_id: &str, socket_id: i32, f: impl FnOnce(&mut Inbox) -> R) -> io::Result<R> {
        self.with_stream(plugin_id, socket_id, |managed| Ok(f(&mut lock(&managed.inbox))))
    }

    pub fn create(&self, plugin_id: &str) -> i32 {
        let mut table = lock(&self.table);
        table.next_id += 1;
        let id = table.next_id;
        table.streams.insert(
            id,
            ManagedStream {
                plugin_id: plugin_id.to_string(),
                inbox: Arc::new(Mutex::new(Inbox::default())),
                outgoing: None,
                task: None,
            },
        );
        debug!(plugin_id, socket_id = id, "created tcp socket");
        id
    }

    /// Start connecting in the background; check progress with `is_connected`
    pub fn connect(&self, plugin_id: &str, socket_id: i32, host: &str, port: u16) -> io::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| io::Error::other("no async runtime for tcp socket"))?;
        self.with_stream(plugin_id, socket_id, |managed| {
            if managed.task.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "tcp socket already connected or connecting",
                ));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&managed.inbox).error = None;
            let task = runtime.spawn(run_connection(host.to_string(), port, managed.inbox.clone(), rx));
            managed.outgoing = Some(tx);
            managed.task = Some(task);
            debug!(plugin_id, socket_id, host, port, "tcp connecting");
            Ok(())
        })
    }

    pub fn is_connected(&self, plugin_id: &str, socket_id: i32) -> io::Result<bool> {
        self.with_inbox(plugin_id, socket_id, |inbox| inbox.connected)
    }

    pub fn last_error(&self, plugin_id: &str, socket_id: i32) -> io::Result<Option<String>> {
        self.with_inbox(plugin_id, socket_id, |inbox| inbox.error.clone())
    }

    pub fn set_line_buffering(&self, plugin_id: &str, socket_id: i32, line_mode: bool) -> io::Result<()> {
        self.with_inbox(plugin_id, socket_id, |inbox| inbox.line_mode = line_mode)
    }

    /// Queue bytes for the connection task
    pub fn send(&self, plugin_id: &str, socket_id: i32, data: &[u8]) -> io::Result<usize> {
        self.with_stream(plugin_id, socket_id, |managed| {
            let connected = lock(&managed.inbox).connected;
            match &managed.outgoing {
                Some(tx) if connected => tx
                    .send(data.to_vec())
                    .map(|()| data.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tcp connection closed")),
                _ => Err(io::Error::new(io::ErrorKind::NotConnected, "tcp socket not connected")),
            }
        })
    }

    pub fn recv_line(&self, plugin_id: &str, socket_id: i32) -> io::Result<Option<String>> {
        self.with_inbox(plugin_id, socket_id, |inbox| inbox.lines.pop_front())
    }

    pub fn recv_raw(&self, plugin_id: &str, socket_id: i32) -> io::Result<Option<Vec<u8>>> {
        self.with_inbox(plugin_id, socket_id, |inbox| inbox.chunks.pop_front())
    }

    /// Lines (line mode) or chunks (raw mode) waiting to be received
    pub fn pending(&self, plugin_id: &str, socket_id: i32) -> io::Result<usize> {
        self.with_inbox(plugin_id, socket_id, |inbox| inbox.pending())
    }

    pub fn close(&self, plugin_id: &str, socket_id: i32) -> bool {
        let mut table = lock(&self.table);
        let owned = table
            .streams
            .get(&socket_id)
            .is_some_and(|m| m.plugin_id == plugin_id);
        if owned {
            table.streams.remove(&socket_id);
            debug!(plugin_id, socket_id, "closed tcp socket");
        }
        owned
    }

    pub fn close_all_for_plugin(&self, plugin_id: &str) -> usize {
        let mut table = lock(&self.table);
        let before = table.streams.len();
        table.streams.retain(|_, m| m.plugin_id != plugin_id);
        let closed = before - table.streams.len();
        if closed > 0 {
            debug!(plugin_id, closed, "closed plugin tcp sockets");
        }
        closed
    }

    pub fn open_count(&self, plugin_id: &str) -> usize {
        lock(&self.table)
            .streams
            .values()
            .filter(|m| m.plugin_id == plugin_id)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.table).streams.clear();
    }
}
