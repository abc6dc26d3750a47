//! Subprocess transport: spawn, handshake, call channel, pooling.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use plugtab_common::protocol::{
    self, COOKIE_KEY, COOKIE_VALUE, PROTOCOL_VERSION, PluginConfig, Request, Response,
};
use plugtab_common::{PlugError, QueryConstraint, Result, TableDescriptor, Value};
use tracing::{debug, info, warn};

/// How long a graceful close waits for the child before SIGKILL.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// How long the pool waits when releasing the last table of a plugin.
const POOL_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// The table-call surface of a plugin channel.
///
/// The virtual-table adapter talks to this trait rather than to
/// [`PluginChannel`] directly; tests substitute a scripted implementation.
pub trait PluginRpc: Send + Sync {
    /// Allocate a connection id for one table attach. Every table-level call
    /// below carries it, so two attaches of the same table index never share
    /// plugin-side state.
    fn open_connection(&self) -> u64;

    fn initialize(
        &self,
        connection: u64,
        table: usize,
        config: PluginConfig,
    ) -> Result<TableDescriptor>;

    /// One batch of rows plus the exhaustion flag for `cursor`.
    fn query(
        &self,
        connection: u64,
        table: usize,
        cursor: u64,
        constraint: &QueryConstraint,
    ) -> Result<(Vec<Vec<Value>>, bool)>;

    fn insert(&self, connection: u64, table: usize, rows: Vec<Vec<Value>>) -> Result<()>;
    fn update(&self, connection: u64, table: usize, rows: Vec<Vec<Value>>) -> Result<()>;
    fn delete(&self, connection: u64, table: usize, keys: Vec<Value>) -> Result<()>;
    fn close_table(&self, connection: u64, table: usize) -> Result<()>;
}

struct ChannelIo {
    /// Dropped on close so the plugin sees EOF on its stdin.
    writer: Option<Box<dyn Write + Send>>,
    reader: Box<dyn Read + Send>,
    /// Set on the first I/O failure. A broken pipe invalidates every open
    /// cursor of the plugin, so later calls fail fast instead of retrying.
    broken: bool,
}

/// One live plugin subprocess and the framed channel to it.
///
/// Many tables and cursors share a channel; calls are serialized under the
/// I/O mutex, one request frame out and one response frame back.
pub struct PluginChannel {
    io: Mutex<ChannelIo>,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
    tables: Vec<usize>,
    /// Next connection id to hand out; each attach gets a distinct one.
    connections: AtomicU64,
}

impl std::fmt::Debug for PluginChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChannel")
            .field("tables", &self.tables)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PluginChannel {
    /// Spawn the plugin executable and perform the handshake.
    ///
    /// The cookie travels both in the child's environment (so a plugin can
    /// refuse a foreign parent before touching stdin) and in the handshake
    /// frame. Stderr stays attached to the host so plugin logs surface.
    /// On any handshake failure the child is killed before returning.
    pub fn connect(path: &Path, args: &[String]) -> Result<Self> {
        let mut child = Command::new(path)
            .args(args)
            .env(COOKIE_KEY, COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PlugError::Spawn(format!("{}: {e}", path.display())))?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| PlugError::Spawn("child stdin was not piped".into()))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| PlugError::Spawn("child stdout was not piped".into()))?;

        let mut io = ChannelIo {
            writer: Some(Box::new(writer)),
            reader: Box::new(reader),
            broken: false,
        };

        match handshake(&mut io) {
            Ok(tables) => {
                info!(path = %path.display(), ?tables, "plugin connected");
                Ok(Self {
                    io: Mutex::new(io),
                    child: Mutex::new(Some(child)),
                    closed: AtomicBool::new(false),
                    tables,
                    connections: AtomicU64::new(1),
                })
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(err)
            }
        }
    }

    /// Build a channel over already-connected byte streams. No subprocess
    /// is managed; used by in-process tests.
    pub fn over<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut io = ChannelIo {
            writer: Some(Box::new(writer)),
            reader: Box::new(reader),
            broken: false,
        };
        let tables = handshake(&mut io)?;
        Ok(Self {
            io: Mutex::new(io),
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
            tables,
            connections: AtomicU64::new(1),
        })
    }

    /// Table indices the plugin announced in its welcome.
    pub fn tables(&self) -> &[usize] {
        &self.tables
    }

    /// Send one request and read its response. Protocol-level `Error`
    /// responses come back as `Ok(Response::Error { .. })`; transport
    /// failures mark the channel broken permanently.
    pub fn call(&self, request: &Request) -> Result<Response> {
        let mut io = self.io.lock();
        if io.broken {
            return Err(PlugError::Transport("plugin channel is broken".into()));
        }
        let result = exchange(&mut io, request);
        if result.is_err() {
            io.broken = true;
            io.writer = None;
        }
        result
    }

    /// Gracefully shut the plugin down. Idempotent.
    pub fn close(&self) {
        self.close_with_grace(CLOSE_GRACE)
    }

    fn close_with_grace(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Best effort; a plugin that already died answers with a transport
        // error we do not care about.
        let _ = self.call(&Request::Shutdown);
        {
            let mut io = self.io.lock();
            io.writer = None;
            io.broken = true;
        }

        if let Some(mut child) = self.child.lock().take() {
            let deadline = Instant::now() + grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(%status, "plugin exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    _ => {
                        warn!("plugin did not exit in time, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for PluginChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn exchange(io: &mut ChannelIo, request: &Request) -> Result<Response> {
    let writer = io
        .writer
        .as_mut()
        .ok_or_else(|| PlugError::Transport("plugin channel is closed".into()))?;
    protocol::write_frame(writer, request)?;
    writer.flush()?;
    match protocol::read_frame(&mut io.reader)? {
        Some(response) => Ok(response),
        None => Err(PlugError::Transport("plugin closed the channel".into())),
    }
}

fn handshake(io: &mut ChannelIo) -> Result<Vec<usize>> {
    let response = exchange(
        io,
        &Request::Handshake {
            protocol_version: PROTOCOL_VERSION,
            cookie_key: COOKIE_KEY.to_string(),
            cookie_value: COOKIE_VALUE.to_string(),
        },
    )
    .map_err(|e| PlugError::Handshake(e.message()))?;

    match response {
        Response::Welcome {
            protocol_version,
            tables,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(PlugError::Handshake(format!(
                    "plugin speaks protocol {protocol_version}, host speaks {PROTOCOL_VERSION}"
                )));
            }
            Ok(tables)
        }
        Response::Error { message, .. } => Err(PlugError::Handshake(message)),
        other => Err(PlugError::Handshake(format!(
            "expected a welcome, got {other:?}"
        ))),
    }
}

impl PluginRpc for PluginChannel {
    fn open_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::SeqCst)
    }

    fn initialize(
        &self,
        connection: u64,
        table: usize,
        config: PluginConfig,
    ) -> Result<TableDescriptor> {
        let request = Request::Initialize { connection, table, config };
        match self.call(&request)?.into_result()? {
            Response::Schema { descriptor } => Ok(descriptor),
            other => Err(PlugError::Protocol(format!(
                "expected a schema, got {other:?}"
            ))),
        }
    }

    fn query(
        &self,
        connection: u64,
        table: usize,
        cursor: u64,
        constraint: &QueryConstraint,
    ) -> Result<(Vec<Vec<Value>>, bool)> {
        let request = Request::Query {
            connection,
            table,
            cursor,
            constraint: constraint.clone(),
        };
        match self.call(&request)?.into_result()? {
            Response::Rows { rows, no_more_rows } => Ok((rows, no_more_rows)),
            other => Err(PlugError::Protocol(format!(
                "expected rows, got {other:?}"
            ))),
        }
    }

    fn insert(&self, connection: u64, table: usize, rows: Vec<Vec<Value>>) -> Result<()> {
        expect_ack(self.call(&Request::Insert { connection, table, rows })?)
    }

    fn update(&self, connection: u64, table: usize, rows: Vec<Vec<Value>>) -> Result<()> {
        expect_ack(self.call(&Request::Update { connection, table, rows })?)
    }

    fn delete(&self, connection: u64, table: usize, keys: Vec<Value>) -> Result<()> {
        expect_ack(self.call(&Request::Delete { connection, table, keys })?)
    }

    fn close_table(&self, connection: u64, table: usize) -> Result<()> {
        expect_ack(self.call(&Request::CloseTable { connection, table })?)
    }
}

fn expect_ack(response: Response) -> Result<()> {
    match response.into_result()? {
        Response::Ack => Ok(()),
        other => Err(PlugError::Protocol(format!(
            "expected an acknowledgment, got {other:?}"
        ))),
    }
}

struct PoolEntry {
    channel: Arc<PluginChannel>,
    refcount: usize,
}

/// One subprocess per plugin executable, shared by every table attached
/// from it.
///
/// Tables check a channel out when they connect and release it when they
/// disconnect; the subprocess is shut down when the last reference goes.
#[derive(Default)]
pub struct ChannelPool {
    entries: Mutex<HashMap<PathBuf, PoolEntry>>,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel for `path`, spawning the plugin on first use.
    pub fn checkout(&self, path: &Path, args: &[String]) -> Result<Arc<PluginChannel>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.refcount += 1;
            return Ok(Arc::clone(&entry.channel));
        }

        let channel = Arc::new(PluginChannel::connect(path, args)?);
        entries.insert(
            path.to_path_buf(),
            PoolEntry {
                channel: Arc::clone(&channel),
                refcount: 1,
            },
        );
        Ok(channel)
    }

    /// Insert a pre-built channel under a synthetic key. Lets tests pool a
    /// channel built with [`PluginChannel::over`].
    pub fn adopt(&self, key: &Path, channel: Arc<PluginChannel>) {
        self.entries.lock().insert(
            key.to_path_buf(),
            PoolEntry {
                channel,
                refcount: 1,
            },
        );
    }

    /// Drop one reference to the channel for `path`; shuts the plugin down
    /// when nobody uses it anymore. The close is bounded, a stuck plugin is
    /// killed rather than waited on forever.
    pub fn release(&self, path: &Path) {
        let channel = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(path) else {
                return;
            };
            entry.refcount -= 1;
            if entry.refcount > 0 {
                return;
            }
            entries.remove(path).map(|e| e.channel)
        };
        if let Some(channel) = channel {
            debug!(path = %path.display(), "last table released, closing plugin");
            channel.close_with_grace(POOL_CLOSE_GRACE);
        }
    }

    /// Number of live plugin processes.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
