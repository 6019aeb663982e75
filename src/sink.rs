//! Pluggable event stream sinks
//!
//! The worker is the only caller of a [`Sink`] and the only thread allowed to
//! block on it. Any `Err` from `connect`/`write_all`/`flush` moves the worker
//! into its disconnected state; the sink itself never retries.
//!
//! - [`TcpSink`]: outbound connection to a viewer (the production default)
//! - [`FileSink`]: appends the stream to a file for offline capture
//! - [`NullSink`]: accepts and discards everything
//! - [`SharedBufferSink`]: in-memory, with switchable failures, for embedding
//!   hosts and tests

use crate::config::{BridgeConfig, SinkConfig};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub trait Sink: Send {
    /// (Re)establish the connection, discarding any previous one
    fn connect(&mut self) -> io::Result<()>;

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Best-effort close; never fails
    fn close(&mut self);

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "sink is not connected")
}

/// Build the sink named by the configuration
pub fn from_config(config: &BridgeConfig) -> Box<dyn Sink> {
    match &config.sink {
        SinkConfig::Tcp { address } => Box::new(TcpSink::new(
            address.clone(),
            config.connect_timeout(),
            config.write_timeout(),
        )),
        SinkConfig::File { path } => Box::new(FileSink::new(path.clone())),
        SinkConfig::Null => Box::new(NullSink::default()),
    }
}

pub struct TcpSink {
    address: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    stream: Option<BufWriter<TcpStream>>,
}

impl TcpSink {
    pub fn new(address: impl Into<String>, connect_timeout: Duration, write_timeout: Duration) -> Self {
        TcpSink {
            address: address.into(),
            connect_timeout,
            write_timeout,
            stream: None,
        }
    }
}

impl Sink for TcpSink {
    fn connect(&mut self) -> io::Result<()> {
        self.close();

        let mut last_err = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    // Bounds how long a stalled viewer can hold the worker
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    self.stream = Some(BufWriter::with_capacity(64 * 1024, stream));
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} resolved to no addresses", self.address),
            )
        }))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.as_mut().ok_or_else(not_connected)?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.as_mut().ok_or_else(not_connected)?.flush()
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
            let _ = stream.get_ref().shutdown(Shutdown::Both);
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

pub struct FileSink {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSink {
            path: path.into(),
            file: None,
        }
    }
}

impl Sink for FileSink {
    fn connect(&mut self) -> io::Result<()> {
        self.close();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.file = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.as_mut().ok_or_else(not_connected)?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().ok_or_else(not_connected)?.flush()
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

#[derive(Debug, Default)]
pub struct NullSink {
    bytes_discarded: u64,
}

impl NullSink {
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }
}

impl Sink for NullSink {
    fn connect(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.bytes_discarded += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn describe(&self) -> String {
        "null".to_string()
    }
}

#[derive(Debug, Default)]
struct SharedBufferState {
    /// One byte stream per successful connect
    connections: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    connect_attempts: AtomicU64,
}

/// In-memory sink; clones share the same buffers and switches
#[derive(Debug, Clone, Default)]
pub struct SharedBufferSink {
    state: Arc<SharedBufferState>,
}

impl SharedBufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future `connect` calls fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make future writes fail, as a vanished viewer would
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Bytes of every connection, in connect order
    pub fn connections(&self) -> Vec<Vec<u8>> {
        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bytes written over the most recent connection
    pub fn contents(&self) -> Vec<u8> {
        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

impl Sink for SharedBufferSink {
    fn connect(&mut self) -> io::Result<()> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            self.state.connected.store(false, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "shared buffer refusing connections",
            ));
        }
        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Vec::new());
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(not_connected());
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            self.state.connected.store(false, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shared buffer write failure"));
        }
        let mut connections = self
            .state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.last_mut() {
            Some(current) => {
                current.extend_from_slice(buf);
                Ok(())
            }
            None => Err(not_connected()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.state.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(not_connected())
        }
    }

    fn close(&mut self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "shared-buffer".to_string()
    }
}
