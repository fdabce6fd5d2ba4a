//! Unix socket ingress for producers in other processes.
//!
//! Each connection carries a stream of frames (see [`encode_frame`]). The
//! listener thread decodes them into the same ingress channel the in-process
//! producers use.

use crate::error::{LoggerError, LoggerResult};
use crate::item::{FrameDecoder, LogItem, encode_frame};
use crate::logger::RuntimeShared;
use crate::worker::ExitGuard;
use shmlog_shared_memory::TerminationFlag;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;

struct Connection {
    id: usize,
    stream: UnixStream,
    decoder: FrameDecoder,
    closed: bool,
}

impl Connection {
    /// Read everything currently available. Returns true if any bytes arrived.
    fn pump(&mut self, shared: &RuntimeShared, buf: &mut [u8]) -> bool {
        let mut progressed = false;
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    progressed = true;
                    self.decoder.extend(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(connection = self.id, error = %e, "socket read failed, closing connection");
                    self.closed = true;
                    break;
                }
            }
        }

        loop {
            match self.decoder.next_item() {
                Ok(Some(item)) => {
                    if let Err(e) = item.validate() {
                        warn!(connection = self.id, error = %e, "dropping invalid socket item");
                        continue;
                    }
                    shared.channel.push(item);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = self.id, error = %e, "corrupt frame stream, closing connection");
                    self.closed = true;
                    break;
                }
            }
        }
        progressed
    }
}

/// Listening socket of one logger instance. Removes its socket file on drop.
#[derive(Debug)]
pub(crate) struct SocketIngress {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketIngress {
    /// Bind `path`, replacing a socket file left behind by a previous run.
    pub(crate) fn bind(path: &Path) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!(path = %path.display(), "socket ingress listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept and decode until a stop was requested and every connection
    /// has nothing more to read.
    pub(crate) fn run(&self, shared: &RuntimeShared, flag: &TerminationFlag) {
        let _guard = ExitGuard::new(shared, None, "ingress");
        let mut connections: Vec<Connection> = Vec::new();
        let mut next_id = 0usize;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            if shared.is_crashed() {
                break;
            }
            // Sampled before reading: anything written before the stop
            // request is read in this pass or an earlier one.
            let stopping = shared.stop_requested(flag);
            let mut progressed = false;

            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!(error = %e, "rejecting socket connection");
                            continue;
                        }
                        debug!(connection = next_id, "producer connected");
                        connections.push(Connection {
                            id: next_id,
                            stream,
                            decoder: FrameDecoder::new(),
                            closed: false,
                        });
                        next_id += 1;
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }

            for conn in &mut connections {
                progressed |= conn.pump(shared, &mut buf);
            }
            connections.retain(|conn| {
                if conn.closed {
                    if conn.decoder.pending() > 0 {
                        warn!(
                            connection = conn.id,
                            bytes = conn.decoder.pending(),
                            "connection closed mid-frame"
                        );
                    }
                    debug!(connection = conn.id, "producer disconnected");
                }
                !conn.closed
            });

            if stopping && !progressed {
                break;
            }
            if !progressed {
                std::thread::sleep(shared.poll_interval);
            }
        }

        for conn in &connections {
            if conn.decoder.pending() > 0 {
                warn!(
                    connection = conn.id,
                    bytes = conn.decoder.pending(),
                    "discarding incomplete frame at shutdown"
                );
            }
        }
        shared.close_ingress();
        debug!("socket ingress closed");
    }
}

impl Drop for SocketIngress {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Producer handle for a logger running in another process.
#[derive(Debug)]
pub struct RemoteProducer {
    stream: UnixStream,
}

impl RemoteProducer {
    /// Connect to the socket of a running logger.
    pub fn connect(path: impl AsRef<Path>) -> LoggerResult<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Send one item. Returns once the frame is handed to the kernel.
    pub fn submit(&mut self, item: &LogItem) -> LoggerResult<()> {
        item.validate()?;
        let frame = encode_frame(item)?;
        self.stream.write_all(&frame).map_err(LoggerError::from)
    }
}
