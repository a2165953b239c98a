//! The Carbon write path.
//!
//! A write happens in two phases. [`prepare_write`] turns samples into
//! plaintext buffers: one growing buffer for TCP, or datagram-sized buffers
//! for UDP that never split a line. [`CarbonWriter::send`] then takes the
//! carbon lock and streams every buffer onto the socket.
//!
//! Streaming goes through a small pipe: a producer thread runs the
//! configured [`Compressor`] into a bounded channel while the calling thread
//! copies chunks from the channel onto the connection, so a compressed
//! payload is never held in memory as a whole.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::carbon::{CarbonConnection, CarbonLink};
use crate::compress::{self, Compressor};
use crate::config::{CarbonTransport, GraphiteWriteConfig};
use crate::error::{PathError, WriteError};
use crate::model::Sample;

/// Largest datagram sent over UDP.
pub const UDP_MAX_BYTES: usize = 1024;

/// Largest chunk handed from the compressor to the socket.
const PIPE_CHUNK: usize = 64 * 1024;

/// Chunks buffered between the compressor and the socket.
const PIPE_DEPTH: usize = 4;

/// Buffers ready to send, plus the number of samples left out.
#[derive(Debug, Default)]
pub struct PreparedWrite {
    /// Plaintext Carbon lines, grouped per send.
    pub buffers: Vec<Vec<u8>>,
    /// Samples whose lines could not be rendered.
    pub skipped: u64,
}

impl PreparedWrite {
    /// All buffers back to back.
    pub fn concat(&self) -> Vec<u8> {
        self.buffers.concat()
    }
}

/// Renders samples into send buffers.
///
/// `lines` produces the Carbon lines of one sample. Samples it rejects are
/// logged, counted in [`PreparedWrite::skipped`] and left out. With UDP a
/// new buffer starts whenever the next line would push the current one past
/// [`UDP_MAX_BYTES`]; a single line is never split.
pub fn prepare_write<F>(
    samples: &[Sample],
    transport: CarbonTransport,
    buf_len_hint: usize,
    mut lines: F,
) -> PreparedWrite
where
    F: FnMut(&Sample) -> Result<Vec<Vec<u8>>, PathError>,
{
    let capacity = match transport {
        CarbonTransport::Udp => UDP_MAX_BYTES,
        CarbonTransport::Tcp => buf_len_hint,
    };
    let mut prepared = PreparedWrite::default();
    let mut current = Vec::with_capacity(capacity);

    for sample in samples {
        let sample_lines = match lines(sample) {
            Ok(sample_lines) => sample_lines,
            Err(e) => {
                debug!(?sample, error = %e, "sample parse error");
                prepared.skipped += 1;
                continue;
            }
        };

        for line in sample_lines {
            if transport == CarbonTransport::Udp
                && !current.is_empty()
                && current.len() + line.len() > UDP_MAX_BYTES
            {
                prepared
                    .buffers
                    .push(std::mem::replace(&mut current, Vec::with_capacity(capacity)));
            }
            current.extend_from_slice(&line);
        }
    }

    prepared.buffers.push(current);
    prepared
}

/// The single writer to one carbon endpoint.
#[derive(Debug)]
pub struct CarbonWriter {
    transport: CarbonTransport,
    compressor: Box<dyn Compressor>,
    link: Mutex<CarbonLink>,
}

impl CarbonWriter {
    /// Creates a writer for the configured endpoint. Nothing is dialed yet.
    pub fn new(config: &GraphiteWriteConfig, dial_timeout: Duration) -> Self {
        Self::with_compressor(
            config,
            dial_timeout,
            compress::from_config(config.compress_type, &config.lz4_preferences),
        )
    }

    /// Creates a writer with an explicit compressor.
    pub fn with_compressor(
        config: &GraphiteWriteConfig,
        dial_timeout: Duration,
        compressor: Box<dyn Compressor>,
    ) -> Self {
        Self {
            transport: config.carbon_transport,
            compressor,
            link: Mutex::new(CarbonLink::new(
                config.carbon_address.clone(),
                config.carbon_transport,
                dial_timeout,
                config.carbon_reconnect_interval,
            )),
        }
    }

    /// The transport buffers must be prepared for.
    pub fn transport(&self) -> CarbonTransport {
        self.transport
    }

    /// Sends every buffer to carbon, in order.
    ///
    /// Holds the carbon lock for the whole call, so concurrent writers queue
    /// up behind each other. `token` is checked once, after the lock is
    /// taken and before any I/O. The first failing buffer closes the
    /// connection and ends the call; later buffers are not attempted.
    ///
    /// Returns the number of bytes written to the socket.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Cancelled`] if the token is already cancelled,
    /// a dial error if carbon cannot be reached, or a send or compression
    /// error if streaming a buffer fails.
    pub fn send(&self, buffers: &[Vec<u8>], token: &CancelToken) -> Result<u64, WriteError> {
        let mut link = self.link.lock();

        if token.is_cancelled() {
            return Err(WriteError::Cancelled);
        }

        let mut total = 0;
        for buffer in buffers {
            let connection = link.connect()?;
            match pipe_to_connection(self.compressor.as_ref(), buffer, connection) {
                Ok(written) => {
                    debug!(
                        connection = %connection,
                        bytes = written,
                        compression = self.compressor.name(),
                        "sent"
                    );
                    total += written;
                }
                Err(e) => {
                    if let WriteError::Send { source } = &e
                        && matches!(
                            source.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        )
                    {
                        error!(address = link.address(), "pipe is broken, connection closed");
                    }
                    link.disconnect();
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Closes the carbon connection, waiting for an in-flight send.
    pub fn close(&self) {
        self.link.lock().disconnect();
    }

    /// Returns true if a carbon connection is open.
    pub fn is_connected(&self) -> bool {
        self.link.lock().is_connected()
    }
}

/// Streams one buffer through the compressor onto the connection.
fn pipe_to_connection(
    compressor: &dyn Compressor,
    buffer: &[u8],
    connection: &mut CarbonConnection,
) -> Result<u64, WriteError> {
    let (tx, rx) = channel::bounded::<Vec<u8>>(PIPE_DEPTH);

    thread::scope(|scope| {
        let producer = scope.spawn(move || {
            let mut writer = ChannelWriter { tx };
            compressor.compress(buffer, &mut writer)
        });

        let copied = copy_chunks(&rx, connection);
        // Unblocks the producer if the copy stopped early.
        drop(rx);

        let produced = producer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("compressor panicked")));

        let written = copied.map_err(|source| WriteError::Send { source })?;
        produced.map_err(|source| WriteError::Compression { source })?;
        Ok(written)
    })
}

fn copy_chunks(rx: &Receiver<Vec<u8>>, connection: &mut CarbonConnection) -> io::Result<u64> {
    let mut written = 0;
    for chunk in rx {
        connection.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    connection.flush()?;
    Ok(written)
}

/// Write half of the pipe. Dropping it ends the stream.
struct ChannelWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(PIPE_CHUNK);
        self.tx
            .send(buf[..n].to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
