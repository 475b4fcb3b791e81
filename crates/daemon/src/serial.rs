//! Serial link to the PMC
//!
//! Owns the UART device node. The PMC speaks 9600 baud, 8 data bits, no
//! parity, one stop bit, no flow control; frames are CR-terminated ASCII.

use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};
use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

/// Frame terminator on the wire.
pub const FRAME_TERMINATOR: u8 = 0x0d;

/// Longest frame the reader will accept before declaring the link garbled.
const MAX_FRAME_LEN: usize = 1024;

/// Open and configure the PMC UART, returning its read and write halves.
pub async fn open(path: &Path) -> io::Result<(tokio::io::ReadHalf<File>, tokio::io::WriteHalf<File>)> {
    let file = OpenOptions::new().read(true).write(true).open(path).await?;

    configure_raw_9600(&file)?;

    info!("opened PMC serial port {} (9600 8N1)", path.display());
    Ok(tokio::io::split(file))
}

/// Configure the port for raw 8N1 communication at 9600 baud.
fn configure_raw_9600(file: &File) -> io::Result<()> {
    let mut tio = termios::tcgetattr(file).map_err(io::Error::from)?;

    termios::cfsetispeed(&mut tio, BaudRate::B9600).map_err(io::Error::from)?;
    termios::cfsetospeed(&mut tio, BaudRate::B9600).map_err(io::Error::from)?;
    termios::cfmakeraw(&mut tio);

    // 8N1, no hardware flow control, ignore modem control lines.
    tio.control_flags &= !(ControlFlags::CSTOPB | ControlFlags::CRTSCTS);
    tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;

    termios::tcsetattr(file, SetArg::TCSANOW, &tio).map_err(io::Error::from)
}

/// Buffered CR-framed reader over one half of the link.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(64),
        }
    }

    /// Read the next CR-terminated frame, stripped of the terminator and
    /// surrounding whitespace. `None` signals end-of-stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let n = self.inner.read_until(FRAME_TERMINATOR, &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", MAX_FRAME_LEN),
            ));
        }
        if self.buf.last() == Some(&FRAME_TERMINATOR) {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        Ok(Some(line))
    }
}

/// Writer for the other half of the link.
pub struct FrameWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: writer,
            buf: Vec::with_capacity(64),
        }
    }

    /// Append the terminator and put the whole frame on the wire in one
    /// write, retrying on partial writes.
    pub async fn write_frame(&mut self, payload: &str) -> io::Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(payload.as_bytes());
        self.buf.push(FRAME_TERMINATOR);
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await
    }
}
