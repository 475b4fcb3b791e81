//! Protocol engine: command/response multiplexing over the serial link
//!
//! Presents a synchronous request API while concurrently consuming frames
//! from the PMC. A single-slot pending command enforces the half-duplex
//! discipline the firmware requires; unsolicited ALERT frames are turned
//! into decoded interrupt events on a broadcast channel.

use super::frame::{self, Frame};
use super::registers::{self, Register, Value};
use super::PmcError;
use crate::serial::{FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

/// Default completion deadline for getters and setters.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Echo requests wait on an ALERT round-trip and get a longer deadline.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);
/// After a timeout the line is drained for one frame or this much idle time.
const DRAIN_IDLE: Duration = Duration::from_millis(500);

const COMMAND_QUEUE_DEPTH: usize = 16;
const FRAME_QUEUE_DEPTH: usize = 64;
const INTERRUPT_FANOUT_DEPTH: usize = 64;

/// Front-panel buttons wired to the PMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    UsbCopy,
    LcdUp,
    LcdDown,
}

/// Decoded interrupt delivered to subscribers.
///
/// Button interrupts arrive as edges with no level information; tracking
/// pressed state is the subscriber's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PmcInterrupt {
    PowerSupplyChanged { socket: u8, energized: bool },
    DrivePresenceMaskChanged { mask: u8, previous: u8 },
    ButtonEdge { button: Button },
}

/// What kind of frame completes the pending request.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Response(&'static Register),
    Ack,
    AlertEcho,
}

struct Request {
    wire: String,
    expect: Expect,
    timeout: Duration,
    reply: oneshot::Sender<Result<Option<Value>, PmcError>>,
}

struct Pending {
    req: Request,
    deadline: Instant,
    retried: bool,
}

/// Cloneable handle to the protocol engine.
#[derive(Clone)]
pub struct PmcClient {
    cmd_tx: mpsc::Sender<Request>,
    interrupt_tx: broadcast::Sender<PmcInterrupt>,
}

impl PmcClient {
    /// Spawn the engine over a framed transport and return its handle.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (interrupt_tx, _) = broadcast::channel(INTERRUPT_FANOUT_DEPTH);

        tokio::spawn(read_frames(reader, frame_tx));

        let engine = Engine {
            writer: FrameWriter::new(writer),
            cmd_rx,
            frame_rx,
            interrupt_tx: interrupt_tx.clone(),
            pending: None,
            alert_backlog: 0,
            last_dp0: None,
        };
        tokio::spawn(engine.run());

        Self {
            cmd_tx,
            interrupt_tx,
        }
    }

    /// Subscribe to decoded interrupts. Slow subscribers lag and lose the
    /// oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<PmcInterrupt> {
        self.interrupt_tx.subscribe()
    }

    /// Read a register by code.
    pub async fn get(&self, code: &str) -> Result<Value, PmcError> {
        let reg = registers::lookup(code)
            .ok_or_else(|| PmcError::Unsupported(format!("unknown register {:?}", code)))?;
        self.get_reg(reg).await
    }

    /// Write a register by code.
    pub async fn set(&self, code: &str, value: Value) -> Result<(), PmcError> {
        let reg = registers::lookup(code)
            .ok_or_else(|| PmcError::Unsupported(format!("unknown register {:?}", code)))?;
        self.set_reg(reg, value).await
    }

    pub async fn get_reg(&self, reg: &'static Register) -> Result<Value, PmcError> {
        self.get_reg_timeout(reg, DEFAULT_TIMEOUT).await
    }

    /// Read with a caller-chosen deadline.
    pub async fn get_reg_timeout(
        &self,
        reg: &'static Register,
        timeout: Duration,
    ) -> Result<Value, PmcError> {
        if !reg.access.readable() {
            return Err(PmcError::Unsupported(format!(
                "{} is not readable",
                reg.code
            )));
        }
        let completed = self
            .request(reg.code.to_string(), Expect::Response(reg), timeout)
            .await?;
        completed.ok_or_else(|| PmcError::UnexpectedFrame("completion without value".to_string()))
    }

    pub async fn set_reg(&self, reg: &'static Register, value: Value) -> Result<(), PmcError> {
        self.set_reg_timeout(reg, value, DEFAULT_TIMEOUT).await
    }

    /// Write with a caller-chosen deadline. Completes on `ACK`.
    pub async fn set_reg_timeout(
        &self,
        reg: &'static Register,
        value: Value,
        timeout: Duration,
    ) -> Result<(), PmcError> {
        if !reg.access.writable() {
            return Err(PmcError::Unsupported(format!(
                "{} is not writable",
                reg.code
            )));
        }
        let wire = format!("{}={}", reg.code, registers::encode(reg, &value)?);
        self.request(wire, Expect::Ack, timeout).await.map(|_| ())
    }

    /// Write `ECH` and wait for the answering ALERT round-trip.
    pub async fn echo(&self, value: u8) -> Result<(), PmcError> {
        let wire = format!("{}={:02X}", registers::ECH.code, value);
        self.request(wire, Expect::AlertEcho, ECHO_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn get_u8(&self, reg: &'static Register) -> Result<u8, PmcError> {
        self.get_reg(reg).await?.as_byte().ok_or_else(|| {
            PmcError::FrameMalformed(format!("{}: expected byte value", reg.code))
        })
    }

    pub async fn get_u16(&self, reg: &'static Register) -> Result<u16, PmcError> {
        self.get_reg(reg).await?.as_word().ok_or_else(|| {
            PmcError::FrameMalformed(format!("{}: expected word value", reg.code))
        })
    }

    pub async fn get_text(&self, reg: &'static Register) -> Result<String, PmcError> {
        match self.get_reg(reg).await? {
            Value::Text(t) => Ok(t),
            other => Err(PmcError::FrameMalformed(format!(
                "{}: expected text value, got {:?}",
                reg.code, other
            ))),
        }
    }

    pub async fn set_u8(&self, reg: &'static Register, value: u8) -> Result<(), PmcError> {
        self.set_reg(reg, Value::Byte(value)).await
    }

    pub async fn set_text(&self, reg: &'static Register, text: &str) -> Result<(), PmcError> {
        self.set_reg(reg, Value::Text(text.to_string())).await
    }

    async fn request(
        &self,
        wire: String,
        expect: Expect,
        timeout: Duration,
    ) -> Result<Option<Value>, PmcError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Request {
                wire,
                expect,
                timeout,
                reply,
            })
            .await
            .map_err(|_| PmcError::LinkIO("protocol engine stopped".to_string()))?;
        rx.await
            .map_err(|_| PmcError::LinkIO("protocol engine stopped".to_string()))?
    }
}

/// Reader task: frames off the wire into the engine's queue.
async fn read_frames<R>(reader: R, frame_tx: mpsc::Sender<Result<Frame, PmcError>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.read_frame().await {
            Ok(Some(line)) => match frame::classify(&line) {
                Ok(None) => {}
                Ok(Some(f)) => {
                    if frame_tx.send(Ok(f)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    if frame_tx.send(Err(e)).await.is_err() {
                        return;
                    }
                }
            },
            Ok(None) => {
                debug!("PMC serial stream ended");
                return;
            }
            Err(e) => {
                if frame_tx.send(Err(PmcError::from(e))).await.is_err() {
                    return;
                }
            }
        }
    }
}

struct Engine<W> {
    writer: FrameWriter<W>,
    cmd_rx: mpsc::Receiver<Request>,
    frame_rx: mpsc::Receiver<Result<Frame, PmcError>>,
    interrupt_tx: broadcast::Sender<PmcInterrupt>,
    pending: Option<Pending>,
    /// ALERT frames seen but not yet followed up with an `ISR` read.
    alert_backlog: usize,
    /// Most recent drive-presence bitmap, for interrupt diffs.
    last_dp0: Option<u8>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Engine<W> {
    async fn run(mut self) {
        loop {
            // Every observed ALERT gets its ISR read before the engine
            // accepts another user command.
            if self.pending.is_none() && self.alert_backlog > 0 {
                self.service_alerts().await;
                continue;
            }

            if let Some(deadline) = self.pending.as_ref().map(|p| p.deadline) {
                tokio::select! {
                    item = self.frame_rx.recv() => match item {
                        Some(f) => self.on_frame_pending(f).await,
                        None => {
                            self.fail_pending(PmcError::LinkIO("serial link closed".to_string()));
                            return;
                        }
                    },
                    _ = time::sleep_until(deadline) => self.on_timeout().await,
                }
            } else {
                tokio::select! {
                    req = self.cmd_rx.recv() => match req {
                        Some(r) => self.issue(r).await,
                        None => return,
                    },
                    item = self.frame_rx.recv() => match item {
                        Some(f) => self.on_frame_idle(f),
                        None => return,
                    },
                }
            }
        }
    }

    async fn issue(&mut self, req: Request) {
        let deadline = Instant::now() + req.timeout;
        let pending = Pending {
            req,
            deadline,
            retried: false,
        };
        match self.writer.write_frame(&pending.req.wire).await {
            Ok(()) => self.pending = Some(pending),
            Err(e) => self.retry_or_fail(pending, PmcError::from(e)).await,
        }
    }

    fn complete(&mut self, result: Result<Option<Value>, PmcError>) {
        if let Some(p) = self.pending.take() {
            let _ = p.req.reply.send(result);
        }
    }

    fn fail_pending(&mut self, err: PmcError) {
        self.complete(Err(err));
    }

    /// Recoverable faults drain the line and replay the request once.
    async fn retry_or_fail(&mut self, mut pending: Pending, err: PmcError) {
        let recoverable = matches!(
            err,
            PmcError::LinkIO(_) | PmcError::FrameMalformed(_) | PmcError::UnexpectedFrame(_)
        );
        if recoverable && !pending.retried {
            warn!("retrying {:?} after {}", pending.req.wire, err);
            self.drain().await;
            pending.retried = true;
            pending.deadline = Instant::now() + pending.req.timeout;
            match self.writer.write_frame(&pending.req.wire).await {
                Ok(()) => self.pending = Some(pending),
                Err(e) => {
                    let _ = pending.req.reply.send(Err(PmcError::from(e)));
                }
            }
        } else {
            let _ = pending.req.reply.send(Err(err));
        }
    }

    async fn on_frame_pending(&mut self, item: Result<Frame, PmcError>) {
        let frame = match item {
            Ok(f) => f,
            Err(e) => {
                if let Some(pending) = self.pending.take() {
                    self.retry_or_fail(pending, e).await;
                }
                return;
            }
        };

        match frame {
            Frame::Alert => {
                self.alert_backlog += 1;
                if matches!(
                    self.pending.as_ref().map(|p| p.req.expect),
                    Some(Expect::AlertEcho)
                ) {
                    self.complete(Ok(None));
                }
            }
            Frame::Ack => {
                if matches!(
                    self.pending.as_ref().map(|p| p.req.expect),
                    Some(Expect::Ack)
                ) {
                    self.complete(Ok(None));
                } else {
                    warn!("unexpected ACK frame dropped");
                }
            }
            Frame::Err => {
                let wire = self
                    .pending
                    .as_ref()
                    .map(|p| p.req.wire.clone())
                    .unwrap_or_default();
                self.complete(Err(PmcError::CommandRejected(wire)));
            }
            Frame::Response { code, value } => {
                let Some(pending) = self.pending.take() else {
                    return;
                };
                match pending.req.expect {
                    Expect::Response(reg) if reg.code == code => {
                        match registers::decode(reg, &value) {
                            Ok(v) => {
                                if reg.code == registers::DP0.code {
                                    self.last_dp0 = v.as_byte();
                                }
                                let _ = pending.req.reply.send(Ok(Some(v)));
                            }
                            Err(e) => self.retry_or_fail(pending, e).await,
                        }
                    }
                    _ => {
                        let err = PmcError::UnexpectedFrame(format!(
                            "{}={} while awaiting completion of {:?}",
                            code, value, pending.req.wire
                        ));
                        self.retry_or_fail(pending, err).await;
                    }
                }
            }
        }
    }

    async fn on_timeout(&mut self) {
        let wire = self
            .pending
            .as_ref()
            .map(|p| p.req.wire.clone())
            .unwrap_or_default();
        warn!("PMC request {:?} timed out", wire);
        self.complete(Err(PmcError::Timeout(wire)));
        self.drain().await;
    }

    /// Discard one frame window: the next frame, or 500 ms of idle line.
    async fn drain(&mut self) {
        match time::timeout(DRAIN_IDLE, self.frame_rx.recv()).await {
            Ok(Some(Ok(Frame::Alert))) => self.alert_backlog += 1,
            Ok(Some(item)) => debug!("drained frame: {:?}", item),
            Ok(None) => {}
            Err(_) => {}
        }
    }

    fn on_frame_idle(&mut self, item: Result<Frame, PmcError>) {
        match item {
            Ok(Frame::Alert) => self.alert_backlog += 1,
            Ok(Frame::Ack) => warn!("unexpected ACK frame dropped"),
            Ok(Frame::Err) => warn!("unexpected ERR frame dropped"),
            Ok(Frame::Response { code, value }) => {
                warn!("unsolicited response {}={} dropped", code, value)
            }
            Err(e) => warn!("bad frame on idle link: {}", e),
        }
    }

    async fn service_alerts(&mut self) {
        while self.alert_backlog > 0 {
            self.alert_backlog -= 1;
            let isr = match self.transact(&registers::ISR).await {
                Ok(isr) => isr,
                Err(e) => {
                    warn!("ISR read after ALERT failed: {}", e);
                    continue;
                }
            };
            self.dispatch_isr(isr).await;
        }
    }

    /// Follow-up getter issued while servicing interrupts. Runs on the same
    /// single-slot discipline as user commands; further ALERTs seen here are
    /// queued behind the one being serviced.
    async fn transact(&mut self, reg: &'static Register) -> Result<u8, PmcError> {
        self.writer
            .write_frame(reg.code)
            .await
            .map_err(PmcError::from)?;
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let item = tokio::select! {
                item = self.frame_rx.recv() => item,
                _ = time::sleep_until(deadline) => {
                    return Err(PmcError::Timeout(reg.code.to_string()));
                }
            };
            match item {
                None => return Err(PmcError::LinkIO("serial link closed".to_string())),
                Some(Ok(Frame::Alert)) => self.alert_backlog += 1,
                Some(Ok(Frame::Err)) => {
                    return Err(PmcError::CommandRejected(reg.code.to_string()))
                }
                Some(Ok(Frame::Response { code, value })) if code == reg.code => {
                    let v = registers::decode(reg, &value)?;
                    return v.as_byte().ok_or_else(|| {
                        PmcError::FrameMalformed(format!("{}: expected byte value", reg.code))
                    });
                }
                Some(Ok(f)) => debug!("dropping frame {:?} during interrupt service", f),
                Some(Err(e)) => warn!("bad frame during interrupt service: {}", e),
            }
        }
    }

    /// Decode one ISR value, emitting events in ascending bit order.
    async fn dispatch_isr(&mut self, isr: u8) {
        debug!("ISR=0x{:02x}", isr);
        for bit in 0..8u8 {
            if isr & (1 << bit) == 0 {
                continue;
            }
            match bit {
                // Bit 0 is reserved.
                0 => {}
                // Power socket change; STA carries the current state
                // (bit 1 = socket 2, bit 2 = socket 1, same bit positions
                // as the interrupt).
                1 | 2 => {
                    let socket = if bit == 1 { 2 } else { 1 };
                    match self.transact(&registers::STA).await {
                        Ok(sta) => {
                            let energized = sta & (1 << bit) != 0;
                            self.emit(PmcInterrupt::PowerSupplyChanged { socket, energized });
                        }
                        Err(e) => warn!("STA follow-up for socket {} failed: {}", socket, e),
                    }
                }
                3 => self.emit(PmcInterrupt::ButtonEdge {
                    button: Button::UsbCopy,
                }),
                4 => match self.transact(&registers::DP0).await {
                    Ok(mask) => {
                        let previous = self.last_dp0.unwrap_or(mask);
                        self.last_dp0 = Some(mask);
                        self.emit(PmcInterrupt::DrivePresenceMaskChanged { mask, previous });
                    }
                    Err(e) => warn!("DP0 follow-up failed: {}", e),
                },
                5 => self.emit(PmcInterrupt::ButtonEdge {
                    button: Button::LcdUp,
                }),
                6 => self.emit(PmcInterrupt::ButtonEdge {
                    button: Button::LcdDown,
                }),
                // Echo acknowledgement; the echo request already completed
                // on the ALERT itself.
                7 => debug!("echo acknowledgement"),
                _ => unreachable!(),
            }
        }
    }

    fn emit(&self, event: PmcInterrupt) {
        // Send fails only when nobody subscribes, which is fine.
        let _ = self.interrupt_tx.send(event);
    }
}
