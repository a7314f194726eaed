//! Serial ports the bus engine writes frames to.
//!
//! Writing goes through the [`SerialPort`] trait.  Bytes arriving from the
//! device are delivered separately, as chunks on a [`ByteReceiver`], in
//! whatever pieces the I/O layer happens to produce.  The engine is
//! responsible for reassembling them into frames.
//!
//! Two implementations ship with the crate:
//!
//! - [`DevicePort`] – a real serial device at 1 Mbaud, 8N1.
//! - [`SimulatedPort`] – an in-process model of a chain of Dynamixel
//!   motors that answers reads and writes from a simulated control table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bert_types::{BertError, MotorConfiguration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, info, warn};

use crate::codec::{self, BROADCAST_ID, instruction};
use crate::conversions::{self, address};

/// Chunks of bytes read from a device, in arrival order.
pub type ByteReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Write side of a serial bus.
#[async_trait]
pub trait SerialPort: Send {
    /// Name of the bus this port drives.
    fn name(&self) -> &str;

    /// Write one complete frame.
    async fn write(&mut self, frame: &[u8]) -> Result<(), BertError>;
}

// ────────────────────────────────────────────────────────────────────────────
// DevicePort
// ────────────────────────────────────────────────────────────────────────────

/// Line rate of every Dynamixel bus.
pub const BAUD_RATE: u32 = 1_000_000;

type DeviceWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A serial device opened at [`BAUD_RATE`], 8N1, without flow control.
///
/// Reads and writes are readiness-driven, so a read waiting for the device
/// never holds up a write.
pub struct DevicePort {
    name: String,
    writer: DeviceWriter,
}

impl DevicePort {
    /// Open `path`, configure the line and start a reader task that forwards
    /// every chunk read.
    pub async fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<(Self, ByteReceiver), BertError> {
        let name = name.into();
        let path = path.as_ref();
        let stream = tokio_serial::new(path.to_string_lossy(), BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| BertError::Device {
                bus: name.clone(),
                details: format!("cannot open {}: {e}", path.display()),
            })?;
        info!(bus = %name, path = %path.display(), baud = BAUD_RATE, "serial device opened");
        Ok(Self::from_stream(name, stream))
    }

    /// Drive an already open stream.
    pub fn from_stream<S>(name: impl Into<String>, stream: S) -> (Self, ByteReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (mut reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let bus = name.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        info!(bus = %bus, "serial device closed");
                        break;
                    }
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(bus = %bus, error = %e, "serial read failed");
                        break;
                    }
                }
            }
        });

        (Self { name, writer: Box::new(writer) }, rx)
    }
}

#[async_trait]
impl SerialPort for DevicePort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), BertError> {
        self.writer.write_all(frame).await.map_err(|e| BertError::Device {
            bus: self.name.clone(),
            details: e.to_string(),
        })?;
        self.writer.flush().await.map_err(|e| BertError::Device {
            bus: self.name.clone(),
            details: e.to_string(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimulatedPort
// ────────────────────────────────────────────────────────────────────────────

const TABLE_SIZE: usize = 0x32;

#[derive(Debug, Default)]
struct SimState {
    tables: HashMap<u8, [u8; TABLE_SIZE]>,
    faults: HashMap<u8, u8>,
    written: Vec<Vec<u8>>,
    written_at: Vec<std::time::Instant>,
}

impl SimState {
    fn status(&self, id: u8, params: &[u8]) -> Vec<u8> {
        let error = self.faults.get(&id).copied().unwrap_or(0);
        codec::status_frame(id, error, params)
    }

    fn read(&self, id: u8, addr: u8, count: u8) -> Option<Vec<u8>> {
        let table = self.tables.get(&id)?;
        let start = usize::from(addr);
        let end = (start + usize::from(count)).min(TABLE_SIZE);
        Some(self.status(id, table.get(start..end).unwrap_or_default()))
    }

    fn store(&mut self, id: u8, addr: u8, data: &[u8]) {
        let Some(table) = self.tables.get_mut(&id) else {
            return;
        };
        for (offset, byte) in data.iter().enumerate() {
            if let Some(slot) = table.get_mut(usize::from(addr) + offset) {
                *slot = *byte;
            }
        }
        // Motion is instantaneous in simulation.
        if addr == address::GOAL_POSITION && data.len() >= 2 {
            let present = usize::from(address::PRESENT_POSITION);
            table[present] = data[0];
            table[present + 1] = data[1];
        }
    }

    /// Apply one instruction frame and return the reply bytes, if any.
    fn execute(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.len() < 6 {
            return Vec::new();
        }
        let id = frame[2];
        let params = &frame[5..frame.len() - 1];
        if codec::checksum(frame) != frame[frame.len() - 1] {
            if id == BROADCAST_ID || !self.tables.contains_key(&id) {
                return Vec::new();
            }
            return codec::status_frame(id, 0x04, &[]);
        }
        match frame[4] {
            instruction::PING if self.tables.contains_key(&id) => self.status(id, &[]),
            instruction::READ if params.len() == 2 => {
                self.read(id, params[0], params[1]).unwrap_or_default()
            }
            instruction::WRITE if !params.is_empty() && self.tables.contains_key(&id) => {
                self.store(id, params[0], &params[1..]);
                self.status(id, &[])
            }
            instruction::SYNC_WRITE if params.len() >= 2 => {
                let addr = params[0];
                let width = usize::from(params[1]);
                for entry in params[2..].chunks(width + 1) {
                    if entry.len() == width + 1 {
                        self.store(entry[0], addr, &entry[1..]);
                    }
                }
                Vec::new()
            }
            instruction::BULK_READ if !params.is_empty() => params[1..]
                .chunks(3)
                .filter(|e| e.len() == 3)
                .filter_map(|e| self.read(e[1], e[2], e[0]))
                .flatten()
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Handle for inspecting and perturbing a [`SimulatedPort`] after it has
/// been handed to an engine.
#[derive(Clone, Debug)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Every frame written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).written.clone()
    }

    /// When each frame in [`written`](Self::written) reached the port.
    pub fn write_times(&self) -> Vec<std::time::Instant> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).written_at.clone()
    }

    /// Make motor `id` report `bits` in the error byte of every reply.
    pub fn inject_fault(&self, id: u8, bits: u8) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .faults
            .insert(id, bits);
    }

    pub fn clear_faults(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).faults.clear();
    }

    /// Overwrite one byte of a motor's control table.
    pub fn set_register(&self, id: u8, addr: u8, value: u8) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = state.tables.get_mut(&id).and_then(|t| t.get_mut(usize::from(addr))) {
            *slot = value;
        }
    }
}

/// An in-process chain of motors that answers like real hardware.
pub struct SimulatedPort {
    name: String,
    state: Arc<Mutex<SimState>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    chunk_size: usize,
}

impl SimulatedPort {
    /// Simulate the motors in `motors`, each starting at the position
    /// recorded in its configuration with torque enabled.
    pub fn new(name: impl Into<String>, motors: &[MotorConfiguration]) -> (Self, ByteReceiver) {
        let mut state = SimState::default();
        for mc in motors {
            let mut table = [0u8; TABLE_SIZE];
            let mut put = |addr: u8, value: u16| {
                let at = usize::from(addr);
                table[at] = (value & 0xFF) as u8;
                table[at + 1] = (value >> 8) as u8;
            };
            put(address::MINIMUM_ANGLE, conversions::degree_to_raw(mc, mc.min_angle));
            put(address::MAXIMUM_ANGLE, conversions::degree_to_raw(mc, mc.max_angle));
            put(0x0E, 0xFF03);
            let position = conversions::degree_to_raw(mc, mc.position);
            put(address::GOAL_POSITION, position);
            put(address::PRESENT_POSITION, position);
            put(address::GOAL_SPEED, conversions::speed_to_raw(mc, mc.speed));
            put(address::TORQUE_LIMIT, conversions::torque_to_raw(mc, mc.torque));
            table[usize::from(address::TORQUE_ENABLE)] = 1;
            table[usize::from(address::PRESENT_VOLTAGE)] = 120;
            table[usize::from(address::PRESENT_TEMPERATURE)] = 30;
            state.tables.insert(mc.id, table);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let port = Self {
            name: name.into(),
            state: Arc::new(Mutex::new(state)),
            tx,
            chunk_size: usize::MAX,
        };
        (port, rx)
    }

    /// Deliver replies in pieces of at most `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl SerialPort for SimulatedPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), BertError> {
        let reply = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.written.push(frame.to_vec());
            state.written_at.push(std::time::Instant::now());
            state.execute(frame)
        };
        debug!(bus = %self.name, out = %codec::dump(frame), "simulated write");
        for chunk in reply.chunks(self.chunk_size) {
            self.tx.send(chunk.to_vec()).map_err(|_| BertError::Device {
                bus: self.name.clone(),
                details: "simulated reader has gone away".into(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bert_types::{Joint, Limb, MotorKind};

    fn motors() -> Vec<MotorConfiguration> {
        vec![
            MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 36, MotorKind::Ax12).with_limits(-60.0, 60.0),
            MotorConfiguration::new(Joint::BustY, Limb::Torso, "upper", 31, MotorKind::Mx64),
        ]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn device_writes_while_a_read_is_pending() -> Result<(), Box<dyn std::error::Error>> {
        use std::time::Duration;
        use tokio::time::timeout;

        let (host, mut device) = tokio::net::UnixStream::pair()?;
        let (mut port, mut rx) = DevicePort::from_stream("upper", host);
        // Let the reader task park on an empty line first.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = codec::read_frame(36, address::PRESENT_TEMPERATURE, 1);
        timeout(Duration::from_secs(1), port.write(&frame)).await??;
        let mut seen = vec![0u8; frame.len()];
        timeout(Duration::from_secs(1), device.read_exact(&mut seen)).await??;
        assert_eq!(seen, frame);

        let status = codec::status_frame(36, 0, &[30]);
        device.write_all(&status).await?;
        let mut received = Vec::new();
        while received.len() < status.len() {
            received.extend(timeout(Duration::from_secs(1), rx.recv()).await?.ok_or("reader stopped")?);
        }
        assert_eq!(received, status);
        Ok(())
    }

    #[tokio::test]
    async fn device_reader_stops_when_the_line_closes() -> Result<(), Box<dyn std::error::Error>> {
        let (host, device) = tokio::io::duplex(64);
        let (port, mut rx) = DevicePort::from_stream("lower", host);
        assert_eq!(port.name(), "lower");
        drop(device);
        assert!(rx.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_device_is_a_device_error() {
        let opened = DevicePort::open("upper", "/dev/bert-no-such-bus").await;
        assert!(matches!(opened, Err(BertError::Device { bus, .. }) if bus == "upper"));
    }

    #[tokio::test]
    async fn read_is_answered_with_a_status_frame() -> Result<(), Box<dyn std::error::Error>> {
        let (mut port, mut rx) = SimulatedPort::new("upper", &motors());
        port.write(&codec::read_frame(36, address::PRESENT_TEMPERATURE, 1)).await?;
        let reply = rx.recv().await.ok_or("no reply")?;
        let status = codec::parse_status(&reply)?;
        assert_eq!((status.id, status.params), (36, vec![30]));
        Ok(())
    }

    #[tokio::test]
    async fn sync_write_is_silent_but_takes_effect() -> Result<(), Box<dyn std::error::Error>> {
        let (mut port, mut rx) = SimulatedPort::new("upper", &motors());
        port.write(&codec::sync_write_frame(address::TORQUE_ENABLE, 1, &[(36, 0), (31, 0)]))
            .await?;
        assert!(rx.try_recv().is_err());

        port.write(&codec::read_frame(31, address::TORQUE_ENABLE, 1)).await?;
        let status = codec::parse_status(&rx.recv().await.ok_or("no reply")?)?;
        assert_eq!(status.params, vec![0]);
        Ok(())
    }

    #[tokio::test]
    async fn replies_can_be_fragmented() -> Result<(), Box<dyn std::error::Error>> {
        let (port, mut rx) = SimulatedPort::new("upper", &motors());
        let mut port = port.with_chunk_size(3);
        port.write(&codec::read_frame(36, address::PRESENT_POSITION, 2)).await?;
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat().len(), codec::STATUS_FRAME_LEN);
        Ok(())
    }

    #[tokio::test]
    async fn injected_fault_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let (mut port, mut rx) = SimulatedPort::new("upper", &motors());
        port.handle().inject_fault(36, 0x20);
        port.write(&codec::ping_frame(36)).await?;
        let status = codec::parse_status(&rx.recv().await.ok_or("no reply")?)?;
        assert_eq!(
            status.error_message().as_deref(),
            Some("Motor 36 encountered a position outside angle limits")
        );
        Ok(())
    }
}
