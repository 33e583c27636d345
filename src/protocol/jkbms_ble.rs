//! JK BMS over Bluetooth Low Energy (JK02 protocol).
//!
//! After a request the BMS streams 300 byte frames as notifications, roughly one per
//! second, chopped into arbitrary chunks. A frame starts with `55 AA EB 90`, byte 4 tells
//! its type and byte 299 is the low byte of the sum of bytes 0..299. There is no length
//! field, so frames are reassembled by [`FrameAssembler`] from the magic and the fixed size.
//!
//! The link is kept alive by a [`NotifyWorker`] task that reconnects on its own and hands
//! complete frames to the driver through a bounded queue.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{sum8, Payload, Protocol};
use crate::battery_state::{AlarmBits, Battery, BitOrder, BitTable, Condition, Severity};
use crate::bms::Bms;
use crate::config::{BleConfig, Config};
use crate::error::{Error, Result, ValidationError};
use crate::transport::Transport;

pub const CMD_CELL_INFO: u8 = 0x96;
pub const CMD_DEVICE_INFO: u8 = 0x97;

pub const FRAME_SETTINGS: u8 = 0x01;
pub const FRAME_CELL_INFO: u8 = 0x02;
pub const FRAME_DEVICE_INFO: u8 = 0x03;

const RESPONSE_MAGIC: [u8; 4] = [0x55, 0xaa, 0xeb, 0x90];
const REQUEST_MAGIC: [u8; 4] = [0xaa, 0x55, 0x90, 0xeb];
const REQUEST_LEN: usize = 20;
pub const MIN_RESPONSE_SIZE: usize = 300;
const CHECKSUM_AT: usize = MIN_RESPONSE_SIZE - 1;
const MOS_OVERHEAT: f64 = 80.0;
const POLL_INTERVAL: Duration = Duration::from_millis(1000);
const READ_SLICE: Duration = Duration::from_millis(20);

static WARNINGS: BitTable = BitTable {
    width: 16,
    order: BitOrder::Lsb0,
    rows: &[
        AlarmBits { condition: Condition::VoltageHigh, alarm: &[4], warning: &[] },
        AlarmBits { condition: Condition::VoltageLow, alarm: &[11], warning: &[] },
        AlarmBits { condition: Condition::CurrentOver, alarm: &[6, 13], warning: &[] },
        AlarmBits { condition: Condition::TempHighCharge, alarm: &[8], warning: &[] },
        AlarmBits { condition: Condition::TempLowCharge, alarm: &[9], warning: &[] },
        AlarmBits { condition: Condition::TempHighDischarge, alarm: &[15], warning: &[] },
    ],
};

fn find_magic(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .windows(RESPONSE_MAGIC.len())
        .skip(from)
        .position(|window| window == RESPONSE_MAGIC)
        .map(|pos| pos + from)
}

/// Reassembles notification chunks into checksum-verified frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append `chunk` and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find_magic(&self.buffer, 0) else {
                // the tail may be the first half of a magic split across chunks
                let keep = self.buffer.len().min(RESPONSE_MAGIC.len() - 1);
                let stray = self.buffer.len() - keep;
                if stray > 0 {
                    debug!("discarding {stray} bytes outside any frame");
                    self.buffer.drain(..stray);
                }
                return frames;
            };
            if start > 0 {
                debug!("discarding {start} bytes before frame start");
                self.buffer.drain(..start);
            }

            let window = self.buffer.len().min(MIN_RESPONSE_SIZE);
            if let Some(next) = find_magic(&self.buffer[..window], 1) {
                debug!("frame cut short after {next} bytes by a new frame start");
                self.buffer.drain(..next);
                continue;
            }
            if self.buffer.len() < MIN_RESPONSE_SIZE {
                return frames;
            }

            let calculated = sum8(&self.buffer[..CHECKSUM_AT]);
            if calculated == self.buffer[CHECKSUM_AT] {
                frames.push(self.buffer.drain(..MIN_RESPONSE_SIZE).collect());
            } else {
                warn!(
                    "dropping frame with bad checksum: calculated {calculated:#04x}, received {:#04x}",
                    self.buffer[CHECKSUM_AT]
                );
                self.buffer.drain(..RESPONSE_MAGIC.len());
            }
        }
    }
}

/// Vendor id from a device info frame, e.g. `JK_B2A8S20P`.
pub fn vendor_id(frame: &[u8]) -> std::result::Result<String, ValidationError> {
    Payload::new(frame).text(6, 16)
}

#[derive(Debug, Clone, Default)]
pub struct JkBle;

impl JkBle {
    fn decode_settings(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let cell_uvp = p.u32_le(10)? as f64 / 1000.0;
        let cell_ovp = p.u32_le(18)? as f64 / 1000.0;
        let max_charge = p.u32_le(50)? as f64 / 1000.0;
        let max_discharge = p.u32_le(62)? as f64 / 1000.0;
        let cells = p.u32_le(114)? as usize;
        let balance_switch = p.u8(126)? != 0;
        if !(1..=32).contains(&cells) {
            return Err(Error::DecodeRange { field: "cell count", value: cells as f64 });
        }

        battery.set_cell_count(cells);
        battery.max_battery_charge_current = Some(max_charge);
        battery.max_battery_discharge_current = Some(max_discharge);
        battery.max_battery_voltage = Some(cell_ovp * cells as f64);
        battery.min_battery_voltage = Some(cell_uvp * cells as f64);
        battery.balance_fet = Some(balance_switch);
        Ok(())
    }

    fn decode_cell_info(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        // 32 cell models insert 16 bytes after the voltages and 16 more after resistances
        let wide = p.u8(189)? == 0 && p.u8(189 + 32)? > 0;
        let at = |offset: usize| match (wide, offset) {
            (true, o) if o >= 112 => o + 32,
            (true, o) if o >= 54 => o + 16,
            (_, o) => o,
        };

        let count = battery.cell_count.unwrap_or(0);
        let voltages = (0..count)
            .map(|i| Ok(p.u16_le(6 + 2 * i)? as f64 / 1000.0))
            .collect::<std::result::Result<Vec<_>, ValidationError>>()?;
        let delta = p.u16_le(at(60))? as f64 / 1000.0;
        let max_cell = p.u8(at(62))? as usize;
        let min_cell = p.u8(at(63))? as usize;
        let total = p.u16_le(at(118))? as f64 / 1000.0;
        let current = p.i32_le(at(126))? as f64 / 1000.0;
        let sensor_1 = p.i16_le(at(130))? as f64 / 10.0;
        let sensor_2 = p.i16_le(at(132))? as f64 / 10.0;
        let mos = p.i16_le(at(134))? as f64 / 10.0;
        let warnings = p.u16_le(at(136))?;
        let balancing_action = p.u8(at(140))?;
        let soc = p.u8(at(141))? as f64;
        let remain = p.u32_le(at(142))? as f64 / 1000.0;
        let nominal = p.u32_le(at(146))? as f64 / 1000.0;
        let cycles = p.u32_le(at(150))?;
        let charging = p.u8(at(166))? != 0;
        let discharging = p.u8(at(167))? != 0;
        if soc > 100.0 {
            return Err(Error::DecodeRange { field: "soc", value: soc });
        }

        let balancing = balancing_action != 0;
        for (i, (cell, voltage)) in battery.cells.iter_mut().zip(voltages).enumerate() {
            cell.voltage = Some(voltage);
            // only the two cells being balanced against each other are known
            cell.balance = Some(balancing && (i == min_cell || i == max_cell));
        }
        battery.cell_min_no = Some(min_cell);
        battery.cell_max_no = Some(max_cell);
        battery.balancing = Some(balancing);
        battery.voltage = Some(total);
        battery.current = Some(current);
        battery.soc = Some(soc);
        battery.capacity_remain = Some(remain);
        battery.capacity = Some(nominal);
        battery.cycles = Some(cycles);
        battery.charge_fet = Some(charging);
        battery.discharge_fet = Some(discharging);
        battery.set_temperature(0, sensor_1);
        battery.set_temperature(1, sensor_2);
        battery.set_temp_mos(mos);
        battery.temp_sensors = Some(2);

        let protection = &mut battery.protection;
        WARNINGS.decode(warnings as u32, protection);
        protection.internal_failure = Severity::alarm_if(mos > MOS_OVERHEAT);
        let cell_ovp = battery.max_battery_voltage.zip(battery.cell_count).map(|(v, n)| v / n as f64);
        if let Some(ovp) = cell_ovp {
            protection.cell_imbalance = if delta > (ovp * 0.05).min(0.200) {
                Severity::Alarm
            } else if delta > (ovp * 0.03).min(0.120) {
                Severity::Warning
            } else {
                Severity::Ok
            };
        }
        Ok(())
    }

    fn decode_device_info(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let hardware = p.text(22, 8)?;
        let software = p.text(30, 8)?;
        let uptime = p.u32_le(38)?;
        let manufactured = p.text(78, 8)?;
        let serial = p.text(86, 10)?;
        debug!("JK BMS software {software}, up {uptime} s");

        battery.hardware_version = Some(format!("JKBMS {hardware}"));
        battery.production = (!manufactured.is_empty()).then(|| format!("20{manufactured}"));
        if !serial.is_empty() {
            battery.unique_id = Some(serial);
        }
        Ok(())
    }
}

impl Protocol for JkBle {
    fn build_request(&self, command: u8) -> Vec<u8> {
        let mut frame = vec![0u8; REQUEST_LEN];
        frame[..4].copy_from_slice(&REQUEST_MAGIC);
        frame[4] = command;
        frame[REQUEST_LEN - 1] = sum8(&frame[..REQUEST_LEN - 1]);
        frame
    }

    /// Accepts both request frames (`command` is the request) and notification frames
    /// (`command` is the frame type).
    fn validate_and_strip(&self, command: u8, frame: &[u8]) -> std::result::Result<Vec<u8>, ValidationError> {
        let (expected_len, checksum_at) = match frame.get(..4) {
            Some(magic) if magic == REQUEST_MAGIC => (REQUEST_LEN, REQUEST_LEN - 1),
            Some(magic) if magic == RESPONSE_MAGIC => (MIN_RESPONSE_SIZE, CHECKSUM_AT),
            _ => return Err(ValidationError::Marker),
        };
        if frame.len() < expected_len {
            return Err(ValidationError::Length { expected: expected_len, actual: frame.len() });
        }
        let calculated = sum8(&frame[..checksum_at]);
        if calculated != frame[checksum_at] {
            return Err(ValidationError::Checksum { calculated: calculated as u32, received: frame[checksum_at] as u32 });
        }
        if frame[4] != command {
            return Err(ValidationError::Command { expected: command, actual: frame[4] });
        }
        Ok(frame[..expected_len].to_vec())
    }

    /// `payload` is the whole frame, offsets count from the magic.
    fn decode_payload(&self, command: u8, payload: &[u8], battery: &mut Battery) -> Result<()> {
        let p = Payload::new(payload);
        match command {
            FRAME_SETTINGS => self.decode_settings(p, battery),
            FRAME_CELL_INFO => self.decode_cell_info(p, battery),
            FRAME_DEVICE_INFO => self.decode_device_info(p, battery),
            other => Err(ValidationError::Command { expected: FRAME_CELL_INFO, actual: other }.into()),
        }
    }
}

struct WorkerTask {
    transport: Box<dyn Transport>,
    assembler: FrameAssembler,
    frames: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
    cycle_pause: Duration,
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl WorkerTask {

    async fn connect(&mut self) -> bool {
        for attempt in 1..=self.reconnect_attempts {
            if self.token.is_cancelled() {
                return false;
            }
            match self.transport.open().await {
                Ok(()) => return true,
                Err(err) => {
                    warn!("{}: connect attempt {attempt}/{} failed: {err}", self.transport.name(), self.reconnect_attempts);
                    if !pause(&self.token, self.reconnect_backoff).await {
                        return false;
                    }
                }
            }
        }
        false
    }

    async fn request_updates(&mut self) -> Result<()> {
        for command in [CMD_DEVICE_INFO, CMD_CELL_INFO] {
            self.transport.write(&JkBle.build_request(command)).await?;
        }
        Ok(())
    }

    /// Forward frames until the link drops. Returns false on cancellation or when the
    /// receiving side is gone.
    async fn pump(&mut self) -> bool {
        if let Err(err) = self.request_updates().await {
            warn!("{}: requesting data failed: {err}", self.transport.name());
            return true;
        }
        loop {
            if !pause(&self.token, READ_SLICE).await {
                return false;
            }
            let chunk = match self.transport.read_available().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!("{}: link lost: {err}", self.transport.name());
                    return true;
                }
            };
            for frame in self.assembler.push(&chunk) {
                match self.frames.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("frame queue full, dropping frame"),
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
        }
    }

    async fn run(mut self) {
        loop {
            if self.connect().await {
                info!("{}: streaming", self.transport.name());
                let keep_going = self.pump().await;
                self.assembler.clear();
                if let Err(err) = self.transport.close().await {
                    debug!("{}: close failed: {err}", self.transport.name());
                }
                if !keep_going {
                    break;
                }
            } else {
                if self.token.is_cancelled() {
                    break;
                }
                warn!("{}: giving up for this cycle", self.transport.name());
                if !pause(&self.token, self.cycle_pause).await {
                    break;
                }
            }
        }
        debug!("{}: notify worker stopped", self.transport.name());
    }
}

/// Background connect/notify task for one device.
pub struct NotifyWorker {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    frames: mpsc::Receiver<Vec<u8>>,
    join_timeout: Duration,
}

impl NotifyWorker {
    pub fn spawn(transport: Box<dyn Transport>, config: &BleConfig) -> Self {
        let token = CancellationToken::new();
        let (tx, frames) = mpsc::channel(config.queue_depth);
        let task = WorkerTask {
            transport,
            assembler: FrameAssembler::new(),
            frames: tx,
            token: token.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            cycle_pause: Duration::from_secs(config.cycle_pause_secs),
        };
        Self {
            token,
            handle: Some(tokio::spawn(task.run())),
            frames,
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        }
    }

    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.frames.try_recv().ok()
    }

    pub async fn next_timeout(&mut self, wait: Duration) -> Option<Vec<u8>> {
        timeout(wait, self.frames.recv()).await.ok().flatten()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the task and wait a bounded time for it to finish.
    pub async fn stop(&mut self) {
        self.token.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        match timeout(self.join_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("notify worker failed: {err}"),
            Err(_) => warn!("notify worker did not stop within {:?}", self.join_timeout),
        }
    }
}

impl Drop for NotifyWorker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Seen {
    settings: bool,
    cell_info: bool,
    device_info: bool,
}

impl Seen {
    fn complete(&self) -> bool {
        self.settings && self.cell_info && self.device_info
    }
}

pub struct JkBleBms {
    codec: JkBle,
    transport: Option<Box<dyn Transport>>,
    worker: Option<NotifyWorker>,
    config: BleConfig,
    capacity_override: Option<f64>,
    seen: Seen,
    last_frame: Option<Instant>,
}

impl JkBleBms {
    pub fn new(transport: Box<dyn Transport>, config: &Config) -> Self {
        Self {
            codec: JkBle,
            transport: Some(transport),
            worker: None,
            config: config.ble.clone(),
            capacity_override: config.battery.capacity_ah,
            seen: Seen::default(),
            last_frame: None,
        }
    }

    fn apply(&mut self, frame: &[u8], battery: &mut Battery) -> Result<()> {
        let frame_type = frame.get(4).copied().ok_or(ValidationError::Length { expected: 5, actual: frame.len() })?;
        let payload = self.codec.validate_and_strip(frame_type, frame)?;
        self.codec.decode_payload(frame_type, &payload, battery)?;
        match frame_type {
            FRAME_SETTINGS => self.seen.settings = true,
            FRAME_CELL_INFO => self.seen.cell_info = true,
            FRAME_DEVICE_INFO => self.seen.device_info = true,
            _ => {}
        }
        Ok(())
    }

    async fn wait_for_first_frames(&mut self, worker: &mut NotifyWorker, battery: &mut Battery) -> Result<()> {
        let wait = Duration::from_secs(self.config.probe_wait_secs);
        let deadline = Instant::now() + wait;
        while !self.seen.complete() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = worker.next_timeout(remaining).await.ok_or(Error::TransportTimeout(wait))?;
            if frame.get(4) == Some(&FRAME_DEVICE_INFO) {
                let vendor = vendor_id(&frame)?;
                if !(vendor.starts_with("JK-") || vendor.starts_with("JK_")) {
                    return Err(Error::NotFound(format!("unexpected vendor id {vendor:?}")));
                }
            }
            self.apply(&frame, battery)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Bms for JkBleBms {
    fn kind(&self) -> &'static str {
        "JKBMS BLE"
    }

    fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn test_connection(&mut self, battery: &mut Battery) -> Result<()> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::ConnectionLost("notify worker already started".into()))?;
        let mut worker = NotifyWorker::spawn(transport, &self.config);
        match self.wait_for_first_frames(&mut worker, battery).await {
            Ok(()) => {
                self.worker = Some(worker);
                self.last_frame = Some(Instant::now());
                battery.bms_type = self.kind().into();
                battery.poll_interval = POLL_INTERVAL;
                Ok(())
            }
            Err(err) => {
                worker.stop().await;
                Err(err)
            }
        }
    }

    async fn get_settings(&mut self, battery: &mut Battery) -> Result<()> {
        if let Some(capacity) = self.capacity_override {
            battery.capacity = Some(capacity);
        }
        if let (Some(hardware), Some(cells)) = (battery.hardware_version.clone(), battery.cell_count) {
            if !hardware.ends_with("cells") {
                battery.hardware_version = Some(format!("{hardware} {cells} cells"));
            }
        }
        Ok(())
    }

    async fn refresh(&mut self, battery: &mut Battery) -> Result<()> {
        let mut frames = Vec::new();
        {
            let worker = self
                .worker
                .as_mut()
                .ok_or_else(|| Error::ConnectionLost("notify worker not running".into()))?;
            while let Some(frame) = worker.try_next() {
                frames.push(frame);
            }
        }

        let now = Instant::now();
        let mut applied = 0;
        let mut last_error = None;
        for frame in &frames {
            match self.apply(frame, battery) {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!("skipping frame type {:#04x}: {err}", frame.get(4).copied().unwrap_or_default());
                    last_error = Some(err);
                }
            }
        }
        if applied > 0 {
            self.last_frame = Some(now);
        } else if let Some(err) = last_error {
            return Err(err);
        }
        if let Some(capacity) = self.capacity_override {
            battery.capacity = Some(capacity);
        }

        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        let silent_for = self.last_frame.map_or(Duration::MAX, |at| now.duration_since(at));
        if silent_for > stale_after {
            return Err(Error::ConnectionLost(format!("no data from the BMS for {silent_for:?}")));
        }
        if self.seen.settings && self.seen.cell_info {
            battery.mark_settled();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop().await;
        }
        Ok(())
    }
}
