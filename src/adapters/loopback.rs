//! In-process simulated controller.
//!
//! [`loopback`] returns a transport for the engine and a [`LoopbackPeer`]
//! that plays the controller side. The peer answers every tracked command
//! the way a cooperative controller would, streams a telemetry snapshot in
//! reply to each keepalive, and exposes knobs for the failure cases
//! (refused connects, silent or rejecting commands, dropped links, foreign
//! protocol versions).
//!
//! Replies are pushed straight into the engine's [`InboundPort`] from
//! inside `write_frame`, so the whole exchange runs on one thread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::error::TransportError;
use crate::link::engine::InboundPort;
use crate::link::ports::{FrameSink, LinkTransport};
use crate::protocol::cursor::Cursor;
use crate::protocol::frame::{self, EncodedFrame, MessageType, PROTOCOL_VERSION, crc16_ccitt_false};
use crate::protocol::messages::{
    AckData, AckPayload, AckStatus, CommandId, CommandPayload, EventData, EventPayload,
    SessionGrant, Severity,
};
use crate::protocol::telemetry::{
    ControllerMode, ControllerSample, Fixed10, MachineState, RunState, TelemetrySnapshot,
};

/// First session id the peer grants.
const FIRST_SESSION_ID: u32 = 0x1000;

struct PeerModel {
    connected: bool,
    inbound: Option<InboundPort>,
    connects: u32,
    connect_failures: u32,

    session_id: Option<u32>,
    next_session_id: u32,
    lease_ms: Option<u32>,
    open_status: AckStatus,

    rejects: BTreeMap<CommandId, AckStatus>,
    silent: BTreeSet<CommandId>,
    received: Vec<CommandId>,
    keepalives: u32,
    telemetry_on_keepalive: bool,
    protocol_version: u8,
    rssi: Option<i16>,

    timestamp_ms: u32,
    relay_outputs: u16,
    alarm_bits: u32,
    controllers: heapless::Vec<ControllerSample, 8>,
    run: Option<RunState>,
}

impl PeerModel {
    fn new() -> Self {
        let mut controllers = heapless::Vec::new();
        // Cryogenic chamber and the mill head.
        let _ = controllers.push(sample(0, -1850, -1900));
        let _ = controllers.push(sample(1, 210, 250));
        Self {
            connected: false,
            inbound: None,
            connects: 0,
            connect_failures: 0,
            session_id: None,
            next_session_id: FIRST_SESSION_ID,
            lease_ms: Some(3000),
            open_status: AckStatus::Ok,
            rejects: BTreeMap::new(),
            silent: BTreeSet::new(),
            received: Vec::new(),
            keepalives: 0,
            telemetry_on_keepalive: true,
            protocol_version: PROTOCOL_VERSION,
            rssi: Some(-55),
            timestamp_ms: 0,
            relay_outputs: 0,
            alarm_bits: 0,
            controllers,
            run: None,
        }
    }

    fn snapshot(&mut self) -> TelemetrySnapshot {
        self.timestamp_ms = self.timestamp_ms.wrapping_add(1000);
        let mut controllers = heapless::Vec::new();
        for c in &self.controllers {
            let _ = controllers.push(*c);
        }
        TelemetrySnapshot {
            timestamp_ms: self.timestamp_ms,
            digital_inputs: 0,
            relay_outputs: self.relay_outputs,
            alarm_bits: self.alarm_bits,
            controllers,
            run_state: self.run,
        }
    }

    fn push(&self, msg_type: MessageType, sequence: u16, payload: &[u8]) -> bool {
        let Some(inbound) = self.inbound.as_ref().filter(|_| self.connected) else {
            return false;
        };
        let Ok(mut bytes) = frame::encode(msg_type, sequence, payload) else {
            return false;
        };
        if self.protocol_version != PROTOCOL_VERSION {
            restamp_version(&mut bytes, self.protocol_version);
        }
        inbound.feed(&bytes)
    }

    fn push_telemetry(&mut self) -> bool {
        let snapshot = self.snapshot();
        match snapshot.encode() {
            Ok(payload) => self.push(MessageType::Telemetry, 0, &payload),
            Err(_) => false,
        }
    }

    fn ack(&self, sequence: u16, cmd_id: CommandId, status: AckStatus, data: &[u8]) {
        let ack = AckPayload {
            acked_sequence: sequence,
            cmd_id,
            status,
            detail: 0,
            data: AckData::from_slice(data).unwrap_or_default(),
        };
        if let Ok(payload) = ack.encode() {
            self.push(MessageType::CommandAck, sequence, &payload);
        }
    }

    /// Act on one command and answer it.
    fn handle(&mut self, sequence: u16, cmd: &CommandPayload) {
        self.received.push(cmd.cmd_id);
        if cmd.cmd_id == CommandId::KEEPALIVE {
            self.keepalives += 1;
            if self.telemetry_on_keepalive {
                self.push_telemetry();
            }
            return;
        }
        if self.silent.contains(&cmd.cmd_id) {
            debug!("PEER: ignoring {} #{sequence}", cmd.cmd_id);
            return;
        }
        if let Some(status) = self.rejects.get(&cmd.cmd_id) {
            self.ack(sequence, cmd.cmd_id, *status, &[]);
            return;
        }

        match cmd.cmd_id {
            CommandId::OPEN_SESSION => {
                if !self.open_status.is_ok() {
                    self.ack(sequence, cmd.cmd_id, self.open_status, &[]);
                    return;
                }
                let id = self.next_session_id;
                self.next_session_id = self.next_session_id.wrapping_add(1);
                self.session_id = Some(id);
                info!("PEER: granted session 0x{id:08X}");
                let grant = SessionGrant {
                    session_id: id,
                    lease_ms: self.lease_ms,
                }
                .encode();
                self.ack(sequence, cmd.cmd_id, AckStatus::Ok, &grant);
                return;
            }
            CommandId::CLOSE_SESSION => self.session_id = None,
            CommandId::START_RUN => {
                let mut c = Cursor::new(&cmd.data);
                let (Some(mill), Some(hold), Some(cycles)) = (c.u32(), c.u32(), c.u16()) else {
                    self.ack(sequence, cmd.cmd_id, AckStatus::InvalidArgs, &[]);
                    return;
                };
                let total = mill as u64 * cycles as u64 + hold as u64 * (cycles as u64).saturating_sub(1);
                self.run = Some(RunState {
                    machine_state: MachineState::Running,
                    elapsed_ms: 0,
                    remaining_ms: u32::try_from(total).unwrap_or(u32::MAX),
                    target: Fixed10(0),
                    step: 1,
                    interlock_bits: 0,
                    lazy_poll_active: false,
                    idle_timeout_min: 0,
                });
            }
            CommandId::PAUSE_RUN => self.set_machine_state(MachineState::Paused),
            CommandId::RESUME_RUN => self.set_machine_state(MachineState::Running),
            CommandId::STOP_RUN => self.set_machine_state(MachineState::Idle),
            CommandId::SET_RELAY => {
                let mut c = Cursor::new(&cmd.data);
                if let (Some(mask), Some(state)) = (c.u16(), c.u16()) {
                    self.relay_outputs = (self.relay_outputs & !mask) | (state & mask);
                }
            }
            CommandId::SET_SETPOINT => {
                let mut c = Cursor::new(&cmd.data);
                if let (Some(id), Some(raw)) = (c.u8(), c.i16()) {
                    if let Some(ctrl) = self.controllers.iter_mut().find(|s| s.id == id) {
                        ctrl.setpoint = Fixed10(raw);
                    }
                }
            }
            _ => {}
        }
        self.ack(sequence, cmd.cmd_id, AckStatus::Ok, &[]);
    }

    fn set_machine_state(&mut self, state: MachineState) {
        if let Some(run) = self.run.as_mut() {
            run.machine_state = state;
        }
    }
}

fn sample(id: u8, pv: i16, sp: i16) -> ControllerSample {
    ControllerSample {
        id,
        process_value: Fixed10(pv),
        setpoint: Fixed10(sp),
        output_x10: 0,
        mode: ControllerMode::Auto,
        age_ms: 0,
    }
}

/// Rewrite the version byte and fix up the checksum.
fn restamp_version(bytes: &mut EncodedFrame, version: u8) {
    bytes[0] = version;
    let body = bytes.len() - frame::CHECKSUM_LEN;
    let crc = crc16_ccitt_false(&bytes[..body]).to_le_bytes();
    bytes[body..].copy_from_slice(&crc);
}

fn lock(model: &Mutex<PeerModel>) -> MutexGuard<'_, PeerModel> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a connected transport / peer pair.
pub fn loopback() -> (LoopbackTransport, LoopbackPeer) {
    let model = Arc::new(Mutex::new(PeerModel::new()));
    (
        LoopbackTransport {
            model: model.clone(),
        },
        LoopbackPeer { model },
    )
}

// ── Engine side ──────────────────────────────────────────────

pub struct LoopbackTransport {
    model: Arc<Mutex<PeerModel>>,
}

impl FrameSink for LoopbackTransport {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut peer = lock(&self.model);
        if !peer.connected {
            return Err(TransportError::NotConnected);
        }
        // Garbage from the client is a client bug; a real controller
        // would drop it too.
        let Ok(frame) = frame::decode(bytes) else {
            return Ok(());
        };
        if frame.msg_type() != MessageType::Command {
            return Ok(());
        }
        if let Ok(cmd) = CommandPayload::decode(frame.payload()) {
            peer.handle(frame.sequence(), &cmd);
        }
        Ok(())
    }

    fn rssi(&mut self) -> Option<i16> {
        lock(&self.model).rssi
    }
}

impl LinkTransport for LoopbackTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut peer = lock(&self.model);
        if peer.connect_failures > 0 {
            peer.connect_failures -= 1;
            return Err(TransportError::ConnectFailed);
        }
        peer.connected = true;
        peer.connects += 1;
        Ok(())
    }

    async fn discover(&mut self) -> Result<(), TransportError> {
        if lock(&self.model).connected {
            Ok(())
        } else {
            Err(TransportError::ServiceNotFound)
        }
    }

    async fn subscribe(&mut self, inbound: InboundPort) -> Result<(), TransportError> {
        let mut peer = lock(&self.model);
        if !peer.connected {
            return Err(TransportError::SubscribeFailed);
        }
        peer.inbound = Some(inbound);
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut peer = lock(&self.model);
        peer.connected = false;
        peer.inbound = None;
        peer.session_id = None;
    }
}

// ── Controller side ──────────────────────────────────────────

/// Test and demo control over the simulated controller.
#[derive(Clone)]
pub struct LoopbackPeer {
    model: Arc<Mutex<PeerModel>>,
}

impl LoopbackPeer {
    pub fn is_connected(&self) -> bool {
        lock(&self.model).connected
    }

    /// Successful transport connects so far.
    pub fn connects(&self) -> u32 {
        lock(&self.model).connects
    }

    pub fn session_id(&self) -> Option<u32> {
        lock(&self.model).session_id
    }

    pub fn keepalives(&self) -> u32 {
        lock(&self.model).keepalives
    }

    /// Every command id received, in order, keepalives included.
    pub fn received(&self) -> Vec<CommandId> {
        lock(&self.model).received.clone()
    }

    pub fn relay_outputs(&self) -> u16 {
        lock(&self.model).relay_outputs
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.model).connect_failures = n;
    }

    /// Answer OPEN_SESSION with `status`.
    pub fn set_open_status(&self, status: AckStatus) {
        lock(&self.model).open_status = status;
    }

    /// Lease to grant; `None` sends a 4-byte grant.
    pub fn set_lease(&self, lease_ms: Option<u32>) {
        lock(&self.model).lease_ms = lease_ms;
    }

    pub fn reject(&self, cmd_id: CommandId, status: AckStatus) {
        lock(&self.model).rejects.insert(cmd_id, status);
    }

    /// Never acknowledge `cmd_id`.
    pub fn ignore(&self, cmd_id: CommandId) {
        lock(&self.model).silent.insert(cmd_id);
    }

    pub fn set_telemetry_on_keepalive(&self, enabled: bool) {
        lock(&self.model).telemetry_on_keepalive = enabled;
    }

    /// Version stamped on every frame the peer sends.
    pub fn set_protocol_version(&self, version: u8) {
        lock(&self.model).protocol_version = version;
    }

    pub fn set_rssi(&self, rssi: Option<i16>) {
        lock(&self.model).rssi = rssi;
    }

    pub fn set_alarm_bits(&self, bits: u32) {
        lock(&self.model).alarm_bits = bits;
    }

    pub fn set_process_value(&self, controller: u8, value: Fixed10) {
        let mut peer = lock(&self.model);
        if let Some(c) = peer.controllers.iter_mut().find(|c| c.id == controller) {
            c.process_value = value;
        }
    }

    /// Report the run as `state` in subsequent telemetry.
    pub fn set_run_state(&self, state: MachineState) {
        lock(&self.model).set_machine_state(state);
    }

    /// Push one telemetry snapshot now.
    pub fn send_telemetry(&self) -> bool {
        lock(&self.model).push_telemetry()
    }

    /// Push an unsolicited EVENT frame.
    pub fn send_event(&self, event_id: u16, severity: Severity, source: u8) -> bool {
        let event = EventPayload {
            event_id,
            severity,
            source,
            data: EventData::new(),
        };
        let peer = lock(&self.model);
        match event.encode() {
            Ok(payload) => peer.push(MessageType::Event, 0, &payload),
            Err(_) => false,
        }
    }

    /// Deliver raw bytes as one notification.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        let peer = lock(&self.model);
        match peer.inbound.as_ref() {
            Some(inbound) if peer.connected => inbound.feed(bytes),
            _ => false,
        }
    }

    /// Simulate the radio dropping the connection.
    pub fn drop_link(&self) {
        let mut peer = lock(&self.model);
        peer.connected = false;
        peer.session_id = None;
        if let Some(inbound) = peer.inbound.take() {
            inbound.notify_disconnected();
        }
    }
}
