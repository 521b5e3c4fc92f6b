//! Input replication channel.
//!
//! The controlling node samples its device once per tick, optionally smooths
//! it, packs an [`InputFrame`] into a fixed-size packet and sends it on the
//! unreliable lane. Every node (the sender included) buffers frames per
//! vehicle and tick; the dynamics step for tick N asks for exactly tick N and
//! gets neutral input if nothing arrived.
//!
//! Wire layout, little endian:
//!
//! ```text
//! packet: entity u64 | tick u32 | frame (9 bytes)     = 21 bytes
//! frame:  steering f32 | throttle_brake f32 | flags u8
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    config::InputConfig,
    error::WireError,
    net::{EntityHandle, ParticipantId, Tick},
    records::{RecordStore, VehicleRecord},
};

pub const INPUT_FRAME_LEN: usize = 9;
pub const INPUT_PACKET_LEN: usize = 8 + 4 + INPUT_FRAME_LEN;

const FLAG_BRAKE: u8 = 1 << 0;

/// One tick of control input for one vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputFrame {
    /// -1 = full left, 1 = full right.
    pub steering: f32,
    /// Positive = throttle, negative = brake/reverse.
    pub throttle_brake: f32,
    pub brake: bool,
}

impl InputFrame {
    pub const NEUTRAL: Self = Self {
        steering: 0.0,
        throttle_brake: 0.0,
        brake: false,
    };

    /// Builds a frame with both axes clamped to [-1, 1].
    pub fn new(steering: f32, throttle_brake: f32, brake: bool) -> Self {
        Self {
            steering: clamp_axis(steering),
            throttle_brake: clamp_axis(throttle_brake),
            brake,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f32_le(self.steering);
        buf.put_f32_le(self.throttle_brake);
        buf.put_u8(if self.brake { FLAG_BRAKE } else { 0 });
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < INPUT_FRAME_LEN {
            return Err(WireError::Length {
                expected: INPUT_FRAME_LEN,
                actual: buf.remaining(),
            });
        }
        let steering = buf.get_f32_le();
        let throttle_brake = buf.get_f32_le();
        let flags = buf.get_u8();
        if !steering.is_finite() || !throttle_brake.is_finite() {
            return Err(WireError::NonFinite);
        }
        Ok(Self::new(steering, throttle_brake, flags & FLAG_BRAKE != 0))
    }
}

fn clamp_axis(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// A frame addressed to a vehicle and tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputPacket {
    pub entity: EntityHandle,
    pub tick: Tick,
    pub frame: InputFrame,
}

impl InputPacket {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(INPUT_PACKET_LEN);
        buf.put_u64_le(self.entity.0);
        buf.put_u32_le(self.tick);
        self.frame.encode(&mut buf);
        buf.freeze()
    }

    pub fn from_bytes(mut b: &[u8]) -> Result<Self, WireError> {
        if b.len() != INPUT_PACKET_LEN {
            return Err(WireError::Length {
                expected: INPUT_PACKET_LEN,
                actual: b.len(),
            });
        }
        let entity = EntityHandle(b.get_u64_le());
        let tick = b.get_u32_le();
        let frame = InputFrame::decode(&mut b)?;
        Ok(Self {
            entity,
            tick,
            frame,
        })
    }
}

/// Raw device state, before smoothing and packing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawInput {
    pub steering: f32,
    pub throttle_brake: f32,
    pub brake: bool,
}

/// Local control device (keyboard, pad, script).
pub trait InputSource: Send {
    fn sample(&mut self, tick: Tick) -> RawInput;
}

/// Exponential low-pass filter over the analog axes.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputSmoother {
    factor: f32,
    steering: f32,
    throttle_brake: f32,
}

impl InputSmoother {
    /// `factor` is the weight kept from the previous value; 0 passes input through.
    pub fn new(factor: f32) -> Self {
        Self {
            factor: factor.clamp(0.0, 0.99),
            ..Self::default()
        }
    }

    pub fn set_factor(&mut self, factor: f32) {
        self.factor = factor.clamp(0.0, 0.99);
    }

    pub fn apply(&mut self, raw: RawInput) -> InputFrame {
        let keep = self.factor;
        self.steering = self.steering * keep + clamp_axis(raw.steering) * (1.0 - keep);
        self.throttle_brake =
            self.throttle_brake * keep + clamp_axis(raw.throttle_brake) * (1.0 - keep);
        InputFrame::new(self.steering, self.throttle_brake, raw.brake)
    }

    pub fn reset(&mut self) {
        self.steering = 0.0;
        self.throttle_brake = 0.0;
    }
}

/// Why a received packet was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum InputReject {
    Malformed(WireError),
    /// No record for the addressed vehicle on this node (yet).
    UnknownVehicle,
    /// The sender does not hold control authority over the vehicle.
    NotController { sender: ParticipantId },
    /// Older than a tick already consumed.
    Stale,
    /// Too far ahead of the last consumed tick.
    TooEarly,
}

#[derive(Debug, Default)]
struct VehicleInputs {
    frames: BTreeMap<Tick, InputFrame>,
    last_consumed: Option<Tick>,
}

/// Per-node input buffer and publisher.
pub struct InputChannel {
    local: ParticipantId,
    smoother: InputSmoother,
    max_buffered_ticks: u32,
    vehicles: HashMap<EntityHandle, VehicleInputs>,
}

impl InputChannel {
    pub fn new(local: ParticipantId, cfg: &InputConfig) -> Self {
        Self {
            local,
            smoother: InputSmoother::new(cfg.smoothing),
            max_buffered_ticks: cfg.max_buffered_ticks.max(1),
            vehicles: HashMap::new(),
        }
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn smoother_mut(&mut self) -> &mut InputSmoother {
        &mut self.smoother
    }

    /// Samples the device for `record`'s vehicle and returns the packet to
    /// send. Returns `None` unless the local participant controls the vehicle.
    pub fn sample(
        &mut self,
        tick: Tick,
        record: &VehicleRecord,
        source: &mut dyn InputSource,
    ) -> Option<InputPacket> {
        if record.participant != self.local {
            return None;
        }
        let frame = self.smoother.apply(source.sample(tick));
        let packet = InputPacket {
            entity: record.entity,
            tick,
            frame,
        };
        if let Err(reject) = self.buffer(packet) {
            debug!(entity = %record.entity, tick, ?reject, "Local frame not buffered");
        }
        Some(packet)
    }

    /// Accepts a packet received from `sender`.
    pub fn receive(
        &mut self,
        sender: ParticipantId,
        payload: &[u8],
        records: &RecordStore,
    ) -> Result<(), InputReject> {
        let packet = InputPacket::from_bytes(payload).map_err(InputReject::Malformed)?;
        let record = records
            .by_entity(packet.entity)
            .ok_or(InputReject::UnknownVehicle)?;
        if record.participant != sender {
            warn!(%sender, owner = %record.participant, entity = %packet.entity, "Input from non-controller dropped");
            return Err(InputReject::NotController { sender });
        }
        self.buffer(packet)
    }

    fn buffer(&mut self, packet: InputPacket) -> Result<(), InputReject> {
        let max_ahead = self.max_buffered_ticks;
        let inputs = self.vehicles.entry(packet.entity).or_default();
        if let Some(last) = inputs.last_consumed {
            if packet.tick <= last {
                return Err(InputReject::Stale);
            }
            if packet.tick - last > max_ahead {
                return Err(InputReject::TooEarly);
            }
        }
        inputs.frames.insert(packet.tick, packet.frame);
        // Keep the buffer bounded even before the first consumption.
        while inputs.frames.len() > max_ahead as usize {
            inputs.frames.pop_first();
        }
        Ok(())
    }

    /// Frame for `entity` at exactly `tick`; neutral if it never arrived.
    /// Consumes the tick: older frames are discarded and later arrivals for
    /// this or earlier ticks are rejected as stale.
    pub fn frame_for(&mut self, entity: EntityHandle, tick: Tick) -> InputFrame {
        let inputs = self.vehicles.entry(entity).or_default();
        let frame = inputs.frames.remove(&tick);
        inputs.frames.retain(|t, _| *t > tick);
        inputs.last_consumed = Some(tick);
        frame.unwrap_or(InputFrame::NEUTRAL)
    }

    /// Drops buffered state for a despawned vehicle.
    pub fn forget(&mut self, entity: EntityHandle) {
        self.vehicles.remove(&entity);
    }
}
