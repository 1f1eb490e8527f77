//! Stage and stream identity
//!
//! A pipeline stage is addressed two ways: by [`Slot`] (its logical role
//! within one stream) and by [`StageId`] (the physical hardware instance,
//! slot × channel). Several logical stages from concurrent streams may
//! map onto the same physical instance; the scheduler multiplexes them on
//! one worker per [`StageId`].

use std::fmt;

/// Logical stream (capture session) identity
pub type StreamId = u32;

/// Physical channels available per slot
///
/// Channel selection is what `change_chain` rebinds when front-end
/// resources are shared between sensors.
pub const MAX_CHANNELS: u32 = 4;

/// Logical role of a pipeline stage within one stream
///
/// Declaration order is pipeline order: the sensor-facing slot comes
/// first, downstream compute slots after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// Sensor capture stage (the external producer boundary)
    Sensor,
    /// Statistics front-end (first transform fed by the sensor)
    Stat,
    /// Main image signal processor stage
    Isp,
    /// Scaler stage
    Scaler,
    /// Detection stage (flow-tracking exempt, see the graph builder)
    Detect,
}

impl Slot {
    /// Number of slots
    pub const COUNT: usize = 5;

    /// All slots in pipeline order
    pub const ALL: [Slot; Slot::COUNT] =
        [Slot::Sensor, Slot::Stat, Slot::Isp, Slot::Scaler, Slot::Detect];

    /// Position in pipeline order
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Slot::Sensor => 0,
            Slot::Stat => 1,
            Slot::Isp => 2,
            Slot::Scaler => 3,
            Slot::Detect => 4,
        }
    }

    /// Whether this slot faces the sensor (scheduling priority boundary)
    #[must_use]
    pub fn is_sensor_facing(self) -> bool {
        self == Slot::Sensor
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::Sensor => "SEN",
            Slot::Stat => "STA",
            Slot::Isp => "ISP",
            Slot::Scaler => "SCL",
            Slot::Detect => "DET",
        };
        f.write_str(name)
    }
}

/// Physical hardware stage instance: slot × channel
///
/// One worker task and one admission semaphore exist per `StageId`,
/// independent of how many logical stages bind to it over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u32);

impl StageId {
    /// Total number of addressable physical stages
    pub const COUNT: usize = Slot::COUNT * MAX_CHANNELS as usize;

    /// Build an id from slot and channel
    ///
    /// # Panics
    ///
    /// Debug-asserts `channel < MAX_CHANNELS`.
    #[must_use]
    pub fn new(slot: Slot, channel: u32) -> Self {
        debug_assert!(channel < MAX_CHANNELS, "channel {channel} out of range");
        Self(slot.index() as u32 * MAX_CHANNELS + channel)
    }

    /// Logical role of this physical instance
    #[must_use]
    pub fn slot(self) -> Slot {
        Slot::ALL[(self.0 / MAX_CHANNELS) as usize]
    }

    /// Channel within the slot
    #[must_use]
    pub fn channel(self) -> u32 {
        self.0 % MAX_CHANNELS
    }

    /// Same slot, different channel
    #[must_use]
    pub fn with_channel(self, channel: u32) -> Self {
        Self::new(self.slot(), channel)
    }

    /// Dense index for table addressing
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Inverse of [`index`](StageId::index)
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        debug_assert!(index < Self::COUNT, "stage index {index} out of range");
        Self(index as u32)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.slot(), self.channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_roundtrip() {
        for slot in Slot::ALL {
            for channel in 0..MAX_CHANNELS {
                let id = StageId::new(slot, channel);
                assert_eq!(id.slot(), slot);
                assert_eq!(id.channel(), channel);
                assert_eq!(StageId::from_index(id.index()), id);
            }
        }
    }

    #[test]
    fn test_with_channel() {
        let id = StageId::new(Slot::Stat, 0);
        let moved = id.with_channel(2);
        assert_eq!(moved.slot(), Slot::Stat);
        assert_eq!(moved.channel(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(StageId::new(Slot::Isp, 1).to_string(), "ISP1");
        assert_eq!(StageId::new(Slot::Sensor, 0).to_string(), "SEN0");
    }

    #[test]
    fn test_slot_order_is_pipeline_order() {
        assert!(Slot::Sensor < Slot::Stat);
        assert!(Slot::Stat < Slot::Isp);
        assert!(Slot::Scaler < Slot::Detect);
    }
}
