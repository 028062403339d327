use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::mac_addr::MacAddr;
use crate::server::sequence_tracker::SequenceTracker;
use crate::util::rolling_data::RollingData;

/// inter-arrival samples kept per device for the adaptive liveness timeout
pub const INTERVAL_SAMPLES: usize = 16;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceStatus {
    /// registered, STARTUP_ACK sent, no TIME_SYNC received yet
    Pending,
    Active,
    /// went silent past its liveness ceiling; any data message revives it
    Timeout,
    /// announced SHUTDOWN; only a fresh STARTUP revives it
    Down,
}

/// Everything the collector knows about one device. Owned exclusively by the
///  [DeviceTable]; the session borrows it per datagram.
pub struct Device {
    pub mac: MacAddr,
    pub device_id: u16,
    /// 1 means the device sends observations unbatched
    pub batch_size: u8,
    pub status: DeviceStatus,
    /// announced via TIME_SYNC; per-datagram timestamps are relative to it
    pub base_time: Option<u32>,
    /// last reconstructed absolute value, unset until the first keyframe
    pub last_value: Option<i16>,
    pub tracker: SequenceTracker,
    pub intervals: RollingData<INTERVAL_SAMPLES>,
    pub last_arrival: Option<Instant>,
    pub packet_count: u64,
}

impl Device {
    fn new(mac: MacAddr, device_id: u16, batch_size: u8, window_size: u16) -> Device {
        Device {
            mac,
            device_id,
            batch_size,
            status: DeviceStatus::Pending,
            base_time: None,
            last_value: None,
            tracker: SequenceTracker::new(window_size),
            intervals: RollingData::new(),
            last_arrival: None,
            packet_count: 0,
        }
    }

    /// stamps an arrival, feeding the inter-arrival ring
    pub fn touch(&mut self, now: Instant) {
        if let Some(prev) = self.last_arrival.replace(now) {
            self.intervals.add_value((now - prev).as_secs_f64());
        }
        self.packet_count += 1;
    }

    /// The ceiling on silence before this device counts as timed out:
    ///  ten times its observed mean inter-arrival interval. Undefined until
    ///  enough samples exist to make that mean meaningful.
    pub fn timeout_ceiling(&self) -> Option<f64> {
        if self.packet_count < 10 || self.intervals.len() < 10 {
            return None;
        }
        Some(10.0 * self.intervals.mean())
    }
}

pub struct Registration {
    pub device_id: u16,
    pub is_reconnection: bool,
    /// the sequence head the device should resume from, when one exists
    pub resume_sequence: Option<u16>,
}

/// Registry of all devices this collector has ever seen, keyed by MAC for
///  registration and by assigned id for everything else. Ids are handed out
///  smallest-unused-first so a fixed client start order yields fixed ids.
///  Entirely in-memory; it does not survive a restart, by design.
pub struct DeviceTable {
    by_id: BTreeMap<u16, Device>,
    mac_index: FxHashMap<MacAddr, u16>,
    window_size: u16,
}

impl DeviceTable {
    pub fn new(window_size: u16) -> DeviceTable {
        DeviceTable {
            by_id: BTreeMap::new(),
            mac_index: FxHashMap::default(),
            window_size,
        }
    }

    /// Registers a MAC, creating a fresh device or - when the MAC is already
    ///  known - re-issuing its id so the device resumes its old sequence
    ///  space. The tracker deliberately survives reconnection: resetting it
    ///  would turn the resumed sequence numbers into false gaps.
    pub fn register(&mut self, mac: MacAddr, batch_size: u8) -> Registration {
        if let Some(&device_id) = self.mac_index.get(&mac) {
            let device = self
                .by_id
                .get_mut(&device_id)
                .expect("mac index points at a missing device");

            info!(
                "known MAC {} re-registering, re-issuing id {} (head {:?})",
                mac,
                device_id,
                device.tracker.head()
            );
            device.status = DeviceStatus::Pending;
            device.batch_size = batch_size;
            return Registration {
                device_id,
                is_reconnection: true,
                resume_sequence: device.tracker.head(),
            };
        }

        let device_id = self.allocate_id();
        info!("assigning id {} to MAC {}", device_id, mac);
        self.mac_index.insert(mac, device_id);
        self.by_id
            .insert(device_id, Device::new(mac, device_id, batch_size, self.window_size));
        Registration {
            device_id,
            is_reconnection: false,
            resume_sequence: None,
        }
    }

    /// smallest unused positive id; 0 is reserved for unregistered senders
    fn allocate_id(&self) -> u16 {
        (1..=u16::MAX)
            .find(|id| !self.by_id.contains_key(id))
            .expect("all 65535 device ids are in use")
    }

    pub fn get(&self, device_id: u16) -> Option<&Device> {
        self.by_id.get(&device_id)
    }

    pub fn get_mut(&mut self, device_id: u16) -> Option<&mut Device> {
        self.by_id.get_mut(&device_id)
    }

    pub fn expire_to_timeout(&mut self, device_id: u16) {
        if let Some(device) = self.by_id.get_mut(&device_id) {
            debug!("device {} -> TIMEOUT", device_id);
            device.status = DeviceStatus::Timeout;
        }
    }

    pub fn mark_down(&mut self, device_id: u16) {
        if let Some(device) = self.by_id.get_mut(&device_id) {
            debug!("device {} -> DOWN", device_id);
            device.status = DeviceStatus::Down;
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.by_id.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::server::sequence_tracker::DEFAULT_WINDOW_SIZE;

    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, n])
    }

    #[test]
    fn test_ids_are_allocated_smallest_first() {
        let mut table = DeviceTable::new(DEFAULT_WINDOW_SIZE);
        assert_eq!(table.register(mac(1), 1).device_id, 1);
        assert_eq!(table.register(mac(2), 1).device_id, 2);
        assert_eq!(table.register(mac(3), 5).device_id, 3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_reconnection_reuses_id_and_carries_head() {
        let mut table = DeviceTable::new(DEFAULT_WINDOW_SIZE);
        let first = table.register(mac(1), 1);
        assert!(!first.is_reconnection);
        assert_eq!(first.resume_sequence, None);

        table.get_mut(first.device_id).unwrap().tracker.observe(42);
        table.get_mut(first.device_id).unwrap().status = DeviceStatus::Timeout;

        let again = table.register(mac(1), 1);
        assert_eq!(again.device_id, first.device_id);
        assert!(again.is_reconnection);
        assert_eq!(again.resume_sequence, Some(42));
        assert_eq!(
            table.get(first.device_id).unwrap().status,
            DeviceStatus::Pending
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reconnection_before_any_data_has_no_resume_sequence() {
        let mut table = DeviceTable::new(DEFAULT_WINDOW_SIZE);
        let first = table.register(mac(1), 1);
        let again = table.register(mac(1), 1);
        assert_eq!(again.device_id, first.device_id);
        assert!(again.is_reconnection);
        assert_eq!(again.resume_sequence, None);
    }

    #[test]
    fn test_state_transitions() {
        let mut table = DeviceTable::new(DEFAULT_WINDOW_SIZE);
        let id = table.register(mac(1), 1).device_id;
        assert_eq!(table.get(id).unwrap().status, DeviceStatus::Pending);

        table.get_mut(id).unwrap().status = DeviceStatus::Active;
        table.expire_to_timeout(id);
        assert_eq!(table.get(id).unwrap().status, DeviceStatus::Timeout);

        table.mark_down(id);
        assert_eq!(table.get(id).unwrap().status, DeviceStatus::Down);
    }

    #[tokio::test]
    async fn test_timeout_ceiling_needs_ten_samples() {
        let mut table = DeviceTable::new(DEFAULT_WINDOW_SIZE);
        let id = table.register(mac(1), 1).device_id;
        let device = table.get_mut(id).unwrap();

        let mut now = Instant::now();
        for _ in 0..10 {
            device.touch(now);
            now += std::time::Duration::from_secs(2);
        }
        // 10 arrivals produce only 9 intervals
        assert_eq!(device.timeout_ceiling(), None);

        device.touch(now);
        let ceiling = device.timeout_ceiling().unwrap();
        assert!((ceiling - 20.0).abs() < 1e-9);
    }
}
