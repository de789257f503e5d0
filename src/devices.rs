//! Output-device management: enumeration, hotplug and capability
//! queries.
//!
//! Some drivers never announce disconnection, so in addition to the
//! initial scan the manager runs a heartbeat thread that re-snapshots
//! the device list every ~2 seconds and diffs it against the previous
//! one, emitting [`DeviceEvent`]s for connects, disconnects and default
//! changes over an mpsc channel.
//!
//! Enumeration itself sits behind [`DeviceEnumerator`] so the manager
//! is testable without hardware; [`CpalEnumerator`] is the production
//! implementation.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    mpsc::Sender,
    Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::Duration;

use ::cpal::traits::{DeviceTrait, HostTrait};

use crate::{events::DeviceEvent, output::AudioDeviceInfo};

/// Liveness polling interval.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Granularity of the poll loop's shutdown checks.
const POLL_STEP: Duration = Duration::from_millis(200);

/// Source of device snapshots and capability queries.
pub trait DeviceEnumerator: Send + Sync + 'static {
    /// Enumerates output devices right now.
    fn snapshot(&self) -> Vec<AudioDeviceInfo>;

    /// Discrete sample rates the device supports.
    fn supported_sample_rates(&self, device_id: u32) -> Vec<u32>;

    /// Buffer-size range `(min, max)` in frames, when the driver
    /// reports one.
    fn buffer_size_range(&self, device_id: u32) -> Option<(u32, u32)>;
}

/// cpal-backed enumerator. Opens the default host per call; hosts are
/// cheap handles and this keeps the type `Send` on every platform.
pub struct CpalEnumerator;

impl CpalEnumerator {
    fn device_by_id(host: &::cpal::Host, device_id: u32) -> Option<::cpal::Device> {
        if device_id == 0 {
            return host.default_output_device();
        }
        host.output_devices().ok()?.nth(device_id as usize - 1)
    }
}

impl DeviceEnumerator for CpalEnumerator {
    fn snapshot(&self) -> Vec<AudioDeviceInfo> {
        let host = ::cpal::default_host();
        let default_name = host
            .default_output_device()
            .and_then(|device| device.name().ok());

        let Ok(devices) = host.output_devices() else {
            return Vec::new();
        };

        devices
            .enumerate()
            .filter_map(|(index, device)| {
                let name = device.name().ok()?;
                let output_channels = device
                    .supported_output_configs()
                    .ok()?
                    .map(|config| usize::from(config.channels()))
                    .max()
                    .unwrap_or(0);
                Some(AudioDeviceInfo {
                    device_id: index as u32 + 1,
                    uid: name.clone(),
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    output_channels,
                    is_alive: true,
                    name,
                })
            })
            .collect()
    }

    fn supported_sample_rates(&self, device_id: u32) -> Vec<u32> {
        let host = ::cpal::default_host();
        let Some(device) = Self::device_by_id(&host, device_id) else {
            return Vec::new();
        };
        let Ok(configs) = device.supported_output_configs() else {
            return Vec::new();
        };

        let mut rates = Vec::new();
        for config in configs {
            for &rate in &crate::output::cpal::SAMPLE_RATES {
                if config
                    .try_with_sample_rate(::cpal::SampleRate(rate))
                    .is_some()
                    && !rates.contains(&rate)
                {
                    rates.push(rate);
                }
            }
        }
        rates.sort_unstable();
        rates
    }

    fn buffer_size_range(&self, device_id: u32) -> Option<(u32, u32)> {
        let host = ::cpal::default_host();
        let device = Self::device_by_id(&host, device_id)?;
        let config = device.default_output_config().ok()?;
        match config.buffer_size() {
            ::cpal::SupportedBufferSize::Range { min, max } => Some((*min, *max)),
            ::cpal::SupportedBufferSize::Unknown => None,
        }
    }
}

/// Maintains the device list and emits change events.
pub struct DeviceManager {
    enumerator: Arc<dyn DeviceEnumerator>,
    devices: Arc<Mutex<Vec<AudioDeviceInfo>>>,
    event_tx: Sender<DeviceEvent>,
    requested_buffer_size: Arc<AtomicU32>,
    stop_flag: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<()>>,
}

impl DeviceManager {
    /// Creates a manager, runs the initial scan, and starts the
    /// heartbeat thread.
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>, event_tx: Sender<DeviceEvent>) -> Self {
        let devices = Arc::new(Mutex::new(enumerator.snapshot()));

        let mut manager = Self {
            enumerator,
            devices,
            event_tx,
            requested_buffer_size: Arc::new(AtomicU32::new(0)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            poll_thread: None,
        };
        manager.start_monitoring();
        manager
    }

    /// Current device list snapshot.
    #[must_use]
    pub fn devices(&self) -> Vec<AudioDeviceInfo> {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The current default output device, if any.
    #[must_use]
    pub fn default_device(&self) -> Option<AudioDeviceInfo> {
        self.devices().into_iter().find(|device| device.is_default)
    }

    /// Looks up a device by numeric id.
    #[must_use]
    pub fn find_by_id(&self, device_id: u32) -> Option<AudioDeviceInfo> {
        self.devices()
            .into_iter()
            .find(|device| device.device_id == device_id)
    }

    /// Looks up a device by persistent UID.
    #[must_use]
    pub fn find_by_uid(&self, uid: &str) -> Option<AudioDeviceInfo> {
        self.devices().into_iter().find(|device| device.uid == uid)
    }

    /// Discrete sample rates a device supports.
    #[must_use]
    pub fn supported_sample_rates(&self, device_id: u32) -> Vec<u32> {
        self.enumerator.supported_sample_rates(device_id)
    }

    /// Buffer-size range of a device, when the driver reports one.
    #[must_use]
    pub fn buffer_size_range(&self, device_id: u32) -> Option<(u32, u32)> {
        self.enumerator.buffer_size_range(device_id)
    }

    /// The last requested buffer size; 0 means driver default.
    #[must_use]
    pub fn current_buffer_size(&self) -> u32 {
        self.requested_buffer_size.load(Ordering::Relaxed)
    }

    /// Requests a buffer size for the current output device. The value
    /// is clamped to the device's reported range and re-emitted as a
    /// [`DeviceEvent::BufferSizeChanged`] confirmation; the engine
    /// applies it to the open output.
    pub fn set_buffer_size(&self, device_id: u32, frames: u32) {
        let clamped = match self.enumerator.buffer_size_range(device_id) {
            Some((min, max)) => frames.clamp(min, max),
            None => frames,
        };
        if clamped != frames {
            info!("buffer size {frames} clamped to {clamped} by device range");
        }
        self.requested_buffer_size.store(clamped, Ordering::Relaxed);
        let _ = self.event_tx.send(DeviceEvent::BufferSizeChanged(clamped));
    }

    /// Forces a re-scan now, emitting events for any changes.
    pub fn refresh(&self) {
        let snapshot = self.enumerator.snapshot();
        Self::diff_and_publish(&self.devices, &snapshot, &self.event_tx);
    }

    /// Starts the heartbeat polling thread; idempotent.
    fn start_monitoring(&mut self) {
        if self.poll_thread.is_some() {
            return;
        }
        self.stop_flag.store(false, Ordering::Release);

        let enumerator = Arc::clone(&self.enumerator);
        let devices = Arc::clone(&self.devices);
        let event_tx = self.event_tx.clone();
        let stop_flag = Arc::clone(&self.stop_flag);

        self.poll_thread = Some(std::thread::spawn(move || {
            debug!("device heartbeat started");
            while !stop_flag.load(Ordering::Acquire) {
                // Sleep in short steps so shutdown is prompt.
                let mut slept = Duration::ZERO;
                while slept < POLL_INTERVAL && !stop_flag.load(Ordering::Acquire) {
                    std::thread::sleep(POLL_STEP);
                    slept += POLL_STEP;
                }
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }

                let snapshot = enumerator.snapshot();
                Self::diff_and_publish(&devices, &snapshot, &event_tx);
            }
            debug!("device heartbeat stopped");
        }));
    }

    /// Stops the heartbeat thread.
    pub fn stop_monitoring(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }

    /// Replaces the stored list with `snapshot` and emits the diff.
    fn diff_and_publish(
        devices: &Mutex<Vec<AudioDeviceInfo>>,
        snapshot: &[AudioDeviceInfo],
        event_tx: &Sender<DeviceEvent>,
    ) {
        let mut guard = devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, snapshot.to_vec());
        drop(guard);

        let mut changed = false;

        for old in &previous {
            if !snapshot.iter().any(|new| new.uid == old.uid) {
                info!("device disconnected: {}", old.name);
                changed = true;
                let _ = event_tx.send(DeviceEvent::DeviceDisconnected {
                    name: old.name.clone(),
                });
            }
        }

        for new in snapshot {
            if !previous.iter().any(|old| old.uid == new.uid) {
                info!("device connected: {}", new.name);
                changed = true;
                let _ = event_tx.send(DeviceEvent::DeviceConnected {
                    name: new.name.clone(),
                });
            }
        }

        let old_default = previous.iter().find(|device| device.is_default);
        let new_default = snapshot.iter().find(|device| device.is_default);
        if old_default.map(|device| &device.uid) != new_default.map(|device| &device.uid) {
            changed = true;
            if let Some(default) = new_default {
                info!("default device changed: {}", default.name);
                let _ = event_tx.send(DeviceEvent::DefaultDeviceChanged(default.name.clone()));
            }
        }

        if changed {
            let _ = event_tx.send(DeviceEvent::ListChanged);
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceEnumerator, DeviceManager};
    use crate::events::DeviceEvent;
    use crate::output::AudioDeviceInfo;
    use std::sync::{mpsc, Arc, Mutex};

    /// Scripted enumerator: each snapshot pops the next scripted list.
    struct Scripted {
        snapshots: Mutex<Vec<Vec<AudioDeviceInfo>>>,
    }

    impl Scripted {
        fn new(mut snapshots: Vec<Vec<AudioDeviceInfo>>) -> Self {
            snapshots.reverse();
            Self {
                snapshots: Mutex::new(snapshots),
            }
        }
    }

    impl DeviceEnumerator for Scripted {
        fn snapshot(&self) -> Vec<AudioDeviceInfo> {
            let mut guard = self.snapshots.lock().unwrap();
            if guard.len() > 1 {
                guard.pop().unwrap()
            } else {
                guard.last().cloned().unwrap_or_default()
            }
        }

        fn supported_sample_rates(&self, _device_id: u32) -> Vec<u32> {
            vec![44_100, 48_000, 96_000, 192_000]
        }

        fn buffer_size_range(&self, _device_id: u32) -> Option<(u32, u32)> {
            Some((64, 4_096))
        }
    }

    fn device(id: u32, name: &str, is_default: bool) -> AudioDeviceInfo {
        AudioDeviceInfo {
            device_id: id,
            name: name.to_string(),
            uid: name.to_string(),
            is_default,
            output_channels: 2,
            is_alive: true,
        }
    }

    fn drain(rx: &mpsc::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn initial_scan_populates_list() {
        let (tx, _rx) = mpsc::channel();
        let enumerator = Arc::new(Scripted::new(vec![vec![
            device(1, "Speakers", true),
            device(2, "USB DAC", false),
        ]]));
        let mut manager = DeviceManager::new(enumerator, tx);
        manager.stop_monitoring();

        assert_eq!(manager.devices().len(), 2);
        assert_eq!(manager.default_device().unwrap().name, "Speakers");
        assert_eq!(manager.find_by_uid("USB DAC").unwrap().device_id, 2);
        assert!(manager.find_by_id(3).is_none());
    }

    #[test]
    fn refresh_emits_connect_and_disconnect_events() {
        let (tx, rx) = mpsc::channel();
        let enumerator = Arc::new(Scripted::new(vec![
            vec![device(1, "Speakers", true), device(2, "USB DAC", false)],
            vec![device(1, "Speakers", true)],
        ]));
        let mut manager = DeviceManager::new(enumerator, tx);
        manager.stop_monitoring();

        manager.refresh();
        let events = drain(&rx);
        assert!(events.contains(&DeviceEvent::DeviceDisconnected {
            name: String::from("USB DAC"),
        }));
        assert!(events.contains(&DeviceEvent::ListChanged));
    }

    #[test]
    fn default_device_change_is_reported() {
        let (tx, rx) = mpsc::channel();
        let enumerator = Arc::new(Scripted::new(vec![
            vec![device(1, "Speakers", true), device(2, "USB DAC", false)],
            vec![device(1, "Speakers", false), device(2, "USB DAC", true)],
        ]));
        let mut manager = DeviceManager::new(enumerator, tx);
        manager.stop_monitoring();

        manager.refresh();
        let events = drain(&rx);
        assert!(events.contains(&DeviceEvent::DefaultDeviceChanged(String::from("USB DAC"))));
    }

    #[test]
    fn buffer_size_is_clamped_and_confirmed() {
        let (tx, rx) = mpsc::channel();
        let enumerator = Arc::new(Scripted::new(vec![vec![device(1, "Speakers", true)]]));
        let mut manager = DeviceManager::new(enumerator, tx);
        manager.stop_monitoring();
        drain(&rx);

        manager.set_buffer_size(1, 100_000);
        assert_eq!(manager.current_buffer_size(), 4_096);
        let events = drain(&rx);
        assert!(events.contains(&DeviceEvent::BufferSizeChanged(4_096)));
    }

    #[test]
    fn capability_queries_pass_through() {
        let (tx, _rx) = mpsc::channel();
        let enumerator = Arc::new(Scripted::new(vec![vec![device(1, "Speakers", true)]]));
        let mut manager = DeviceManager::new(enumerator, tx);
        manager.stop_monitoring();

        assert_eq!(
            manager.supported_sample_rates(1),
            vec![44_100, 48_000, 96_000, 192_000],
        );
        assert_eq!(manager.buffer_size_range(1), Some((64, 4_096)));
    }
}
