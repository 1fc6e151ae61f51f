//! Out-of-process observers of image loads and unloads.
//!
//! A monitor is told about every batch of images added to or removed from the registry. Delivery
//! is best effort: a monitor whose endpoint has gone away is dropped from its slot, and one that
//! does not acknowledge a message in time is marked a zombie and never contacted again.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::image::LoadedImage;

/// Number of monitors that may be registered at once.
pub const MAX_MONITORS: usize = 8;

/// Fixed per-message overhead when computing encoded sizes.
const HEADER_SIZE: usize = 24;
/// Per-image overhead on top of the path bytes.
const IMAGE_ENTRY_SIZE: usize = 8 + 16 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorImage {
    pub load_address: usize,
    pub uuid: Uuid,
    pub path: String,
}

impl From<&LoadedImage> for MonitorImage {
    fn from(value: &LoadedImage) -> Self {
        Self {
            load_address: value.load_address(),
            uuid: value.descriptor().uuid(),
            path: value.path().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorMessage {
    pub unloading: bool,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    pub images: Vec<MonitorImage>,
}

impl MonitorMessage {
    pub fn new(unloading: bool, images: Vec<MonitorImage>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            unloading,
            timestamp,
            images,
        }
    }

    /// Size of the message on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + self
                .images
                .iter()
                .map(|i| IMAGE_ENTRY_SIZE + i.path.len())
                .sum::<usize>()
    }

    fn split(&self) -> (MonitorMessage, MonitorMessage) {
        let mid = self.images.len() / 2;
        let part = |images: &[MonitorImage]| MonitorMessage {
            unloading: self.unloading,
            timestamp: self.timestamp,
            images: images.to_vec(),
        };
        (part(&self.images[..mid]), part(&self.images[mid..]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The monitor is gone.
    Disconnected,
    /// The monitor did not acknowledge the message in time.
    TimedOut,
}

/// Something that wants to hear about image list changes.
pub trait ImageMonitor: Send + Sync {
    fn deliver(&self, message: &MonitorMessage, timeout: Duration) -> Result<(), DeliveryError>;
}

struct Slot {
    monitor: Arc<dyn ImageMonitor>,
    zombie: bool,
}

/// The fixed set of monitor slots.
pub struct MonitorSet {
    slots: Mutex<Vec<Option<Slot>>>,
    timeout: Duration,
    max_message: usize,
}

impl MonitorSet {
    pub fn new(timeout: Duration, max_message: usize) -> Self {
        Self {
            slots: Mutex::new((0..MAX_MONITORS).map(|_| None).collect()),
            timeout,
            max_message,
        }
    }

    /// Register a monitor. Returns the slot it occupies, or None if all slots are taken.
    pub fn register(&self, monitor: Arc<dyn ImageMonitor>) -> Option<usize> {
        let mut slots = self.slots.lock();
        let idx = slots.iter().position(|s| s.is_none())?;
        slots[idx] = Some(Slot {
            monitor,
            zombie: false,
        });
        debug!("registered monitor in slot {}", idx);
        Some(idx)
    }

    pub fn deregister(&self, slot: usize) {
        if let Some(s) = self.slots.lock().get_mut(slot) {
            *s = None;
        }
    }

    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.as_ref().is_some_and(|s| !s.zombie))
            .count()
    }

    pub fn is_zombie(&self, slot: usize) -> bool {
        self.slots
            .lock()
            .get(slot)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| s.zombie)
    }

    /// Tell every live monitor about a batch of images. Must not be called with registry locks
    /// held, since monitors may take a while to answer.
    pub fn notify(&self, unloading: bool, images: &[LoadedImage]) {
        if images.is_empty() {
            return;
        }
        let targets: Vec<_> = self
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Some(s) if !s.zombie => Some((i, s.monitor.clone())),
                _ => None,
            })
            .collect();
        if targets.is_empty() {
            return;
        }

        let message = MonitorMessage::new(unloading, images.iter().map(Into::into).collect());
        for (idx, monitor) in targets {
            if let Err(e) = self.send(monitor.as_ref(), &message) {
                self.mark_failed(idx, &monitor, e);
            }
        }
    }

    fn send(
        &self,
        monitor: &dyn ImageMonitor,
        message: &MonitorMessage,
    ) -> Result<(), DeliveryError> {
        if message.encoded_len() > self.max_message && message.images.len() > 1 {
            let (first, second) = message.split();
            trace!(
                "splitting {} byte monitor message in two",
                message.encoded_len()
            );
            self.send(monitor, &first)?;
            return self.send(monitor, &second);
        }
        monitor.deliver(message, self.timeout)
    }

    fn mark_failed(&self, idx: usize, monitor: &Arc<dyn ImageMonitor>, err: DeliveryError) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots[idx].as_mut() else {
            return;
        };
        // The slot may have been reused while we were delivering.
        if !Arc::ptr_eq(&slot.monitor, monitor) {
            return;
        }
        match err {
            DeliveryError::Disconnected => {
                warn!("monitor in slot {} went away, dropping it", idx);
                slots[idx] = None;
            }
            DeliveryError::TimedOut => {
                warn!("monitor in slot {} did not answer, marking it a zombie", idx);
                slot.zombie = true;
            }
        }
    }
}

type Envelope = (MonitorMessage, SyncSender<()>);

/// A monitor reached over a channel. The receiving side must acknowledge each message.
pub struct ChannelMonitor {
    sender: Mutex<Sender<Envelope>>,
}

/// The receiving half of a [ChannelMonitor].
pub struct MonitorReceiver {
    receiver: Receiver<Envelope>,
}

/// A received message awaiting acknowledgement. Dropping it without acknowledging looks like a
/// dead monitor to the sender.
pub struct Delivery {
    pub message: MonitorMessage,
    ack: SyncSender<()>,
}

impl Delivery {
    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}

impl ChannelMonitor {
    pub fn new() -> (Self, MonitorReceiver) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            MonitorReceiver { receiver },
        )
    }
}

impl ImageMonitor for ChannelMonitor {
    fn deliver(&self, message: &MonitorMessage, timeout: Duration) -> Result<(), DeliveryError> {
        let (ack, acked) = mpsc::sync_channel(1);
        if self.sender.lock().send((message.clone(), ack)).is_err() {
            return Err(DeliveryError::Disconnected);
        }
        match acked.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(DeliveryError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(DeliveryError::Disconnected),
        }
    }
}

impl MonitorReceiver {
    pub fn recv(&self) -> Option<Delivery> {
        self.receiver
            .recv()
            .ok()
            .map(|(message, ack)| Delivery { message, ack })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        self.receiver
            .recv_timeout(timeout)
            .ok()
            .map(|(message, ack)| Delivery { message, ack })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::image::ImageDescriptor;

    struct Recorder {
        messages: Mutex<Vec<MonitorMessage>>,
        fail_with: Option<DeliveryError>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(fail_with: Option<DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(vec![]),
                fail_with,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ImageMonitor for Recorder {
        fn deliver(&self, message: &MonitorMessage, _: Duration) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.fail_with {
                return Err(e);
            }
            self.messages.lock().push(message.clone());
            Ok(())
        }
    }

    fn images(n: usize) -> Vec<LoadedImage> {
        (0..n)
            .map(|i| {
                LoadedImage::new(
                    Arc::new(ImageDescriptor::new(format!("/usr/lib/lib{i}.dylib"))),
                    0x10000 * (i + 1),
                )
            })
            .collect()
    }

    #[test]
    fn oversized_messages_are_split() {
        let set = MonitorSet::new(Duration::from_millis(10), 100);
        let rec = Recorder::new(None);
        set.register(rec.clone()).unwrap();
        set.notify(false, &images(5));
        let messages = rec.messages.lock();
        assert!(messages.len() > 1);
        assert!(messages.iter().all(|m| m.encoded_len() <= 100));
        let addrs: Vec<_> = messages
            .iter()
            .flat_map(|m| m.images.iter().map(|i| i.load_address))
            .collect();
        let expected: Vec<_> = images(5).iter().map(|i| i.load_address()).collect();
        assert_eq!(addrs, expected);
    }

    #[test]
    fn failing_monitors() {
        let set = MonitorSet::new(Duration::from_millis(10), 1 << 16);
        let slow = Recorder::new(Some(DeliveryError::TimedOut));
        let gone = Recorder::new(Some(DeliveryError::Disconnected));
        let good = Recorder::new(None);
        let slow_slot = set.register(slow.clone()).unwrap();
        let gone_slot = set.register(gone.clone()).unwrap();
        set.register(good.clone()).unwrap();
        assert_eq!(set.active(), 3);

        set.notify(false, &images(1));
        assert!(set.is_zombie(slow_slot));
        assert!(!set.is_zombie(gone_slot));
        assert_eq!(set.active(), 1);

        set.notify(true, &images(2));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gone.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.messages.lock().len(), 2);
        assert!(good.messages.lock()[1].unloading);

        // The freed slot can be reused.
        assert_eq!(set.register(Recorder::new(None)), Some(gone_slot));
    }

    #[test]
    fn slots_are_bounded() {
        let set = MonitorSet::new(Duration::from_millis(10), 1 << 16);
        for _ in 0..MAX_MONITORS {
            assert!(set.register(Recorder::new(None)).is_some());
        }
        assert!(set.register(Recorder::new(None)).is_none());
    }

    #[test]
    fn channel_monitor_acks() {
        let (monitor, receiver) = ChannelMonitor::new();
        let thread = std::thread::spawn(move || {
            let d = receiver.recv().unwrap();
            let count = d.message.images.len();
            d.ack();
            // Receive but never acknowledge the second one.
            let _held = receiver.recv().unwrap();
            std::thread::sleep(Duration::from_millis(200));
            count
        });
        let msg = MonitorMessage::new(false, images(2).iter().map(Into::into).collect());
        assert_eq!(monitor.deliver(&msg, Duration::from_secs(5)), Ok(()));
        assert_eq!(
            monitor.deliver(&msg, Duration::from_millis(20)),
            Err(DeliveryError::TimedOut)
        );
        assert_eq!(thread.join().unwrap(), 2);
        assert_eq!(
            monitor.deliver(&msg, Duration::from_millis(20)),
            Err(DeliveryError::Disconnected)
        );
    }
}
