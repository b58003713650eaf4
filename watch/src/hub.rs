use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use metastore_model::kv::{classify_range, RangeKind};
use metastore_model::{CResult, Revision, WatchEvent, WatchId};
use parking_lot::RwLock;

/// A registered stream: the range it watches, the revision floor it started
/// at, and the channel events are pushed onto.
struct Stream {
    key: Vec<u8>,
    range_end: Vec<u8>,
    start_revision: Revision,
    sender: Sender<WatchEvent>,
}

impl Stream {
    fn matches(&self, event: &WatchEvent) -> bool {
        if event.kv.mod_revision < self.start_revision {
            return false;
        }
        match classify_range(&self.range_end) {
            RangeKind::Point => event.kv.key == self.key,
            RangeKind::Open => event.kv.key.as_slice() >= self.key.as_slice(),
            RangeKind::Bounded(end) => {
                event.kv.key.as_slice() >= self.key.as_slice() && event.kv.key.as_slice() < end
            }
        }
    }
}

/// The receiving half handed back to a caller of `WatchHub::create`
/// (SPEC_FULL.md §3, Watch Stream).
pub struct WatchHandle {
    pub watch_id: WatchId,
    pub events: Receiver<WatchEvent>,
}

/// The Watch Hub (SPEC_FULL.md §4.1, §4.4 "Watch Hub" box). One read-write
/// lock guards the registry; each stream's delivery past that point only
/// touches its own bounded channel (SPEC_FULL.md §5).
pub struct WatchHub {
    streams: RwLock<HashMap<WatchId, Stream>>,
    buffer_size: usize,
    send_deadline: Duration,
}

impl WatchHub {
    pub fn new(buffer_size: usize, send_deadline: Duration) -> Self {
        WatchHub {
            streams: RwLock::new(HashMap::new()),
            buffer_size,
            send_deadline,
        }
    }

    /// Register a new watch stream starting at `start_revision`. Callers
    /// (the `store` facade) are responsible for resolving `start_revision =
    /// 0` to `current_revision + 1` and for rejecting a floor below the
    /// compaction point before calling this — `WatchHub` itself has no
    /// notion of the compacted floor.
    pub fn create(&self, watch_id: WatchId, key: Vec<u8>, range_end: Vec<u8>, start_revision: Revision) -> WatchHandle {
        let (sender, receiver) = bounded(self.buffer_size);
        let stream = Stream {
            key,
            range_end,
            start_revision,
            sender,
        };
        self.streams.write().insert(watch_id, stream);
        WatchHandle {
            watch_id,
            events: receiver,
        }
    }

    /// Terminate a stream; its receiver observes channel disconnection,
    /// which callers surface as `*WatchCanceled*`. Cancelling an unknown or
    /// already-cancelled `watch_id` is not an error (SPEC_FULL.md §4.1 lists
    /// no error case for CancelWatch).
    pub fn cancel(&self, watch_id: WatchId) -> CResult<()> {
        self.streams.write().remove(&watch_id);
        Ok(())
    }

    /// Drop every registered stream, e.g. on engine shutdown
    /// (SPEC_FULL.md §3: "terminated by ... engine shutdown").
    pub fn shutdown(&self) {
        self.streams.write().clear();
    }

    pub fn active_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Fan an apply step's events out to every matching stream, stamping
    /// each delivered copy with that stream's `watch_id`
    /// (SPEC_FULL.md §3: `watch_id` is per-stream, not per-event-source).
    ///
    /// A stream whose buffer is full is given `send_deadline` to drain
    /// before it is cancelled (SPEC_FULL.md §9: "block the emitter with a
    /// deadline, and cancel the slow stream ... after the deadline").
    pub fn dispatch(&self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        let mut stale = Vec::new();
        {
            let streams = self.streams.read();
            for (watch_id, stream) in streams.iter() {
                for event in events {
                    if !stream.matches(event) {
                        continue;
                    }
                    let mut stamped = event.clone();
                    stamped.watch_id = *watch_id;
                    match stream.sender.send_timeout(stamped, self.send_deadline) {
                        Ok(()) => {}
                        Err(_) => {
                            warn!(
                                "watch {} did not drain within {:?}; cancelling",
                                watch_id, self.send_deadline
                            );
                            stale.push(*watch_id);
                            break;
                        }
                    }
                }
            }
        }
        if !stale.is_empty() {
            let mut streams = self.streams.write();
            for watch_id in stale {
                streams.remove(&watch_id);
                debug!("watch {} cancelled for backpressure", watch_id);
            }
        }
    }
}

impl Default for WatchHub {
    fn default() -> Self {
        WatchHub::new(1024, Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_model::kv::RANGE_END_OPEN;
    use metastore_model::{KeyValue, WatchEventKind};

    fn put_event(key: &[u8], revision: Revision) -> WatchEvent {
        WatchEvent {
            watch_id: 0,
            kind: WatchEventKind::Put,
            kv: KeyValue {
                key: key.to_vec(),
                value: b"v".to_vec(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease_id: 0,
            },
            prev_kv: None,
        }
    }

    #[test]
    fn point_watch_only_sees_its_own_key() {
        let hub = WatchHub::new(8, Duration::from_millis(100));
        let handle = hub.create(1, b"a".to_vec(), Vec::new(), 1);
        hub.dispatch(&[put_event(b"a", 1), put_event(b"b", 1)]);
        let got = handle.events.try_recv().unwrap();
        assert_eq!(got.kv.key, b"a");
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn open_range_watch_filters_by_start_revision() {
        let hub = WatchHub::new(8, Duration::from_millis(100));
        let handle = hub.create(2, b"a".to_vec(), RANGE_END_OPEN.to_vec(), 5);
        hub.dispatch(&[put_event(b"z", 4), put_event(b"z", 5)]);
        let got = handle.events.try_recv().unwrap();
        assert_eq!(got.kv.mod_revision, 5);
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn cancel_disconnects_the_receiver() {
        let hub = WatchHub::new(8, Duration::from_millis(100));
        let handle = hub.create(3, b"a".to_vec(), Vec::new(), 1);
        hub.cancel(3).unwrap();
        hub.dispatch(&[put_event(b"a", 1)]);
        assert!(handle.events.recv().is_err());
    }

    #[test]
    fn delivered_events_are_stamped_with_the_stream_watch_id() {
        let hub = WatchHub::new(8, Duration::from_millis(100));
        let handle = hub.create(42, b"a".to_vec(), Vec::new(), 1);
        hub.dispatch(&[put_event(b"a", 1)]);
        let got = handle.events.try_recv().unwrap();
        assert_eq!(got.watch_id, 42);
    }
}
