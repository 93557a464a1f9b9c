//! Publish-subscribe event distribution between pipeline components.
//!
//! Generalizes `component_a/transmitter.rs`'s non-blocking single-channel
//! idiom into a real subscriber table: many subscribers, each filtered
//! independently, each with its own bounded backlog for the events it
//! failed to process.

use dashmap::DashMap;
use log::{debug, error};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{Event, EventType, Severity};

pub type SubscriptionId = u64;

/// Default per-subscriber backlog cap (spec §4.1).
pub const DEFAULT_BACKLOG_CAP: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub sources: Option<Vec<String>>,
    pub min_severity: Option<Severity>,
}

impl EventFilter {
    fn severity_order(s: Severity) -> u8 {
        match s {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if Self::severity_order(event.severity) < Self::severity_order(min) {
                return false;
            }
        }
        true
    }
}

/// Callback failures are represented explicitly rather than via panic/unwind;
/// a subscriber returning `Err` is treated exactly like the original's
/// caught exception: the event goes into that subscriber's backlog.
pub type SubscriberCallback = dyn Fn(&Event) -> Result<(), String> + Send + Sync;

struct Subscription {
    filter: Option<EventFilter>,
    callback: Arc<SubscriberCallback>,
    backlog: Mutex<VecDeque<Event>>,
    max_backlog: usize,
    dropped_count: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_dropped: u64,
}

pub struct EventBus {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
    max_buffer_size: usize,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
    total_dropped: AtomicU64,
}

impl EventBus {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_buffer_size,
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }
}

impl Default for EventBus {
    /// Per-subscriber backlog cap defaults to `DEFAULT_BACKLOG_CAP`, distinct
    /// from and not driven by `storage.bufferSize` (that config field governs
    /// the JSONL store's write buffer, a different concern -- see `store.rs`).
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG_CAP)
    }

    pub fn subscribe(
        &self,
        callback: Arc<SubscriberCallback>,
        filter: Option<EventFilter>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                filter,
                callback,
                backlog: Mutex::new(VecDeque::with_capacity(16)),
                max_backlog: self.max_buffer_size,
                dropped_count: AtomicU64::new(0),
            },
        );
        debug!("new subscription: {id}");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.remove(&id).is_some();
        if removed {
            debug!("unsubscribed: {id}");
        }
        removed
    }

    /// Delivers `event` to every matching subscriber, returning the number
    /// that accepted it. A subscriber whose callback errors gets the event
    /// buffered instead (oldest dropped on overflow).
    pub fn publish(&self, event: &Event) -> usize {
        self.total_published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0usize;

        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if let Some(filter) = &sub.filter {
                if !filter.matches(event) {
                    continue;
                }
            }

            match (sub.callback)(event) {
                Ok(()) => {
                    delivered += 1;
                    self.total_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("error in subscriber {}: {e}", entry.key());
                    let mut backlog = sub.backlog.lock();
                    if backlog.len() >= sub.max_backlog {
                        backlog.pop_front();
                        sub.dropped_count.fetch_add(1, Ordering::Relaxed);
                        self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    backlog.push_back(event.clone());
                }
            }
        }

        delivered
    }

    pub fn buffer_size(&self, id: SubscriptionId) -> Option<usize> {
        self.subscriptions.get(&id).map(|s| s.backlog.lock().len())
    }

    pub fn dropped_count(&self, id: SubscriptionId) -> Option<u64> {
        self.subscriptions
            .get(&id)
            .map(|s| s.dropped_count.load(Ordering::Relaxed))
    }

    /// Redelivers buffered events in FIFO order, stopping at the first
    /// delivery failure (matches the original: a still-failing subscriber
    /// keeps its remaining backlog intact rather than losing events).
    pub fn flush_buffer(&self, id: SubscriptionId) -> usize {
        let Some(entry) = self.subscriptions.get(&id) else {
            return 0;
        };
        let sub = entry.value();
        let mut delivered = 0usize;
        loop {
            let event = {
                let backlog = sub.backlog.lock();
                match backlog.front() {
                    Some(e) => e.clone(),
                    None => break,
                }
            };
            match (sub.callback)(&event) {
                Ok(()) => {
                    sub.backlog.lock().pop_front();
                    delivered += 1;
                }
                Err(_) => break,
            }
        }
        delivered
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscriber_count: self.subscriptions.len(),
            total_published: self.total_published.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn make_event(source: &str, severity: Severity) -> Event {
        Event::create(source, EventType::Data, HashMap::new(), severity, None)
    }

    #[test]
    fn filter_by_severity() {
        let filter = EventFilter {
            event_types: None,
            sources: None,
            min_severity: Some(Severity::Warning),
        };
        assert!(!filter.matches(&make_event("s", Severity::Info)));
        assert!(filter.matches(&make_event("s", Severity::Critical)));
    }

    #[test]
    fn publish_delivers_to_matching_subscribers_only() {
        let bus = EventBus::new(10);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            Arc::new(move |_e: &Event| {
                count2.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
            Some(EventFilter {
                event_types: None,
                sources: Some(vec!["crypto".into()]),
                min_severity: None,
            }),
        );
        bus.publish(&make_event("crypto", Severity::Info));
        bus.publish(&make_event("weather", Severity::Info));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.stats().total_published, 2);
    }

    #[test]
    fn failed_delivery_buffers_and_overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let id = bus.subscribe(Arc::new(|_e: &Event| Err("boom".into())), None);
        for _ in 0..3 {
            bus.publish(&make_event("s", Severity::Info));
        }
        assert_eq!(bus.buffer_size(id), Some(2));
        assert_eq!(bus.dropped_count(id), Some(1));
        assert_eq!(bus.stats().total_dropped, 1);
    }

    #[test]
    fn flush_buffer_stops_at_first_failure() {
        let bus = EventBus::new(10);
        let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = should_fail.clone();
        let id = bus.subscribe(
            Arc::new(move |_e: &Event| {
                if flag.load(Ordering::Relaxed) {
                    Err("nope".into())
                } else {
                    Ok(())
                }
            }),
            None,
        );
        bus.publish(&make_event("s", Severity::Info));
        bus.publish(&make_event("s", Severity::Info));
        assert_eq!(bus.buffer_size(id), Some(2));
        assert_eq!(bus.flush_buffer(id), 0);
        should_fail.store(false, Ordering::Relaxed);
        assert_eq!(bus.flush_buffer(id), 2);
        assert_eq!(bus.buffer_size(id), Some(0));
    }
}
