// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous fan-out of change events to subscribed sinks

use parking_lot::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::{EventKind, EventSink, SubscriptionId};

type Subscribers = Vec<(SubscriptionId, Arc<dyn EventSink>)>;

pub(crate) struct EventBus {
    enabled: bool,
    sinks: RwLock<Subscribers>,
    #[cfg_attr(not(feature = "events"), allow(dead_code))]
    next_id: AtomicU64,
}

impl EventBus {
    /// A disabled bus accepts subscriptions but never delivers.
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sinks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[cfg(feature = "events")]
    pub(crate) fn subscribe(&self, sink: Arc<dyn EventSink>) -> FsResult<SubscriptionId> {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        self.sinks.write().push((id, sink));
        tracing::debug!(subscription = id.0, "event sink subscribed");
        Ok(id)
    }

    #[cfg(not(feature = "events"))]
    pub(crate) fn subscribe(&self, _sink: Arc<dyn EventSink>) -> FsResult<SubscriptionId> {
        Err(FsError::Unsupported)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> FsResult<()> {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sub, _)| *sub != id);
        if sinks.len() == before {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    /// True when an emitted event would reach at least one sink.
    pub(crate) fn active(&self) -> bool {
        self.enabled && !self.sinks.read().is_empty()
    }

    /// Deliver to every sink on the calling thread. The subscriber list is
    /// copied first so sinks may subscribe or unsubscribe others.
    pub(crate) fn emit(&self, event: EventKind) {
        if !self.enabled {
            return;
        }
        let sinks: Subscribers = self.sinks.read().clone();
        for (_, sink) in &sinks {
            sink.on_event(&event);
        }
    }

    /// Build the event only when someone will receive it.
    pub(crate) fn emit_with(&self, event: impl FnOnce() -> EventKind) {
        if self.active() {
            self.emit(event());
        }
    }
}

#[cfg(all(test, feature = "events"))]
mod tests {
    use super::*;
    use crate::{BranchId, MockEventSink};
    use mockall::Sequence;

    fn created(path: &str) -> EventKind {
        EventKind::Created {
            branch: BranchId::DEFAULT,
            path: path.into(),
        }
    }

    #[test]
    fn delivers_in_order_to_every_sink() {
        let bus = EventBus::new(true);
        let mut seq = Sequence::new();
        let mut first = MockEventSink::new();
        first
            .expect_on_event()
            .withf(|evt| *evt == created("/a"))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        first
            .expect_on_event()
            .withf(|evt| *evt == created("/b"))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let mut second = MockEventSink::new();
        second.expect_on_event().times(2).return_const(());

        bus.subscribe(Arc::new(first)).unwrap();
        bus.subscribe(Arc::new(second)).unwrap();
        bus.emit(created("/a"));
        bus.emit(created("/b"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(true);
        let mut sink = MockEventSink::new();
        sink.expect_on_event().times(1).return_const(());
        let id = bus.subscribe(Arc::new(sink)).unwrap();
        bus.emit(created("/x"));
        bus.unsubscribe(id).unwrap();
        bus.emit(created("/y"));
        assert!(matches!(bus.unsubscribe(id), Err(FsError::NotFound)));
        assert!(!bus.active());
    }

    #[test]
    fn disabled_bus_is_silent() {
        let bus = EventBus::new(false);
        let mut sink = MockEventSink::new();
        sink.expect_on_event().never();
        bus.subscribe(Arc::new(sink)).unwrap();
        bus.emit(created("/quiet"));
        bus.emit_with(|| created("/lazy"));
        assert!(!bus.active());
    }
}
