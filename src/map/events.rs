//! Live progress events for a run.
//!
//! Subscribers (a progress display, a plot, a test) receive every phase change, reading and
//! written row over a Tokio broadcast channel. Emitting never blocks and never fails the run:
//! with no subscribers the event is simply dropped, and a lagging subscriber loses the oldest
//! events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::map::RunPhase;

/// Default channel capacity.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    PhaseChanged {
        phase: RunPhase,
    },
    OffsetMeasured {
        value: f64,
        std: f64,
    },
    PowerLeveled {
        frequency_ghz: f64,
        power_dbm: f64,
    },
    /// One value pair appended to the row in progress.
    Reading {
        index: usize,
        azimuth: f64,
        elevation: Option<f64>,
        frequency_ghz: f64,
        channel: Option<u8>,
        first: f64,
        second: f64,
    },
    RowWritten {
        index: usize,
        azimuth: f64,
        elevation: Option<f64>,
    },
    Finished {
        rows: usize,
    },
    Failed {
        phase: RunPhase,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ScanEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(ScanEvent::PhaseChanged {
            phase: RunPhase::Homing,
        });
        bus.emit(ScanEvent::Finished { rows: 3 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ScanEvent::PhaseChanged {
                phase: RunPhase::Homing
            }
        );
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::Finished { rows: 3 });
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBus::new(1).emit(ScanEvent::Finished { rows: 0 });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&ScanEvent::RowWritten {
            index: 2,
            azimuth: 0.0,
            elevation: None,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"event":"row_written","index":2,"azimuth":0.0,"elevation":null}"#
        );
    }
}
