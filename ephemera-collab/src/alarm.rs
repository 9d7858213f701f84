//! Durable per-document alarms.
//!
//! Each document has at most one pending alarm. The wake-up time is written
//! to storage first and then armed as a tokio timer; on restart
//! [`AlarmScheduler::recover`] re-arms every persisted alarm, firing overdue
//! ones immediately. Fired keys are delivered on the receiver returned by
//! [`AlarmScheduler::new`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::document::DocumentKey;
use crate::storage::{Storage, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AlarmError {
    #[error("alarm storage failed: {0}")]
    Storage(#[from] StoreError),
}

struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    armed: HashMap<DocumentKey, ArmedTimer>,
}

/// Schedules one durable wake-up per document.
pub struct AlarmScheduler {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    timers: Mutex<Timers>,
    fired: mpsc::UnboundedSender<DocumentKey>,
}

impl AlarmScheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DocumentKey>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            storage,
            clock,
            timers: Mutex::new(Timers::default()),
            fired,
        });
        (scheduler, rx)
    }

    /// Persist and arm an alarm, replacing any pending one for `doc`.
    pub fn set_alarm(self: &Arc<Self>, doc: DocumentKey, at_ms: u64) -> Result<(), AlarmError> {
        self.storage.put_alarm(doc, at_ms)?;
        self.arm(doc, at_ms);
        Ok(())
    }

    /// Disarm and forget the alarm of `doc`, if any.
    pub fn cancel(&self, doc: DocumentKey) -> Result<(), AlarmError> {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(timer) = timers.armed.remove(&doc) {
                timer.task.abort();
            }
        }
        self.storage.delete_alarm(doc)?;
        Ok(())
    }

    /// Re-arm every persisted alarm. Returns how many were armed.
    pub fn recover(self: &Arc<Self>) -> Result<usize, AlarmError> {
        let alarms = self.storage.alarms()?;
        let count = alarms.len();
        let now = self.clock.now_ms();
        for (doc, at_ms) in alarms {
            if at_ms <= now {
                log::debug!("Alarm for {doc} overdue by {}ms, firing now", now - at_ms);
            }
            self.arm(doc, at_ms);
        }
        if count > 0 {
            log::info!("Recovered {count} document alarms");
        }
        Ok(count)
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.timers.lock().map(|t| t.armed.len()).unwrap_or(0)
    }

    fn arm(self: &Arc<Self>, doc: DocumentKey, at_ms: u64) {
        let delay = Duration::from_millis(at_ms.saturating_sub(self.clock.now_ms()));
        let Ok(mut timers) = self.timers.lock() else {
            log::error!("Alarm table poisoned, alarm for {doc} not armed");
            return;
        };
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = weak.upgrade() {
                scheduler.fire(doc, generation);
            }
        });

        if let Some(previous) = timers.armed.insert(doc, ArmedTimer { generation, task }) {
            previous.task.abort();
        }
    }

    fn fire(&self, doc: DocumentKey, generation: u64) {
        if let Ok(mut timers) = self.timers.lock() {
            // A newer set_alarm replaced this timer after it woke up
            match timers.armed.get(&doc) {
                Some(timer) if timer.generation == generation => {
                    timers.armed.remove(&doc);
                }
                _ => return,
            }
        }
        if let Err(e) = self.storage.delete_alarm(doc) {
            log::warn!("Failed to clear fired alarm for {doc}: {e}");
        }
        log::debug!("Alarm fired for {doc}");
        let _ = self.fired.send(doc);
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for timer in timers.armed.values() {
                timer.task.abort();
            }
        }
    }
}
