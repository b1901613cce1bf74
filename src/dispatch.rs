//! Per-device notification state machine.
//!
//! A state report for `background`, `hidden` or `terminated` sends one push
//! right away and arms a single follow-up timer. Reporting `foreground`
//! disarms it. Every attempt re-checks the device's current state and the
//! debounce window before anything reaches the transport. A send that is
//! still in flight counts toward the debounce window.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::DispatchSettings;
use crate::error::{DispatchError, TransportError};
use crate::messages::{LifecycleState, Notification};
use crate::registry::{DeviceRecord, Registry};
use crate::transport::Transport;

/// Asynchronous results fed back into the dispatcher.
#[derive(Debug)]
pub enum SchedulerEvent {
    TimerFired {
        address: String,
        expected: LifecycleState,
        timer_id: u64,
    },
    SendCompleted {
        address: String,
        expected: LifecycleState,
        attempted_at: Instant,
        outcome: Result<(), TransportError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Handed to the transport.
    Dispatched,
    /// The address is no longer tracked.
    Missing,
    /// The device left the state the attempt was scheduled for.
    Stale,
    Debounced,
    /// The state has no notification copy (`foreground`, `unknown`).
    NotNotifiable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: LifecycleState,
    pub last_updated: Option<Instant>,
    pub last_notification: Option<Instant>,
}

impl DeviceStatus {
    fn unknown() -> Self {
        DeviceStatus {
            state: LifecycleState::Unknown,
            last_updated: None,
            last_notification: None,
        }
    }
}

impl From<&DeviceRecord> for DeviceStatus {
    fn from(record: &DeviceRecord) -> Self {
        DeviceStatus {
            state: record.lifecycle_state,
            last_updated: Some(record.state_timestamp),
            last_notification: record.last_notification,
        }
    }
}

struct PendingTimer {
    id: u64,
    task: AbortHandle,
}

pub struct Dispatcher {
    registry: Registry,
    timers: HashMap<String, PendingTimer>,
    transport: Arc<dyn Transport>,
    settings: DispatchSettings,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    /// Attempt instant of the send awaiting its outcome, per address.
    in_flight: HashMap<String, Instant>,
    next_timer_id: u64,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: DispatchSettings,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Dispatcher {
            registry: Registry::new(),
            timers: HashMap::new(),
            transport,
            settings,
            events,
            in_flight: HashMap::new(),
            next_timer_id: 0,
        }
    }

    pub fn report_state_change(
        &mut self,
        address: &str,
        state: &str,
        now: Instant,
    ) -> Result<(), DispatchError> {
        if address.is_empty() {
            return Err(DispatchError::InvalidAddress(address.to_string()));
        }
        let state: LifecycleState = state.parse()?;

        let previous = self.registry.upsert(address, state, now);
        if previous == state {
            debug!("{} re-reported {}", address, state);
            return Ok(());
        }
        info!("{} changed state: {} -> {}", address, previous, state);

        match state {
            LifecycleState::Foreground => {
                self.cancel_pending(address);
            }
            LifecycleState::Background | LifecycleState::Hidden | LifecycleState::Terminated => {
                self.cancel_pending(address);
                let outcome = self.attempt_notify(address, state, now);
                debug!("Immediate notification for {}: {:?}", address, outcome);
                self.schedule_follow_up(address, state);
            }
            LifecycleState::Unknown => {}
        }

        Ok(())
    }

    /// Sends the notification for `expected` unless the device has moved on
    /// or was notified within the debounce window.
    pub fn attempt_notify(
        &mut self,
        address: &str,
        expected: LifecycleState,
        now: Instant,
    ) -> AttemptOutcome {
        let Some(record) = self.registry.get(address) else {
            return AttemptOutcome::Missing;
        };
        if record.lifecycle_state != expected {
            debug!(
                "Dropping stale {} notification for {} (now {})",
                expected, address, record.lifecycle_state
            );
            return AttemptOutcome::Stale;
        }
        if self.is_debounced(address, now) {
            debug!("Debounced notification for {}", address);
            return AttemptOutcome::Debounced;
        }
        let Some(notification) = Notification::for_state(address, expected) else {
            return AttemptOutcome::NotNotifiable;
        };

        info!("Sending {} notification to {}", expected, address);
        self.dispatch(notification, expected, now);
        AttemptOutcome::Dispatched
    }

    /// Manual test push. Goes to any address, tracked or not, but still
    /// respects the debounce window.
    pub fn send_test(&mut self, address: &str, now: Instant) -> Result<AttemptOutcome, DispatchError> {
        if address.is_empty() {
            return Err(DispatchError::InvalidAddress(address.to_string()));
        }
        if self.is_debounced(address, now) {
            debug!("Debounced test notification for {}", address);
            return Ok(AttemptOutcome::Debounced);
        }

        let state = self.get_state(address).state;
        info!("Sending test notification to {}", address);
        self.dispatch(Notification::test(address), state, now);
        Ok(AttemptOutcome::Dispatched)
    }

    fn is_debounced(&self, address: &str, now: Instant) -> bool {
        let last_sent = self.registry.get(address).and_then(|r| r.last_notification);
        let in_flight = self.in_flight.get(address).copied();
        match last_sent.max(in_flight) {
            Some(last) => now.saturating_duration_since(last) < self.settings.debounce,
            None => false,
        }
    }

    fn dispatch(&mut self, notification: Notification, expected: LifecycleState, now: Instant) {
        let address = notification.address.clone();
        self.in_flight.insert(address.clone(), now);

        let send = self.transport.send(notification);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = send.await;
            let _ = events.send(SchedulerEvent::SendCompleted {
                address,
                expected,
                attempted_at: now,
                outcome,
            });
        });
    }

    /// Returns whether a timer was pending.
    pub fn cancel_pending(&mut self, address: &str) -> bool {
        match self.timers.remove(address) {
            Some(timer) => {
                timer.task.abort();
                debug!("Cancelled pending notification for {}", address);
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self, address: &str) -> bool {
        self.timers.contains_key(address)
    }

    pub fn handle_event(&mut self, event: SchedulerEvent, now: Instant) {
        match event {
            SchedulerEvent::TimerFired {
                address,
                expected,
                timer_id,
            } => {
                if self.timers.get(&address).map(|t| t.id) != Some(timer_id) {
                    debug!("Ignoring superseded timer {} for {}", timer_id, address);
                    return;
                }
                // fired timers are inert
                self.timers.remove(&address);

                let outcome = self.attempt_notify(&address, expected, now);
                debug!("Follow-up notification for {}: {:?}", address, outcome);
            }
            SchedulerEvent::SendCompleted {
                address,
                expected,
                attempted_at,
                outcome,
            } => {
                if self.in_flight.get(&address) == Some(&attempted_at) {
                    self.in_flight.remove(&address);
                }
                match outcome {
                    Ok(()) => {
                        debug!("Delivered {} notification to {}", expected, address);
                        self.registry
                            .record_notification_sent(&address, attempted_at);
                    }
                    Err(err) if err.is_permanent() => {
                        warn!("Forgetting {}: {}", address, err);
                        self.cancel_pending(&address);
                        self.registry.remove(&address);
                    }
                    Err(err) => {
                        warn!(
                            "Dropping {} notification for {}: {}",
                            expected, address, err
                        );
                    }
                }
            }
        }
    }

    pub fn get_state(&self, address: &str) -> DeviceStatus {
        self.registry
            .get(address)
            .map(DeviceStatus::from)
            .unwrap_or_else(DeviceStatus::unknown)
    }

    pub fn snapshot(&self) -> impl Iterator<Item = DeviceRecord> + Clone + '_ {
        self.registry.snapshot()
    }

    pub fn shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }

    fn schedule_follow_up(&mut self, address: &str, state: LifecycleState) {
        let Some(delay) = self.settings.follow_up_delay(state) else {
            return;
        };

        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;

        let events = self.events.clone();
        let fired_address = address.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SchedulerEvent::TimerFired {
                address: fired_address,
                expected: state,
                timer_id,
            });
        });

        let timer = PendingTimer {
            id: timer_id,
            task: task.abort_handle(),
        };
        if let Some(replaced) = self.timers.insert(address.to_string(), timer) {
            replaced.task.abort();
        }
        debug!(
            "Scheduled {} follow-up for {} in {:?}",
            state, address, delay
        );
    }
}
