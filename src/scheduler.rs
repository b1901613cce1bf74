use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::DispatchSettings;
use crate::dispatch::{AttemptOutcome, DeviceStatus, Dispatcher, SchedulerEvent};
use crate::error::DispatchError;
use crate::registry::DeviceRecord;
use crate::transport::Transport;

enum Command {
    ReportState {
        address: String,
        state: String,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    GetState {
        address: String,
        reply: oneshot::Sender<DeviceStatus>,
    },
    CancelPending {
        address: String,
        reply: oneshot::Sender<bool>,
    },
    TestPush {
        address: String,
        reply: oneshot::Sender<Result<AttemptOutcome, DispatchError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
}

/// Owns the dispatcher and applies reports, timer fires and send
/// completions one at a time.
pub struct Scheduler {
    dispatcher: Dispatcher,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: DispatchSettings,
    ) -> (Self, SchedulerHandle) {
        let (commands_tx, commands) = mpsc::channel(64);
        let (events_tx, events) = mpsc::unbounded_channel();

        (
            Scheduler {
                dispatcher: Dispatcher::new(transport, settings, events_tx),
                commands,
                events,
            },
            SchedulerHandle {
                commands: commands_tx,
            },
        )
    }

    /// Runs until every [`SchedulerHandle`] has been dropped.
    pub async fn run(self) {
        let Scheduler {
            mut dispatcher,
            mut commands,
            mut events,
        } = self;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => handle_command(&mut dispatcher, command),
                    None => {
                        debug!("All scheduler handles dropped");
                        break;
                    }
                },
                Some(event) = events.recv() => {
                    dispatcher.handle_event(event, Instant::now());
                }
            }
        }

        dispatcher.shutdown();
        info!("Scheduler stopped");
    }
}

fn handle_command(dispatcher: &mut Dispatcher, command: Command) {
    match command {
        Command::ReportState {
            address,
            state,
            reply,
        } => {
            let result = dispatcher.report_state_change(&address, &state, Instant::now());
            let _ = reply.send(result);
        }
        Command::GetState { address, reply } => {
            let _ = reply.send(dispatcher.get_state(&address));
        }
        Command::CancelPending { address, reply } => {
            let _ = reply.send(dispatcher.cancel_pending(&address));
        }
        Command::TestPush { address, reply } => {
            let _ = reply.send(dispatcher.send_test(&address, Instant::now()));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(dispatcher.snapshot().collect());
        }
    }
}

impl SchedulerHandle {
    pub async fn report_state_change(
        &self,
        address: impl Into<String>,
        state: impl Into<String>,
    ) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::ReportState {
                address: address.into(),
                state: state.into(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn get_state(&self, address: impl Into<String>) -> Result<DeviceStatus, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::GetState {
                address: address.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Returns whether a pending follow-up was cancelled.
    pub async fn cancel_pending(&self, address: impl Into<String>) -> Result<bool, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::CancelPending {
                address: address.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn send_test(&self, address: impl Into<String>) -> Result<AttemptOutcome, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::TestPush {
                address: address.into(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn snapshot(&self) -> Result<Vec<DeviceRecord>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Snapshot { reply }, rx).await
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, DispatchError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DispatchError::SchedulerClosed)?;
        rx.await.map_err(|_| DispatchError::SchedulerClosed)
    }
}
