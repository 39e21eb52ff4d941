//! Async owner of a [`SessionViewController`]: feeds it user intents, channel
//! events and create-session deadlines, and publishes snapshots.

use std::{future, sync::Arc};

use anyhow::{anyhow, Result};
use shared::{
    domain::{SessionId, StudentId},
    protocol::ClientCommand,
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, watch,
    },
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    channel::{ChannelEvent, MessageChannel},
    controller::{ControllerError, SessionViewController, View},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    ListSessions,
    CreateSession,
    JoinExistingSession(SessionId),
    EndSession(SessionId),
    EndActiveSession,
    UpdateProblem(String),
    SelectStudent(StudentId),
    ExecuteStudentCode(StudentId),
    FeatureSubmission(StudentId),
    Navigate(View),
    DismissError,
}

pub struct SessionDriver {
    intents: mpsc::Sender<Intent>,
    snapshots: watch::Receiver<SessionViewController>,
    task: JoinHandle<()>,
}

impl SessionDriver {
    pub fn spawn(channel: Arc<dyn MessageChannel>, controller: SessionViewController) -> Self {
        let (intents, intent_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshots) = watch::channel(controller.clone());
        let events = channel.subscribe();
        let task = tokio::spawn(run(channel, controller, events, intent_rx, snapshot_tx));
        Self {
            intents,
            snapshots,
            task,
        }
    }

    pub async fn submit(&self, intent: Intent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| anyhow!("session driver stopped"))
    }

    pub fn snapshot(&self) -> SessionViewController {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionViewController> {
        self.snapshots.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionViewController) -> bool,
    ) -> Result<SessionViewController> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|controller| predicate(controller))
            .await
            .map_err(|_| anyhow!("session driver stopped"))?;
        Ok(snapshot.clone())
    }

    pub async fn shutdown(self) {
        drop(self.intents);
        if let Err(err) = self.task.await {
            warn!(%err, "session driver task failed");
        }
    }
}

async fn run(
    channel: Arc<dyn MessageChannel>,
    mut controller: SessionViewController,
    mut events: broadcast::Receiver<ChannelEvent>,
    mut intents: mpsc::Receiver<Intent>,
    snapshots: watch::Sender<SessionViewController>,
) {
    let initial = controller.set_channel_state(channel.state());
    dispatch(channel.as_ref(), &mut controller, initial).await;
    snapshots.send_replace(controller.clone());

    loop {
        let pending = controller.pending_create();
        let deadline = async {
            match pending {
                Some(pending) => tokio::time::sleep_until(Instant::from_std(pending.deadline)).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            intent = intents.recv() => {
                let Some(intent) = intent else { break };
                debug!(?intent, "dispatching intent");
                let commands = apply_intent(&mut controller, intent);
                dispatch(channel.as_ref(), &mut controller, commands).await;
            }
            event = events.recv() => match event {
                Ok(ChannelEvent::Message(event)) => {
                    let commands = controller.apply(event);
                    dispatch(channel.as_ref(), &mut controller, commands).await;
                }
                Ok(ChannelEvent::StateChanged(state)) => {
                    debug!(?state, "channel state changed");
                    let commands = controller.set_channel_state(state);
                    dispatch(channel.as_ref(), &mut controller, commands).await;
                }
                Ok(ChannelEvent::Malformed(frame)) => {
                    warn!(len = frame.len(), "ignoring malformed server frame");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session driver lagged behind channel events");
                    // A skipped StateChanged would leave the controller on a stale state.
                    let commands = controller.set_channel_state(channel.state());
                    dispatch(channel.as_ref(), &mut controller, commands).await;
                }
                Err(RecvError::Closed) => break,
            },
            () = deadline => {
                if let Some(pending) = pending {
                    controller.expire_create(pending.request_id, Instant::now().into_std());
                }
            }
        }

        snapshots.send_replace(controller.clone());
    }
}

fn apply_intent(controller: &mut SessionViewController, intent: Intent) -> Vec<ClientCommand> {
    let outcome = match intent {
        Intent::ListSessions => controller.list_sessions().map(Some),
        Intent::CreateSession => controller.create_session(Instant::now().into_std()),
        Intent::JoinExistingSession(session_id) => {
            controller.join_existing_session(session_id).map(Some)
        }
        Intent::EndSession(session_id) => controller.end_session(session_id).map(Some),
        Intent::EndActiveSession => controller.end_active_session().map(Some),
        Intent::UpdateProblem(text) => controller.update_problem(text).map(Some),
        Intent::SelectStudent(student_id) => controller.select_student(student_id).map(Some),
        Intent::ExecuteStudentCode(student_id) => {
            controller.execute_student_code(student_id).map(Some)
        }
        Intent::FeatureSubmission(student_id) => {
            controller.feature_submission(student_id).map(Some)
        }
        Intent::Navigate(view) => controller.navigate(view).map(|()| None),
        Intent::DismissError => {
            controller.dismiss_error();
            Ok(None)
        }
    };
    match outcome {
        Ok(command) => command.into_iter().collect(),
        Err(err) => {
            log_refusal(&err);
            Vec::new()
        }
    }
}

fn log_refusal(err: &ControllerError) {
    debug!(category = ?err.category(), %err, "intent refused locally");
}

async fn dispatch(
    channel: &dyn MessageChannel,
    controller: &mut SessionViewController,
    commands: Vec<ClientCommand>,
) {
    for command in commands {
        debug!(kind = command.kind(), "sending command");
        if let Err(err) = channel.send(command.clone()).await {
            warn!(kind = command.kind(), %err, "command send failed");
            controller.send_failed(&command, err.to_string());
        }
    }
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;
