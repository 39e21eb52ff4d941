//! Instructor-side session view state and its transition rules.
//!
//! [`SessionViewController`] is a plain state struct: user actions return the
//! command to put on the wire (or a local refusal), inbound [`ServerEvent`]s
//! are folded in through [`SessionViewController::apply`], and time only
//! enters through explicit `now` arguments.

use std::time::{Duration, Instant};

use shared::{
    domain::{SessionId, StudentId, MAX_PROBLEM_TEXT_CHARS},
    protocol::{ClientCommand, ExecutionResult, ServerEvent, SessionSummary, StudentSummary},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::ChannelState;

pub const CREATE_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    Classes,
    Sections,
    Problems,
    Sessions,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub join_code: String,
}

/// Identity of one create-session attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCreate {
    pub request_id: RequestId,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connectivity,
    Server,
    Validation,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("not connected to the session server")]
    NotConnected,
    #[error("failed to reach the session server: {0}")]
    Transport(String),
    #[error("{0}")]
    Server(String),
    #[error("problem text is {len} characters; the limit is {max}")]
    ProblemTooLong { len: usize, max: usize },
    #[error("no active session")]
    NoActiveSession,
    #[error("session creation timed out; please try again")]
    CreateTimedOut,
}

impl ControllerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConnected | Self::Transport(_) => ErrorCategory::Connectivity,
            Self::Server(_) => ErrorCategory::Server,
            Self::ProblemTooLong { .. } | Self::NoActiveSession => ErrorCategory::Validation,
            Self::CreateTimedOut => ErrorCategory::Timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionViewController {
    channel_state: ChannelState,
    view: View,
    active_session: Option<ActiveSession>,
    sessions: Vec<SessionSummary>,
    roster: Vec<StudentSummary>,
    selected_student: Option<StudentId>,
    code_buffer: Option<String>,
    executing_student: Option<StudentId>,
    execution_result: Option<ExecutionResult>,
    featured_student: Option<StudentId>,
    problem_text: String,
    error: Option<ControllerError>,
    pending_create: Option<PendingCreate>,
    next_request_id: u64,
    create_timeout: Duration,
}

impl Default for SessionViewController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionViewController {
    pub fn new() -> Self {
        Self::with_create_timeout(CREATE_SESSION_TIMEOUT)
    }

    pub fn with_create_timeout(create_timeout: Duration) -> Self {
        Self {
            channel_state: ChannelState::Disconnected,
            view: View::Classes,
            active_session: None,
            sessions: Vec::new(),
            roster: Vec::new(),
            selected_student: None,
            code_buffer: None,
            executing_student: None,
            execution_result: None,
            featured_student: None,
            problem_text: String::new(),
            error: None,
            pending_create: None,
            next_request_id: 0,
            create_timeout,
        }
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn active_session(&self) -> Option<&ActiveSession> {
        self.active_session.as_ref()
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active_session.as_ref().map(|active| active.session_id)
    }

    pub fn sessions(&self) -> &[SessionSummary] {
        &self.sessions
    }

    pub fn roster(&self) -> &[StudentSummary] {
        &self.roster
    }

    pub fn selected_student(&self) -> Option<StudentId> {
        self.selected_student
    }

    pub fn code_buffer(&self) -> Option<&str> {
        self.code_buffer.as_deref()
    }

    pub fn execution_result(&self) -> Option<&ExecutionResult> {
        self.execution_result.as_ref()
    }

    pub fn featured_student(&self) -> Option<StudentId> {
        self.featured_student
    }

    pub fn problem_text(&self) -> &str {
        &self.problem_text
    }

    pub fn error(&self) -> Option<&ControllerError> {
        self.error.as_ref()
    }

    pub fn pending_create(&self) -> Option<PendingCreate> {
        self.pending_create
    }

    /// Records channel connectivity. Regaining the connection refreshes the
    /// session list and rebinds to the active session, if any.
    pub fn set_channel_state(&mut self, state: ChannelState) -> Vec<ClientCommand> {
        let was_connected = self.channel_state.is_connected();
        self.channel_state = state;
        if was_connected || !state.is_connected() {
            return Vec::new();
        }

        let mut commands = vec![ClientCommand::ListSessions];
        if let Some(active) = &self.active_session {
            info!(session_id = active.session_id.0, "rejoining active session after reconnect");
            commands.push(ClientCommand::JoinExistingSession {
                session_id: active.session_id,
            });
        }
        commands
    }

    /// Explicit navigation. The session view needs an active session.
    pub fn navigate(&mut self, view: View) -> Result<(), ControllerError> {
        if view == View::Session && self.active_session.is_none() {
            return Err(ControllerError::NoActiveSession);
        }
        self.view = view;
        Ok(())
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    pub fn list_sessions(&mut self) -> Result<ClientCommand, ControllerError> {
        self.ensure_connected()?;
        Ok(ClientCommand::ListSessions)
    }

    /// Returns `Ok(None)` while an earlier create is still in flight.
    pub fn create_session(&mut self, now: Instant) -> Result<Option<ClientCommand>, ControllerError> {
        self.ensure_connected()?;
        if let Some(pending) = self.pending_create {
            debug!(request = pending.request_id.0, "create already in flight");
            return Ok(None);
        }

        self.next_request_id += 1;
        let request_id = RequestId(self.next_request_id);
        self.pending_create = Some(PendingCreate {
            request_id,
            deadline: now + self.create_timeout,
        });
        self.error = None;
        Ok(Some(ClientCommand::CreateSession))
    }

    /// Fires the timeout for `request_id` if it is still the pending create
    /// and its deadline has passed. Returns whether it fired.
    pub fn expire_create(&mut self, request_id: RequestId, now: Instant) -> bool {
        match self.pending_create {
            Some(pending) if pending.request_id == request_id && now >= pending.deadline => {
                warn!(request = request_id.0, "session creation timed out");
                self.pending_create = None;
                self.error = Some(ControllerError::CreateTimedOut);
                true
            }
            _ => false,
        }
    }

    pub fn tick(&mut self, now: Instant) -> bool {
        match self.pending_create {
            Some(pending) => self.expire_create(pending.request_id, now),
            None => false,
        }
    }

    pub fn join_existing_session(
        &mut self,
        session_id: SessionId,
    ) -> Result<ClientCommand, ControllerError> {
        self.ensure_connected()?;
        Ok(ClientCommand::JoinExistingSession { session_id })
    }

    pub fn end_session(&mut self, session_id: SessionId) -> Result<ClientCommand, ControllerError> {
        self.ensure_connected()?;
        Ok(ClientCommand::EndSession { session_id })
    }

    pub fn end_active_session(&mut self) -> Result<ClientCommand, ControllerError> {
        let session_id = self.require_active_session()?;
        self.end_session(session_id)
    }

    pub fn update_problem(
        &mut self,
        problem_text: impl Into<String>,
    ) -> Result<ClientCommand, ControllerError> {
        let problem_text = problem_text.into();
        self.ensure_connected()?;
        let len = problem_text.chars().count();
        if len > MAX_PROBLEM_TEXT_CHARS {
            return self.refuse(ControllerError::ProblemTooLong {
                len,
                max: MAX_PROBLEM_TEXT_CHARS,
            });
        }
        self.require_active_session()?;
        self.problem_text = problem_text.clone();
        Ok(ClientCommand::UpdateProblem { problem_text })
    }

    /// Selecting a student drops the previous student's code and run output.
    pub fn select_student(&mut self, student_id: StudentId) -> Result<ClientCommand, ControllerError> {
        self.ensure_connected()?;
        self.require_active_session()?;
        self.selected_student = Some(student_id);
        self.code_buffer = None;
        self.execution_result = None;
        self.executing_student = None;
        Ok(ClientCommand::RequestStudentCode { student_id })
    }

    pub fn execute_student_code(
        &mut self,
        student_id: StudentId,
    ) -> Result<ClientCommand, ControllerError> {
        self.ensure_connected()?;
        self.require_active_session()?;
        self.execution_result = None;
        self.executing_student = Some(student_id);
        Ok(ClientCommand::ExecuteStudentCode { student_id })
    }

    pub fn feature_submission(
        &mut self,
        student_id: StudentId,
    ) -> Result<ClientCommand, ControllerError> {
        self.ensure_connected()?;
        self.require_active_session()?;
        self.featured_student = Some(student_id);
        Ok(ClientCommand::SelectSubmissionForPublic { student_id })
    }

    /// Reports that `command` never reached the server.
    pub fn send_failed(&mut self, command: &ClientCommand, reason: impl Into<String>) {
        if matches!(command, ClientCommand::CreateSession) {
            self.pending_create = None;
        }
        self.error = Some(ControllerError::Transport(reason.into()));
    }

    /// Folds one inbound event into the view state and returns any follow-up commands.
    pub fn apply(&mut self, event: ServerEvent) -> Vec<ClientCommand> {
        match event {
            ServerEvent::SessionCreated {
                session_id,
                join_code,
            }
            | ServerEvent::SessionJoined {
                session_id,
                join_code,
            } => {
                self.pending_create = None;
                if self.error == Some(ControllerError::CreateTimedOut) {
                    self.error = None;
                }
                self.activate(session_id, join_code);
                Vec::new()
            }
            ServerEvent::SessionList { sessions } => {
                self.sessions = sessions;
                Vec::new()
            }
            ServerEvent::SessionEnded { session_id } => {
                self.sessions.retain(|session| session.id != session_id);
                if self.active_session_id() != Some(session_id) {
                    return Vec::new();
                }
                info!(session_id = session_id.0, "active session ended");
                self.active_session = None;
                self.clear_session_detail();
                self.view = View::Sessions;
                vec![ClientCommand::ListSessions]
            }
            ServerEvent::StudentListUpdate { students } => {
                self.roster = students;
                Vec::new()
            }
            ServerEvent::StudentCode { student_id, code } => {
                match (self.selected_student, student_id) {
                    (None, _) => debug!("dropping student code with no student selected"),
                    (Some(selected), Some(tagged)) if selected != tagged => {
                        debug!(
                            selected = selected.0,
                            tagged = tagged.0,
                            "dropping stale student code"
                        );
                    }
                    (Some(_), _) => self.code_buffer = Some(code),
                }
                Vec::new()
            }
            ServerEvent::ExecutionResult(result) => {
                match (result.student_id, self.executing_student) {
                    (Some(tagged), Some(running)) if tagged != running => {
                        debug!(tagged = tagged.0, "dropping result for superseded run");
                    }
                    (Some(tagged), None) => {
                        debug!(tagged = tagged.0, "dropping result for abandoned run");
                    }
                    _ => {
                        self.executing_student = None;
                        self.execution_result = Some(result);
                    }
                }
                Vec::new()
            }
            ServerEvent::Error { error } => {
                warn!(%error, "server reported error");
                self.pending_create = None;
                self.error = Some(ControllerError::Server(error));
                Vec::new()
            }
            ServerEvent::StudentJoined { .. }
            | ServerEvent::ProblemUpdated { .. }
            | ServerEvent::PublicSubmission { .. } => Vec::new(),
        }
    }

    fn activate(&mut self, session_id: SessionId, join_code: String) {
        if self.active_session_id() != Some(session_id) {
            self.clear_session_detail();
        }
        self.active_session = Some(ActiveSession {
            session_id,
            join_code,
        });
        self.view = View::Session;
    }

    fn clear_session_detail(&mut self) {
        self.roster.clear();
        self.selected_student = None;
        self.code_buffer = None;
        self.executing_student = None;
        self.execution_result = None;
        self.featured_student = None;
        self.problem_text.clear();
    }

    fn ensure_connected(&mut self) -> Result<(), ControllerError> {
        if self.channel_state.is_connected() {
            Ok(())
        } else {
            self.refuse(ControllerError::NotConnected)
        }
    }

    fn require_active_session(&mut self) -> Result<SessionId, ControllerError> {
        match self.active_session_id() {
            Some(session_id) => Ok(session_id),
            None => self.refuse(ControllerError::NoActiveSession),
        }
    }

    fn refuse<T>(&mut self, err: ControllerError) -> Result<T, ControllerError> {
        self.error = Some(err.clone());
        Err(err)
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
