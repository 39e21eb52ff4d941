//! Realtime session hub: live rosters, join codes and fan-out of session events.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use server_api::session_summary;
use shared::{
    domain::{SessionId, SessionStatus, StudentId, MAX_PROBLEM_TEXT_CHARS},
    protocol::{ClientCommand, ServerEvent, StudentSummary},
};
use storage::{Storage, StoredSession};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::executor::{execute_for_student, ExecutorConfig};

const JOIN_CODE_LEN: usize = 6;
const JOIN_CODE_ATTEMPTS: usize = 8;
const MAX_STUDENT_NAME_CHARS: usize = 64;

pub type ConnectionId = u64;
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Unbound,
    Instructor(SessionId),
    Student {
        session_id: SessionId,
        student_id: StudentId,
    },
    Public(SessionId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("session not found or already ended")]
    SessionNotFound,
    #[error("no session with join code {0}")]
    UnknownJoinCode(String),
    #[error("no active session for this connection")]
    NoActiveSession,
    #[error("student {0} is not in this session")]
    StudentNotFound(StudentId),
    #[error("only students can submit code")]
    NotAStudent,
    #[error("this connection already joined a session")]
    AlreadyJoined,
    #[error("student name cannot be empty")]
    EmptyStudentName,
    #[error("student name exceeds {} characters", MAX_STUDENT_NAME_CHARS)]
    StudentNameTooLong,
    #[error("problem text exceeds {} characters", MAX_PROBLEM_TEXT_CHARS)]
    ProblemTooLong,
    #[error("code exceeds {0} bytes")]
    CodeTooLarge(usize),
    #[error("could not allocate an unused join code")]
    JoinCodesExhausted,
    #[error("storage failure: {0}")]
    Storage(String),
}

fn storage_error(err: anyhow::Error) -> HubError {
    HubError::Storage(err.to_string())
}

struct Connection {
    tx: Outbound,
    role: ConnectionRole,
}

struct LiveStudent {
    name: String,
    code: String,
    has_submitted: bool,
    connection: ConnectionId,
}

struct LiveSession {
    join_code: String,
    problem_text: String,
    instructor: Option<ConnectionId>,
    students: BTreeMap<StudentId, LiveStudent>,
    public_viewers: HashSet<ConnectionId>,
    featured: Option<StudentId>,
}

impl LiveSession {
    fn new(join_code: String, problem_text: String) -> Self {
        Self {
            join_code,
            problem_text,
            instructor: None,
            students: BTreeMap::new(),
            public_viewers: HashSet::new(),
            featured: None,
        }
    }

    fn roster(&self) -> Vec<StudentSummary> {
        self.students
            .iter()
            .map(|(id, student)| StudentSummary {
                id: *id,
                name: student.name.clone(),
                has_submitted_code: student.has_submitted,
            })
            .collect()
    }

    fn featured_event(&self) -> Option<ServerEvent> {
        let student_id = self.featured?;
        let student = self.students.get(&student_id)?;
        Some(ServerEvent::PublicSubmission {
            student_id,
            student_name: student.name.clone(),
            code: student.code.clone(),
        })
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    sessions: HashMap<SessionId, LiveSession>,
    join_codes: HashMap<String, SessionId>,
    next_connection_id: ConnectionId,
    next_student_id: i64,
}

impl HubState {
    fn send(&self, connection: ConnectionId, event: ServerEvent) {
        if let Some(conn) = self.connections.get(&connection) {
            if conn.tx.send(event).is_err() {
                debug!(connection, "dropping event for closed connection");
            }
        }
    }

    fn role(&self, connection: ConnectionId) -> ConnectionRole {
        self.connections
            .get(&connection)
            .map(|conn| conn.role)
            .unwrap_or(ConnectionRole::Unbound)
    }

    fn set_role(&mut self, connection: ConnectionId, role: ConnectionRole) {
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.role = role;
        }
    }

    fn instructor_session(&self, connection: ConnectionId) -> Result<SessionId, HubError> {
        match self.role(connection) {
            ConnectionRole::Instructor(session_id) if self.sessions.contains_key(&session_id) => {
                Ok(session_id)
            }
            _ => Err(HubError::NoActiveSession),
        }
    }

    fn send_roster(&self, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if let Some(instructor) = session.instructor {
            self.send(
                instructor,
                ServerEvent::StudentListUpdate {
                    students: session.roster(),
                },
            );
        }
    }

    fn send_featured(&self, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if let Some(event) = session.featured_event() {
            for viewer in &session.public_viewers {
                self.send(*viewer, event.clone());
            }
        }
    }

    fn bind_instructor(&mut self, connection: ConnectionId, session_id: SessionId) {
        if let ConnectionRole::Instructor(previous) = self.role(connection) {
            if let Some(session) = self.sessions.get_mut(&previous) {
                if session.instructor == Some(connection) {
                    session.instructor = None;
                }
            }
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.instructor = Some(connection);
        }
        self.set_role(connection, ConnectionRole::Instructor(session_id));
    }

    fn unused_join_code(&self) -> String {
        loop {
            let candidate: String = uuid::Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(JOIN_CODE_LEN)
                .collect::<String>()
                .to_ascii_uppercase();
            if !self.join_codes.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

pub struct Hub {
    storage: Storage,
    executor: ExecutorConfig,
    max_code_bytes: usize,
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new(storage: Storage, executor: ExecutorConfig, max_code_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            storage,
            executor,
            max_code_bytes,
            state: Mutex::new(HubState::default()),
        })
    }

    pub async fn connect(&self, tx: Outbound) -> ConnectionId {
        let mut state = self.state.lock().await;
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            Connection {
                tx,
                role: ConnectionRole::Unbound,
            },
        );
        id
    }

    pub async fn role(&self, connection: ConnectionId) -> ConnectionRole {
        self.state.lock().await.role(connection)
    }

    pub async fn participant_count(&self, session_id: SessionId) -> u32 {
        self.state
            .lock()
            .await
            .sessions
            .get(&session_id)
            .map(|session| session.students.len() as u32)
            .unwrap_or(0)
    }

    pub async fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.state.lock().await;
        let Some(conn) = state.connections.remove(&connection) else {
            return;
        };
        match conn.role {
            ConnectionRole::Unbound => {}
            ConnectionRole::Instructor(session_id) => {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    if session.instructor == Some(connection) {
                        session.instructor = None;
                    }
                }
                info!(session_id = session_id.0, "instructor disconnected; session stays live");
            }
            ConnectionRole::Student {
                session_id,
                student_id,
            } => {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.students.remove(&student_id);
                    if session.featured == Some(student_id) {
                        session.featured = None;
                    }
                }
                state.send_roster(session_id);
            }
            ConnectionRole::Public(session_id) => {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.public_viewers.remove(&connection);
                }
            }
        }
    }

    /// Applies one command; failures are reported to the sender as `ERROR` events.
    pub async fn handle(&self, connection: ConnectionId, command: ClientCommand) {
        let kind = command.kind();
        if let Err(err) = self.dispatch(connection, command).await {
            warn!(connection, command = kind, error = %err, "command rejected");
            self.state
                .lock()
                .await
                .send(connection, ServerEvent::error(err.to_string()));
        }
    }

    async fn dispatch(
        &self,
        connection: ConnectionId,
        command: ClientCommand,
    ) -> Result<(), HubError> {
        match command {
            ClientCommand::ListSessions => self.list_sessions(connection).await,
            ClientCommand::CreateSession => self.create_session(connection).await,
            ClientCommand::JoinExistingSession { session_id } => {
                self.join_existing_session(connection, session_id).await
            }
            ClientCommand::EndSession { session_id } => {
                self.end_session(connection, session_id).await
            }
            ClientCommand::UpdateProblem { problem_text } => {
                self.update_problem(connection, problem_text).await
            }
            ClientCommand::RequestStudentCode { student_id } => {
                let state = self.state.lock().await;
                let session_id = state.instructor_session(connection)?;
                let code = state
                    .sessions
                    .get(&session_id)
                    .and_then(|session| session.students.get(&student_id))
                    .map(|student| student.code.clone())
                    .ok_or(HubError::StudentNotFound(student_id))?;
                state.send(
                    connection,
                    ServerEvent::StudentCode {
                        student_id: Some(student_id),
                        code,
                    },
                );
                Ok(())
            }
            ClientCommand::ExecuteStudentCode { student_id } => {
                self.execute_student_code(connection, student_id).await
            }
            ClientCommand::SelectSubmissionForPublic { student_id } => {
                let mut state = self.state.lock().await;
                let session_id = state.instructor_session(connection)?;
                let session = state
                    .sessions
                    .get_mut(&session_id)
                    .ok_or(HubError::SessionNotFound)?;
                if !session.students.contains_key(&student_id) {
                    return Err(HubError::StudentNotFound(student_id));
                }
                session.featured = Some(student_id);
                state.send_featured(session_id);
                Ok(())
            }
            ClientCommand::JoinSession {
                join_code,
                student_name,
            } => self.join_session(connection, &join_code, &student_name).await,
            ClientCommand::UpdateCode { code } => self.update_code(connection, code).await,
            ClientCommand::WatchPublic { join_code } => {
                let mut state = self.state.lock().await;
                let normalized = normalize_join_code(&join_code);
                let session_id = *state
                    .join_codes
                    .get(&normalized)
                    .ok_or(HubError::UnknownJoinCode(normalized))?;
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.public_viewers.insert(connection);
                }
                state.set_role(connection, ConnectionRole::Public(session_id));
                if let Some(event) = state
                    .sessions
                    .get(&session_id)
                    .and_then(LiveSession::featured_event)
                {
                    state.send(connection, event);
                }
                Ok(())
            }
        }
    }

    async fn list_sessions(&self, connection: ConnectionId) -> Result<(), HubError> {
        let stored = self
            .storage
            .list_sessions(Some(SessionStatus::Active))
            .await
            .map_err(storage_error)?;
        let state = self.state.lock().await;
        let sessions = stored
            .into_iter()
            .map(|session| {
                let count = state
                    .sessions
                    .get(&session.session_id)
                    .map(|live| live.students.len() as u32)
                    .unwrap_or(0);
                session_summary(session, count)
            })
            .collect();
        state.send(connection, ServerEvent::SessionList { sessions });
        Ok(())
    }

    async fn create_session(&self, connection: ConnectionId) -> Result<(), HubError> {
        let stored = self.store_new_session(HubState::unused_join_code).await?;
        let session_id = stored.session_id;
        let join_code = stored.join_code;

        let mut state = self.state.lock().await;
        state.join_codes.insert(join_code.clone(), session_id);
        state
            .sessions
            .insert(session_id, LiveSession::new(join_code.clone(), stored.problem_text));
        state.bind_instructor(connection, session_id);
        info!(session_id = session_id.0, %join_code, "session created");
        state.send(
            connection,
            ServerEvent::SessionCreated {
                session_id,
                join_code,
            },
        );
        Ok(())
    }

    /// Inserts a session under the first code from `next_code` that no stored session holds.
    async fn store_new_session(
        &self,
        mut next_code: impl FnMut(&HubState) -> String,
    ) -> Result<StoredSession, HubError> {
        for _ in 0..JOIN_CODE_ATTEMPTS {
            let join_code = next_code(&*self.state.lock().await);
            let stored = self
                .storage
                .try_create_session(&join_code, None, "")
                .await
                .map_err(storage_error)?;
            match stored {
                Some(stored) => return Ok(stored),
                None => debug!(%join_code, "join code already stored; drawing another"),
            }
        }
        Err(HubError::JoinCodesExhausted)
    }

    /// Brings a stored active session back after a restart, with an empty roster.
    /// New student ids start above any id that already has revisions in it.
    async fn restore_session(&self, stored: StoredSession) -> Result<SessionId, HubError> {
        if stored.status != SessionStatus::Active {
            return Err(HubError::SessionNotFound);
        }
        let session_id = stored.session_id;
        let max_student = self
            .storage
            .max_student_id(session_id)
            .await
            .map_err(storage_error)?;

        let mut state = self.state.lock().await;
        if let Some(StudentId(max)) = max_student {
            state.next_student_id = state.next_student_id.max(max);
        }
        if !state.sessions.contains_key(&session_id) {
            info!(session_id = session_id.0, join_code = %stored.join_code, "restoring stored session");
            state.join_codes.insert(stored.join_code.clone(), session_id);
            state.sessions.insert(
                session_id,
                LiveSession::new(stored.join_code, stored.problem_text),
            );
        }
        Ok(session_id)
    }

    async fn join_existing_session(
        &self,
        connection: ConnectionId,
        session_id: SessionId,
    ) -> Result<(), HubError> {
        let is_live = self.state.lock().await.sessions.contains_key(&session_id);
        if !is_live {
            let stored = self
                .storage
                .load_session(session_id)
                .await
                .map_err(storage_error)?
                .ok_or(HubError::SessionNotFound)?;
            self.restore_session(stored).await?;
        }

        let mut state = self.state.lock().await;
        state.bind_instructor(connection, session_id);
        let session = state
            .sessions
            .get(&session_id)
            .ok_or(HubError::SessionNotFound)?;
        let join_code = session.join_code.clone();
        let students = session.roster();
        state.send(
            connection,
            ServerEvent::SessionJoined {
                session_id,
                join_code,
            },
        );
        state.send(connection, ServerEvent::StudentListUpdate { students });
        Ok(())
    }

    async fn end_session(
        &self,
        connection: ConnectionId,
        session_id: SessionId,
    ) -> Result<(), HubError> {
        let ended = self
            .storage
            .end_session(session_id)
            .await
            .map_err(storage_error)?;

        let mut state = self.state.lock().await;
        let live = state.sessions.remove(&session_id);
        if !ended && live.is_none() {
            return Err(HubError::SessionNotFound);
        }

        let mut recipients: HashSet<ConnectionId> = HashSet::from([connection]);
        if let Some(session) = live {
            state.join_codes.remove(&session.join_code);
            recipients.extend(session.instructor);
            recipients.extend(session.students.values().map(|student| student.connection));
            recipients.extend(session.public_viewers.iter().copied());
        }
        for recipient in recipients {
            let bound_here = match state.role(recipient) {
                ConnectionRole::Instructor(id) | ConnectionRole::Public(id) => id == session_id,
                ConnectionRole::Student { session_id: id, .. } => id == session_id,
                ConnectionRole::Unbound => false,
            };
            if bound_here {
                state.set_role(recipient, ConnectionRole::Unbound);
            }
            state.send(recipient, ServerEvent::SessionEnded { session_id });
        }
        info!(session_id = session_id.0, "session ended");
        Ok(())
    }

    async fn update_problem(
        &self,
        connection: ConnectionId,
        problem_text: String,
    ) -> Result<(), HubError> {
        if problem_text.chars().count() > MAX_PROBLEM_TEXT_CHARS {
            return Err(HubError::ProblemTooLong);
        }
        let session_id = self.state.lock().await.instructor_session(connection)?;
        self.storage
            .update_session_problem(session_id, &problem_text)
            .await
            .map_err(storage_error)?;

        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(HubError::SessionNotFound)?;
        session.problem_text = problem_text.clone();
        let students: Vec<ConnectionId> = session
            .students
            .values()
            .map(|student| student.connection)
            .collect();
        for student in students {
            state.send(
                student,
                ServerEvent::ProblemUpdated {
                    problem_text: problem_text.clone(),
                },
            );
        }
        Ok(())
    }

    async fn execute_student_code(
        &self,
        connection: ConnectionId,
        student_id: StudentId,
    ) -> Result<(), HubError> {
        let (code, reply_to) = {
            let state = self.state.lock().await;
            let session_id = state.instructor_session(connection)?;
            let code = state
                .sessions
                .get(&session_id)
                .and_then(|session| session.students.get(&student_id))
                .map(|student| student.code.clone())
                .ok_or(HubError::StudentNotFound(student_id))?;
            let reply_to = state
                .connections
                .get(&connection)
                .map(|conn| conn.tx.clone())
                .ok_or(HubError::NoActiveSession)?;
            (code, reply_to)
        };

        let executor = self.executor.clone();
        tokio::spawn(async move {
            let result = execute_for_student(&executor, student_id, &code).await;
            debug!(
                student_id = student_id.0,
                success = result.success,
                elapsed_ms = result.execution_time_ms,
                "execution finished"
            );
            let _ = reply_to.send(ServerEvent::ExecutionResult(result));
        });
        Ok(())
    }

    async fn join_session(
        &self,
        connection: ConnectionId,
        join_code: &str,
        student_name: &str,
    ) -> Result<(), HubError> {
        let name = student_name.trim();
        if name.is_empty() {
            return Err(HubError::EmptyStudentName);
        }
        if name.chars().count() > MAX_STUDENT_NAME_CHARS {
            return Err(HubError::StudentNameTooLong);
        }

        let normalized = normalize_join_code(join_code);
        let is_live = {
            let state = self.state.lock().await;
            if state.role(connection) != ConnectionRole::Unbound {
                return Err(HubError::AlreadyJoined);
            }
            state.join_codes.contains_key(&normalized)
        };
        if !is_live {
            let stored = self
                .storage
                .load_session_by_join_code(&normalized)
                .await
                .map_err(storage_error)?
                .filter(|session| session.status == SessionStatus::Active)
                .ok_or_else(|| HubError::UnknownJoinCode(normalized.clone()))?;
            self.restore_session(stored).await?;
        }

        let session_id = {
            let mut state = self.state.lock().await;
            if state.role(connection) != ConnectionRole::Unbound {
                return Err(HubError::AlreadyJoined);
            }
            let session_id = *state
                .join_codes
                .get(&normalized)
                .ok_or(HubError::UnknownJoinCode(normalized))?;

            state.next_student_id += 1;
            let student_id = StudentId(state.next_student_id);
            let session = state
                .sessions
                .get_mut(&session_id)
                .ok_or(HubError::SessionNotFound)?;
            session.students.insert(
                student_id,
                LiveStudent {
                    name: name.to_string(),
                    code: String::new(),
                    has_submitted: false,
                    connection,
                },
            );
            let problem_text = session.problem_text.clone();
            state.set_role(
                connection,
                ConnectionRole::Student {
                    session_id,
                    student_id,
                },
            );
            state.send(
                connection,
                ServerEvent::StudentJoined {
                    session_id,
                    student_id,
                    problem_text,
                },
            );
            state.send_roster(session_id);
            info!(session_id = session_id.0, student_id = student_id.0, "student joined");
            session_id
        };

        if let Err(error) = self.storage.touch_session(session_id).await {
            warn!(session_id = session_id.0, %error, "failed to record session activity");
        }
        Ok(())
    }

    async fn update_code(&self, connection: ConnectionId, code: String) -> Result<(), HubError> {
        if code.len() > self.max_code_bytes {
            return Err(HubError::CodeTooLarge(self.max_code_bytes));
        }

        let (session_id, student_id, student_name) = {
            let mut state = self.state.lock().await;
            let ConnectionRole::Student {
                session_id,
                student_id,
            } = state.role(connection)
            else {
                return Err(HubError::NotAStudent);
            };
            let session = state
                .sessions
                .get_mut(&session_id)
                .ok_or(HubError::SessionNotFound)?;
            let is_featured = session.featured == Some(student_id);
            let student = session
                .students
                .get_mut(&student_id)
                .ok_or(HubError::StudentNotFound(student_id))?;
            let first_submission = !student.has_submitted;
            student.code = code.clone();
            student.has_submitted = true;
            let student_name = student.name.clone();

            if first_submission {
                state.send_roster(session_id);
            }
            if is_featured {
                state.send_featured(session_id);
            }
            (session_id, student_id, student_name)
        };

        if let Err(error) = self
            .storage
            .insert_revision(session_id, student_id, &student_name, &code)
            .await
        {
            warn!(
                session_id = session_id.0,
                student_id = student_id.0,
                %error,
                "failed to persist code revision"
            );
        }
        Ok(())
    }
}

fn normalize_join_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
