use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ClassId, ProblemId, RevisionId, SectionId, SessionId, SessionStatus, StudentId,
};

/// Commands sent over the realtime channel, as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    ListSessions,
    CreateSession,
    JoinExistingSession {
        session_id: SessionId,
    },
    EndSession {
        session_id: SessionId,
    },
    UpdateProblem {
        problem_text: String,
    },
    RequestStudentCode {
        student_id: StudentId,
    },
    ExecuteStudentCode {
        student_id: StudentId,
    },
    SelectSubmissionForPublic {
        student_id: StudentId,
    },
    JoinSession {
        join_code: String,
        student_name: String,
    },
    UpdateCode {
        code: String,
    },
    WatchPublic {
        join_code: String,
    },
}

impl ClientCommand {
    /// Wire tag, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListSessions => "LIST_SESSIONS",
            Self::CreateSession => "CREATE_SESSION",
            Self::JoinExistingSession { .. } => "JOIN_EXISTING_SESSION",
            Self::EndSession { .. } => "END_SESSION",
            Self::UpdateProblem { .. } => "UPDATE_PROBLEM",
            Self::RequestStudentCode { .. } => "REQUEST_STUDENT_CODE",
            Self::ExecuteStudentCode { .. } => "EXECUTE_STUDENT_CODE",
            Self::SelectSubmissionForPublic { .. } => "SELECT_SUBMISSION_FOR_PUBLIC",
            Self::JoinSession { .. } => "JOIN_SESSION",
            Self::UpdateCode { .. } => "UPDATE_CODE",
            Self::WatchPublic { .. } => "WATCH_PUBLIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub join_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_id: Option<ProblemId>,
    #[serde(default)]
    pub problem_text: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default)]
    pub participant_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub id: StudentId,
    pub name: String,
    pub has_submitted_code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Events pushed by the server over the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    SessionCreated {
        session_id: SessionId,
        join_code: String,
    },
    SessionList {
        sessions: Vec<SessionSummary>,
    },
    SessionJoined {
        session_id: SessionId,
        join_code: String,
    },
    SessionEnded {
        session_id: SessionId,
    },
    StudentListUpdate {
        students: Vec<StudentSummary>,
    },
    StudentCode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        student_id: Option<StudentId>,
        code: String,
    },
    ExecutionResult(ExecutionResult),
    Error {
        error: String,
    },
    StudentJoined {
        session_id: SessionId,
        student_id: StudentId,
        problem_text: String,
    },
    ProblemUpdated {
        problem_text: String,
    },
    PublicSubmission {
        student_id: StudentId,
        student_name: String,
        code: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub id: ClassId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSummary {
    pub id: SectionId,
    pub class_id: ClassId,
    pub name: String,
    #[serde(default)]
    pub semester: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemSummary {
    pub id: ProblemId,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRevision {
    pub id: RevisionId,
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub student_name: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionInput {
    pub name: String,
    #[serde(default)]
    pub semester: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter_code: Option<String>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
