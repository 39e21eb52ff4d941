use shared::{
    domain::{ClassId, ProblemId, SectionId, SessionId, SessionStatus, StudentId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClassInput, ClassSummary, CodeRevision, ProblemInput, ProblemSummary, SectionInput,
        SectionSummary, SessionSummary,
    },
};
use storage::{Storage, StoredClass, StoredProblem, StoredSession};
use tracing::error;

const MAX_NAME_CHARS: usize = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn list_classes(ctx: &ApiContext) -> Result<Vec<ClassSummary>, ApiError> {
    let classes = ctx.storage.list_classes().await.map_err(internal)?;
    Ok(classes.into_iter().map(class_summary).collect())
}

pub async fn create_class(ctx: &ApiContext, input: ClassInput) -> Result<ClassSummary, ApiError> {
    let name = required_name("class name", &input.name)?;
    let class_id = ctx
        .storage
        .create_class(name, input.description.trim())
        .await
        .map_err(internal)?;
    load_class(ctx, class_id).await
}

pub async fn update_class(
    ctx: &ApiContext,
    class_id: ClassId,
    input: ClassInput,
) -> Result<ClassSummary, ApiError> {
    let name = required_name("class name", &input.name)?;
    let updated = ctx
        .storage
        .update_class(class_id, name, input.description.trim())
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::not_found("class not found"));
    }
    load_class(ctx, class_id).await
}

pub async fn delete_class(ctx: &ApiContext, class_id: ClassId) -> Result<(), ApiError> {
    let deleted = ctx.storage.delete_class(class_id).await.map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found("class not found"));
    }
    Ok(())
}

pub async fn list_sections(
    ctx: &ApiContext,
    class_id: ClassId,
) -> Result<Vec<SectionSummary>, ApiError> {
    ensure_class_exists(ctx, class_id).await?;
    let sections = ctx
        .storage
        .list_sections_for_class(class_id)
        .await
        .map_err(internal)?;
    Ok(sections
        .into_iter()
        .map(|section| SectionSummary {
            id: section.section_id,
            class_id: section.class_id,
            name: section.name,
            semester: section.semester,
        })
        .collect())
}

pub async fn create_section(
    ctx: &ApiContext,
    class_id: ClassId,
    input: SectionInput,
) -> Result<SectionSummary, ApiError> {
    let name = required_name("section name", &input.name)?;
    ensure_class_exists(ctx, class_id).await?;
    let semester = input.semester.trim();
    let section_id = ctx
        .storage
        .create_section(class_id, name, semester)
        .await
        .map_err(internal)?;
    Ok(SectionSummary {
        id: section_id,
        class_id,
        name: name.to_string(),
        semester: semester.to_string(),
    })
}

pub async fn delete_section(ctx: &ApiContext, section_id: SectionId) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_section(section_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found("section not found"));
    }
    Ok(())
}

pub async fn list_problems(ctx: &ApiContext) -> Result<Vec<ProblemSummary>, ApiError> {
    let problems = ctx.storage.list_problems().await.map_err(internal)?;
    Ok(problems.into_iter().map(problem_summary).collect())
}

pub async fn create_problem(
    ctx: &ApiContext,
    input: ProblemInput,
) -> Result<ProblemSummary, ApiError> {
    let title = required_name("problem title", &input.title)?;
    let problem_id = ctx
        .storage
        .create_problem(title, &input.description, input.starter_code.as_deref())
        .await
        .map_err(internal)?;
    load_problem(ctx, problem_id).await
}

pub async fn update_problem(
    ctx: &ApiContext,
    problem_id: ProblemId,
    input: ProblemInput,
) -> Result<ProblemSummary, ApiError> {
    let title = required_name("problem title", &input.title)?;
    let updated = ctx
        .storage
        .update_problem(
            problem_id,
            title,
            &input.description,
            input.starter_code.as_deref(),
        )
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::not_found("problem not found"));
    }
    load_problem(ctx, problem_id).await
}

pub async fn delete_problem(ctx: &ApiContext, problem_id: ProblemId) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_problem(problem_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found("problem not found"));
    }
    Ok(())
}

/// Session history for the dashboard. Participant counts are live-only and reported as zero.
pub async fn list_session_history(
    ctx: &ApiContext,
    status: Option<SessionStatus>,
) -> Result<Vec<SessionSummary>, ApiError> {
    let sessions = ctx.storage.list_sessions(status).await.map_err(internal)?;
    Ok(sessions
        .into_iter()
        .map(|session| session_summary(session, 0))
        .collect())
}

pub async fn list_revisions(
    ctx: &ApiContext,
    session_id: SessionId,
    student_id: Option<StudentId>,
) -> Result<Vec<CodeRevision>, ApiError> {
    ctx.storage
        .load_session(session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    let revisions = ctx
        .storage
        .list_revisions(session_id, student_id)
        .await
        .map_err(internal)?;
    Ok(revisions
        .into_iter()
        .map(|revision| CodeRevision {
            id: revision.revision_id,
            session_id: revision.session_id,
            student_id: revision.student_id,
            student_name: revision.student_name,
            code: revision.code,
            created_at: revision.created_at,
        })
        .collect())
}

pub fn session_summary(session: StoredSession, participant_count: u32) -> SessionSummary {
    SessionSummary {
        id: session.session_id,
        join_code: session.join_code,
        problem_id: session.problem_id,
        problem_text: session.problem_text,
        created_at: session.created_at,
        last_activity: session.last_activity,
        status: session.status,
        participant_count,
    }
}

fn class_summary(class: StoredClass) -> ClassSummary {
    ClassSummary {
        id: class.class_id,
        name: class.name,
        description: class.description,
        created_at: class.created_at,
    }
}

fn problem_summary(problem: StoredProblem) -> ProblemSummary {
    ProblemSummary {
        id: problem.problem_id,
        title: problem.title,
        description: problem.description,
        starter_code: problem.starter_code,
        created_at: problem.created_at,
    }
}

async fn load_class(ctx: &ApiContext, class_id: ClassId) -> Result<ClassSummary, ApiError> {
    ctx.storage
        .load_class(class_id)
        .await
        .map_err(internal)?
        .map(class_summary)
        .ok_or_else(|| ApiError::not_found("class not found"))
}

async fn load_problem(ctx: &ApiContext, problem_id: ProblemId) -> Result<ProblemSummary, ApiError> {
    ctx.storage
        .load_problem(problem_id)
        .await
        .map_err(internal)?
        .map(problem_summary)
        .ok_or_else(|| ApiError::not_found("problem not found"))
}

async fn ensure_class_exists(ctx: &ApiContext, class_id: ClassId) -> Result<(), ApiError> {
    ctx.storage
        .load_class(class_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("class not found"))?;
    Ok(())
}

fn required_name<'a>(field: &str, raw: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation(format!("{field} cannot be empty")));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(ApiError::validation(format!(
            "{field} exceeds {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "storage operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}
