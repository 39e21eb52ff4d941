//! HTTP client for the class/section/problem catalog and session history.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ClassId, ProblemId, SectionId, SessionId, SessionStatus, StudentId},
    error::{ApiError, ApiException},
    protocol::{
        ClassInput, ClassSummary, CodeRevision, ProblemInput, ProblemSummary, SectionInput,
        SectionSummary, SessionSummary,
    },
};
use url::Url;

use crate::revisions::RevisionHistory;

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base: Url,
}

impl RestClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let base = Url::parse(server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let prefix = self.base.path().trim_end_matches('/');
        let mut url = self.base.clone();
        url.set_path(&format!("{prefix}{path}"));
        url
    }

    pub async fn list_classes(&self) -> Result<Vec<ClassSummary>> {
        let response = self.http.get(self.endpoint("/classes")).send().await?;
        decode(response).await
    }

    pub async fn create_class(&self, input: &ClassInput) -> Result<ClassSummary> {
        let response = self
            .http
            .post(self.endpoint("/classes"))
            .json(input)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn update_class(&self, class_id: ClassId, input: &ClassInput) -> Result<ClassSummary> {
        let response = self
            .http
            .put(self.endpoint(&format!("/classes/{class_id}")))
            .json(input)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn delete_class(&self, class_id: ClassId) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&format!("/classes/{class_id}")))
            .send()
            .await?;
        expect_empty(response).await
    }

    pub async fn list_sections(&self, class_id: ClassId) -> Result<Vec<SectionSummary>> {
        let response = self
            .http
            .get(self.endpoint(&format!("/classes/{class_id}/sections")))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn create_section(
        &self,
        class_id: ClassId,
        input: &SectionInput,
    ) -> Result<SectionSummary> {
        let response = self
            .http
            .post(self.endpoint(&format!("/classes/{class_id}/sections")))
            .json(input)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn delete_section(&self, section_id: SectionId) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&format!("/sections/{section_id}")))
            .send()
            .await?;
        expect_empty(response).await
    }

    pub async fn list_problems(&self) -> Result<Vec<ProblemSummary>> {
        let response = self.http.get(self.endpoint("/problems")).send().await?;
        decode(response).await
    }

    pub async fn create_problem(&self, input: &ProblemInput) -> Result<ProblemSummary> {
        let response = self
            .http
            .post(self.endpoint("/problems"))
            .json(input)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn update_problem(
        &self,
        problem_id: ProblemId,
        input: &ProblemInput,
    ) -> Result<ProblemSummary> {
        let response = self
            .http
            .put(self.endpoint(&format!("/problems/{problem_id}")))
            .json(input)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn delete_problem(&self, problem_id: ProblemId) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&format!("/problems/{problem_id}")))
            .send()
            .await?;
        expect_empty(response).await
    }

    pub async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<SessionSummary>> {
        let mut request = self.http.get(self.endpoint("/sessions"));
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        decode(request.send().await?).await
    }

    pub async fn list_revisions(
        &self,
        session_id: SessionId,
        student_id: Option<StudentId>,
    ) -> Result<Vec<CodeRevision>> {
        let mut request = self
            .http
            .get(self.endpoint(&format!("/sessions/{session_id}/revisions")));
        if let Some(student_id) = student_id {
            request = request.query(&[("student_id", student_id.0)]);
        }
        decode(request.send().await?).await
    }

    pub async fn revision_history(
        &self,
        session_id: SessionId,
        student_id: StudentId,
    ) -> Result<RevisionHistory> {
        let revisions = self.list_revisions(session_id, Some(student_id)).await?;
        Ok(RevisionHistory::new(revisions))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    Ok(response.json().await?)
}

async fn expect_empty(response: Response) -> Result<()> {
    check_status(response).await.map(|_| ())
}

/// Converts non-success responses into [`ApiException`], falling back to the
/// status line when the body is not an [`ApiError`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) => Err(anyhow!("request failed with {status}: {}", summarize(status, &body))),
    }
}

fn summarize(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("no body").to_string()
    } else {
        body.chars().take(200).collect()
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
