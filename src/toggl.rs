pub mod models;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::ops::Range;
use std::time::Duration;
use task_local_extensions::Extensions;

pub use models::{Project, TimeEntry};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error while making a http request.
    #[error("failure requesting remote resource: {0}")]
    Request(#[from] reqwest::Error),

    /// Error while executing some middleware code.
    #[error("request middleware failed with: {0}")]
    RequestMiddleware(#[from] reqwest_middleware::Error),

    /// Error while building http headers.
    #[error("encountered invalid HTTP header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    /// Error while parsing a JSON response.
    #[error("failed to parse response as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Adds Toggl's basic auth credentials (`<token>:api_token`) to every request.
struct AuthMiddleware {
    header: HeaderValue,
}

impl AuthMiddleware {
    fn new(token: &str) -> Result<AuthMiddleware, ClientError> {
        let credentials = STANDARD.encode(format!("{token}:api_token"));
        let mut header = HeaderValue::try_from(format!("Basic {credentials}"))?;
        header.set_sensitive(true);
        Ok(AuthMiddleware { header })
    }
}

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        req.headers_mut().insert(AUTHORIZATION, self.header.clone());
        next.run(req, extensions).await
    }
}

/// Builds the connection pool shared by all per-request `TogglClient`s.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()?)
}

/// Client for the Toggl Track API, bound to a single user's API token.
///
/// Cheap to construct: it wraps a shared `reqwest::Client` and is meant to live for the duration
/// of one request.
#[derive(Debug)]
pub struct TogglClient {
    client: ClientWithMiddleware,
    api_url: String,
}

impl TogglClient {
    /// Creates a client that authenticates with `token` against the API at `api_url`.
    pub fn new(
        http: reqwest::Client,
        api_url: impl Into<String>,
        token: &str,
    ) -> Result<TogglClient, ClientError> {
        let client = ClientBuilder::new(http)
            .with(AuthMiddleware::new(token)?)
            .build();

        Ok(TogglClient {
            client,
            api_url: api_url.into().trim_end_matches('/').to_owned(),
        })
    }

    /// Fetches the authenticated user's time entries, optionally limited to a date range.
    pub async fn get_time_entries(
        &self,
        date_range: Option<Range<DateTime<Utc>>>,
    ) -> Result<Vec<TimeEntry>, ClientError> {
        let body = self
            .client
            .get(format!("{}/me/time_entries", self.api_url))
            .query(&build_query_parameters(&date_range))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        // The API answers `null` instead of `[]` for some empty ranges.
        let entries = serde_json::from_slice::<Option<Vec<TimeEntry>>>(&body)?.unwrap_or_default();

        log::debug!("fetched {} time entries from Toggl", entries.len());

        Ok(entries)
    }

    /// Fetches a single project. Returns `None` if the project does not exist.
    pub async fn get_project(
        &self,
        workspace_id: i64,
        project_id: i64,
    ) -> Result<Option<Project>, ClientError> {
        let response = self
            .client
            .get(format!(
                "{}/workspaces/{}/projects/{}",
                self.api_url, workspace_id, project_id
            ))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("project {project_id} not found in workspace {workspace_id}");
            return Ok(None);
        }

        let body = response.error_for_status()?.bytes().await?;

        Ok(serde_json::from_slice(&body)?)
    }
}

fn build_query_parameters(
    date_range: &Option<Range<DateTime<Utc>>>,
) -> IndexMap<&'static str, String> {
    let mut query_parameters = IndexMap::new();

    if let Some(range) = date_range {
        query_parameters.insert(
            "start_date",
            range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        query_parameters.insert(
            "end_date",
            range.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    query_parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::{Matcher, Server, ServerGuard};

    fn client(server: &ServerGuard, token: &str) -> TogglClient {
        let http = http_client(Duration::from_secs(5)).unwrap();
        TogglClient::new(http, server.url(), token).unwrap()
    }

    #[test]
    fn build_query_parameters_without_range() {
        assert!(build_query_parameters(&None).is_empty());
    }

    #[test]
    fn build_query_parameters_with_range() {
        let start = Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();

        let query_parameters = build_query_parameters(&Some(start..end));

        let expected_parameters = IndexMap::from([
            ("start_date", "2014-01-01T00:00:00Z".to_owned()),
            ("end_date", "2024-01-01T12:30:00Z".to_owned()),
        ]);

        assert_eq!(expected_parameters, query_parameters);
    }

    #[actix_rt::test]
    async fn get_time_entries_sends_credentials_and_range() {
        let mut server = Server::new_async().await;
        let credentials = STANDARD.encode("secret:api_token");
        let mock = server
            .mock("GET", "/me/time_entries")
            .match_header("authorization", format!("Basic {credentials}").as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("start_date".into(), "2024-01-01T00:00:00Z".into()),
                Matcher::UrlEncoded("end_date".into(), "2024-02-01T00:00:00Z".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{
                    "id": 1,
                    "workspace_id": 10,
                    "wid": 10,
                    "project_id": 100,
                    "pid": 100,
                    "start": "2024-01-01T10:00:30+00:00",
                    "stop": "2024-01-01T11:00:30+00:00",
                    "duration": 3600,
                    "description": "Write report | 42",
                    "tags": ["work"],
                    "billable": false
                }]"#,
            )
            .create_async()
            .await;

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let entries = client(&server, "secret")
            .get_time_entries(Some(start..end))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[0].project_id, Some(100));
        assert_eq!(entries[0].description.as_deref(), Some("Write report | 42"));
        assert_eq!(entries[0].extra.get("billable"), Some(&serde_json::json!(false)));
    }

    #[actix_rt::test]
    async fn get_time_entries_accepts_null() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/me/time_entries")
            .match_query(Matcher::Any)
            .with_body("null")
            .create_async()
            .await;

        let entries = client(&server, "secret").get_time_entries(None).await.unwrap();

        assert!(entries.is_empty());
    }

    #[actix_rt::test]
    async fn get_time_entries_fails_on_error_status() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/me/time_entries")
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let result = client(&server, "").get_time_entries(None).await;

        assert!(matches!(result, Err(ClientError::Request(_))));
    }

    #[actix_rt::test]
    async fn get_project() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/workspaces/10/projects/100")
            .with_body(r#"{"id": 100, "name": "Work", "active": true}"#)
            .create_async()
            .await;

        let project = client(&server, "secret")
            .get_project(10, 100)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(project.id, 100);
        assert_eq!(project.name, "Work");
    }

    #[actix_rt::test]
    async fn get_project_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/workspaces/10/projects/404")
            .with_status(404)
            .create_async()
            .await;

        let project = client(&server, "secret").get_project(10, 404).await.unwrap();

        assert_eq!(project, None);
    }
}
