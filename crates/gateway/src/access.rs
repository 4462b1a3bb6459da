//! Enrollment and ownership lookups used by the authorization filter.
//!
//! Both checks are owned by other services. Until the platform exposes a
//! verified policy, [`DenyAllDirectory`] answers every question with "no".
//! A missing id always means "no" without consulting anyone.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for one directory lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Answers relationship questions between users, courses and assessments.
#[async_trait]
pub trait AccessDirectory: Send + Sync + 'static {
    /// Is `user_id` enrolled as a student in `course_id`?
    async fn is_enrolled(&self, user_id: &str, course_id: Option<&str>) -> bool;

    /// Does `user_id` own or teach `assessment_id`?
    async fn teaches_assessment(&self, user_id: &str, assessment_id: Option<&str>) -> bool;
}

/// Conservative directory used when no access service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllDirectory;

#[async_trait]
impl AccessDirectory for DenyAllDirectory {
    async fn is_enrolled(&self, _user_id: &str, _course_id: Option<&str>) -> bool {
        false
    }

    async fn teaches_assessment(&self, _user_id: &str, _assessment_id: Option<&str>) -> bool {
        false
    }
}

/// Directory backed by the platform's access service over HTTP.
///
/// `GET {base}/courses/{course}/students/{user}` and
/// `GET {base}/assessments/{assessment}/teachers/{user}`; any 2xx means yes,
/// everything else (including transport errors) means no. Ids travel as
/// single escaped path segments.
#[derive(Debug, Clone)]
pub struct HttpAccessDirectory {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpAccessDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GatewayError::Config(format!("invalid ACCESS_SERVICE_URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Config(format!(
                "ACCESS_SERVICE_URL cannot be a base URL: {base_url}"
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// `{base}/{segments...}`, or `None` when an id cannot name exactly one
    /// path segment.
    fn relation_url(&self, segments: &[&str]) -> Option<Url> {
        if segments
            .iter()
            .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
        {
            return None;
        }
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().ok()?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Some(url)
    }

    async fn probe(&self, segments: &[&str]) -> bool {
        let Some(url) = self.relation_url(segments) else {
            debug!("Access lookup skipped, unusable id in {:?}", segments);
            return false;
        };
        debug!("Access lookup: {}", url);
        match self.client.get(url.clone()).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                if response.status() != StatusCode::NOT_FOUND {
                    warn!("Access lookup {} returned {}", url, response.status());
                }
                false
            }
            Err(e) => {
                warn!("Access lookup {} failed: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl AccessDirectory for HttpAccessDirectory {
    async fn is_enrolled(&self, user_id: &str, course_id: Option<&str>) -> bool {
        let Some(course_id) = course_id else {
            return false;
        };
        self.probe(&["courses", course_id, "students", user_id]).await
    }

    async fn teaches_assessment(&self, user_id: &str, assessment_id: Option<&str>) -> bool {
        let Some(assessment_id) = assessment_id else {
            return false;
        };
        self.probe(&["assessments", assessment_id, "teachers", user_id])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn spawn_access_service() -> String {
        let app = Router::new()
            .route(
                "/courses/{course}/students/{user}",
                get(|Path((course, user)): Path<(String, String)>| async move {
                    if course == "c1" && user == "s1" {
                        StatusCode::OK
                    } else {
                        StatusCode::NOT_FOUND
                    }
                }),
            )
            .route(
                "/assessments/{assessment}/teachers/{user}",
                get(|Path((assessment, user)): Path<(String, String)>| async move {
                    if assessment == "a1" && user == "t1" {
                        StatusCode::NO_CONTENT
                    } else {
                        StatusCode::FORBIDDEN
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_deny_all_denies() {
        let directory = DenyAllDirectory;
        assert!(!directory.is_enrolled("s1", Some("c1")).await);
        assert!(!directory.teaches_assessment("t1", Some("a1")).await);
    }

    #[tokio::test]
    async fn test_http_directory_follows_service_answers() {
        let base = spawn_access_service().await;
        let directory = HttpAccessDirectory::new(&base, DEFAULT_LOOKUP_TIMEOUT).unwrap();

        assert!(directory.is_enrolled("s1", Some("c1")).await);
        assert!(!directory.is_enrolled("s2", Some("c1")).await);
        assert!(directory.teaches_assessment("t1", Some("a1")).await);
        assert!(!directory.teaches_assessment("t2", Some("a1")).await);
    }

    #[tokio::test]
    async fn test_ids_cannot_rewrite_the_lookup_path() {
        let base = spawn_access_service().await;
        let directory = HttpAccessDirectory::new(&base, DEFAULT_LOOKUP_TIMEOUT).unwrap();

        for course in ["c1/students/s1#", "c1/students/s1?x=", "c1%2Fstudents%2Fs1", ".."] {
            assert!(!directory.is_enrolled("s2", Some(course)).await, "{course}");
        }
        assert!(!directory.is_enrolled("s1/../s1", Some("c1")).await);
        assert!(!directory.teaches_assessment("t1#", Some("a1")).await);
        assert!(!directory.teaches_assessment("t2", Some("a1/teachers/t1")).await);
    }

    #[test]
    fn test_relation_url_escapes_ids() {
        let directory =
            HttpAccessDirectory::new("http://access:8080/api/", DEFAULT_LOOKUP_TIMEOUT).unwrap();
        let url = directory
            .relation_url(&["courses", "c1/students/s1#", "students", "s2"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://access:8080/api/courses/c1%2Fstudents%2Fs1%23/students/s2"
        );
        assert!(directory.relation_url(&["courses", "..", "students", "s2"]).is_none());
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        assert!(matches!(
            HttpAccessDirectory::new("not a url", DEFAULT_LOOKUP_TIMEOUT),
            Err(GatewayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_ids_deny_without_lookup() {
        // Unroutable base: any request would fail, so a `false` here must come
        // from the id check.
        let directory =
            HttpAccessDirectory::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(!directory.is_enrolled("s1", None).await);
        assert!(!directory.is_enrolled("s1", Some("")).await);
        assert!(!directory.teaches_assessment("", Some("a1")).await);
    }

    #[tokio::test]
    async fn test_unreachable_service_denies() {
        let directory =
            HttpAccessDirectory::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(!directory.teaches_assessment("t1", Some("a1")).await);
    }
}
