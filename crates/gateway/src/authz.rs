//! Per-subscriber event authorization.
//!
//! Evaluated once per candidate subscriber per event, so cost is linear in the
//! topic's subscriber count. Rules by topic class (first match wins):
//!
//! | class | rule |
//! |---|---|
//! | assessment created/updated/published | staff: yes. student: `status == "PUBLISHED"` and enrolled in `courseId` |
//! | submission.* | owner (`userId`), or staff teaching `assessmentId` |
//! | grading.* | same as submissions |
//! | notification.* | owner only, whatever the role |
//! | anything else | admin, or owner |

use crate::access::AccessDirectory;
use crate::auth::{Principal, Role};
use serde_json::Value;
use std::sync::Arc;

/// Authorization class of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    AssessmentLifecycle,
    SubmissionLifecycle,
    GradeUpdate,
    Notification,
    Unclassified,
}

impl TopicClass {
    pub fn of(topic: &str) -> Self {
        match topic {
            "assessment.created" | "assessment.updated" | "assessment.published" => {
                TopicClass::AssessmentLifecycle
            }
            t if t.starts_with("submission.") => TopicClass::SubmissionLifecycle,
            t if t.starts_with("grading.") || t.starts_with("grade.") => TopicClass::GradeUpdate,
            t if t.starts_with("notification.") => TopicClass::Notification,
            _ => TopicClass::Unclassified,
        }
    }
}

fn str_field<'a>(payload: &'a Value, name: &str) -> Option<&'a str> {
    payload.get(name).and_then(Value::as_str)
}

fn is_owner(principal: &Principal, payload: &Value) -> bool {
    str_field(payload, "userId").is_some_and(|user_id| user_id == principal.id)
}

/// Decides whether a principal may receive an event.
#[derive(Clone)]
pub struct AuthorizationFilter {
    directory: Arc<dyn AccessDirectory>,
}

impl AuthorizationFilter {
    pub fn new(directory: Arc<dyn AccessDirectory>) -> Self {
        Self { directory }
    }

    pub async fn may_receive(&self, principal: &Principal, topic: &str, payload: &Value) -> bool {
        match TopicClass::of(topic) {
            TopicClass::AssessmentLifecycle => {
                if principal.is_staff() {
                    return true;
                }
                str_field(payload, "status") == Some("PUBLISHED")
                    && self
                        .directory
                        .is_enrolled(&principal.id, str_field(payload, "courseId"))
                        .await
            }
            TopicClass::SubmissionLifecycle | TopicClass::GradeUpdate => {
                if is_owner(principal, payload) {
                    return true;
                }
                principal.is_staff()
                    && self
                        .directory
                        .teaches_assessment(&principal.id, str_field(payload, "assessmentId"))
                        .await
            }
            TopicClass::Notification => is_owner(principal, payload),
            TopicClass::Unclassified => {
                principal.role == Role::Admin || is_owner(principal, payload)
            }
        }
    }
}
