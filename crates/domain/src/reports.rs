use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::DomainResult;
use crate::error::{AccessDenial, DomainError};
use crate::identity::ActorIdentity;
use crate::ports::db::WriteOp;
use crate::realtime::channel::Channel;
use crate::realtime::event::{EventKind, EventPayload, PendingEvent, RESTRICTED_FIELD};
use crate::realtime::policy::{OWNER_FIELD, PARTICIPANTS_FIELD};
use crate::realtime::unit::{Committed, MutationPipeline};
use crate::rooms::validate_request_id;
use crate::util::{now_ms, stable_id};

pub const REPORT_TABLE: &str = "report";
pub const COMMENT_TABLE: &str = "report_comment";

const MAX_TITLE_LENGTH: usize = 160;
const MAX_DESCRIPTION_LENGTH: usize = 5_000;
const MAX_COMMENT_LENGTH: usize = 2_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Open,
    Verified,
    InProgress,
    Resolved,
    Rejected,
}

impl ReportStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "open" => Some(ReportStatus::Open),
            "verified" => Some(ReportStatus::Verified),
            "in_progress" => Some(ReportStatus::InProgress),
            "resolved" => Some(ReportStatus::Resolved),
            "rejected" => Some(ReportStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Open => "open",
            ReportStatus::Verified => "verified",
            ReportStatus::InProgress => "in_progress",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Rejected => "rejected",
        }
    }

    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        use ReportStatus::*;
        matches!(
            (self, next),
            (Open, Verified | InProgress | Resolved | Rejected)
                | (Verified, InProgress | Resolved | Rejected)
                | (InProgress, Resolved | Rejected)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub report_id: String,
    pub reporter_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: Option<String>,
    pub contact: Option<String>,
    pub status: ReportStatus,
    pub revision: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub request_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportComment {
    pub comment_id: String,
    pub report_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at_ms: i64,
    pub request_id: String,
}

#[derive(Clone, Debug)]
pub struct SubmitReportInput {
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: Option<String>,
    pub contact: Option<String>,
    pub request_id: String,
    pub origin_client_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AddCommentInput {
    pub report_id: String,
    pub body: String,
    pub request_id: String,
    pub origin_client_id: Option<String>,
}

/// Report mutations. Every fact goes to the public feed with the reporter's
/// details in the restricted section, and unredacted to the reporter.
#[derive(Clone)]
pub struct ReportService {
    pipeline: MutationPipeline,
}

impl ReportService {
    pub fn new(pipeline: MutationPipeline) -> Self {
        Self { pipeline }
    }

    pub async fn submit_report(
        &self,
        actor: &ActorIdentity,
        input: SubmitReportInput,
    ) -> DomainResult<Committed<Report>> {
        let input = validate_submit_input(input)?;
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    let report_id =
                        stable_id("rpt", &[actor_id.as_str(), input.request_id.as_str()]);
                    if let Some(existing) = unit.fetch_as::<Report>(REPORT_TABLE, &report_id).await?
                    {
                        return Ok(existing);
                    }

                    let now = now_ms();
                    let report = Report {
                        report_id: report_id.clone(),
                        reporter_id: actor_id.clone(),
                        title: input.title,
                        description: input.description,
                        category: input.category,
                        location: input.location,
                        contact: input.contact,
                        status: ReportStatus::Open,
                        revision: 0,
                        created_at_ms: now,
                        updated_at_ms: now,
                        request_id: input.request_id,
                    };
                    unit.execute(WriteOp::create(REPORT_TABLE, &report_id, &report)?)
                        .await?;

                    let payload = json!({
                        "report_id": report.report_id,
                        "title": report.title,
                        "description": report.description,
                        "category": report.category,
                        "status": report.status,
                        "created_at_ms": report.created_at_ms,
                        OWNER_FIELD: report.reporter_id,
                        PARTICIPANTS_FIELD: Value::Array(Vec::new()),
                        RESTRICTED_FIELD: {
                            "reporter_id": report.reporter_id,
                            "location": report.location,
                            "contact": report.contact,
                        },
                    });
                    unit.stage_event(
                        PendingEvent::new(
                            EventKind::ReportSubmitted,
                            &report_id,
                            "submitted",
                            EventPayload::full(payload),
                        )?
                        .with_origin_client(input.origin_client_id),
                        report_channels(&report),
                    )?;
                    Ok(report)
                })
            })
            .await
    }

    /// Moderators may apply any valid transition; the reporter may only resolve.
    /// Setting the current status again is a no-op.
    pub async fn update_report_status(
        &self,
        actor: &ActorIdentity,
        report_id: &str,
        status: ReportStatus,
    ) -> DomainResult<Committed<Report>> {
        let report_id = report_id.to_string();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    let actor = unit.actor().clone();
                    let mut report = unit
                        .fetch_as::<Report>(REPORT_TABLE, &report_id)
                        .await?
                        .ok_or(DomainError::NotFound)?;
                    if report.status == status {
                        return Ok(report);
                    }

                    let is_reporter = report.reporter_id == actor.user_id;
                    let allowed = actor.can_moderate()
                        || (is_reporter && status == ReportStatus::Resolved);
                    if !allowed {
                        return Err(DomainError::AuthorizationDenied(
                            AccessDenial::ForbiddenWrite,
                        ));
                    }
                    if !report.status.can_transition_to(status) {
                        return Err(DomainError::Validation(format!(
                            "cannot move report from {} to {}",
                            report.status.as_str(),
                            status.as_str()
                        )));
                    }

                    let previous = report.status;
                    let read_revision = report.revision;
                    report.status = status;
                    report.revision += 1;
                    report.updated_at_ms = now_ms();
                    unit.execute(
                        WriteOp::merge(
                            REPORT_TABLE,
                            &report_id,
                            json!({
                                "status": report.status,
                                "revision": report.revision,
                                "updated_at_ms": report.updated_at_ms,
                            }),
                        )
                        .expecting("revision", json!(read_revision)),
                    )
                    .await?;

                    unit.stage_event(
                        PendingEvent::new(
                            EventKind::ReportUpdated,
                            &report_id,
                            &format!("revision:{}", report.revision),
                            EventPayload::full(json!({
                                "report_id": report.report_id,
                                "status": report.status,
                                "previous_status": previous,
                                "revision": report.revision,
                                "updated_at_ms": report.updated_at_ms,
                                OWNER_FIELD: report.reporter_id,
                                RESTRICTED_FIELD: { "updated_by": actor.user_id },
                            })),
                        )?,
                        report_channels(&report),
                    )?;
                    Ok(report)
                })
            })
            .await
    }

    pub async fn add_comment(
        &self,
        actor: &ActorIdentity,
        input: AddCommentInput,
    ) -> DomainResult<Committed<ReportComment>> {
        let body = input.body.trim().to_string();
        validate_comment(&body, &input.request_id)?;
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    let report = unit
                        .fetch_as::<Report>(REPORT_TABLE, &input.report_id)
                        .await?
                        .ok_or(DomainError::NotFound)?;
                    let comment_id = stable_id(
                        "cmt",
                        &[
                            report.report_id.as_str(),
                            actor_id.as_str(),
                            input.request_id.as_str(),
                        ],
                    );
                    if let Some(existing) = unit
                        .fetch_as::<ReportComment>(COMMENT_TABLE, &comment_id)
                        .await?
                    {
                        return Ok(existing);
                    }

                    let comment = ReportComment {
                        comment_id: comment_id.clone(),
                        report_id: report.report_id.clone(),
                        author_id: actor_id.clone(),
                        body,
                        created_at_ms: now_ms(),
                        request_id: input.request_id,
                    };
                    unit.execute(WriteOp::create(COMMENT_TABLE, &comment_id, &comment)?)
                        .await?;

                    unit.stage_event(
                        PendingEvent::new(
                            EventKind::CommentCreated,
                            &report.report_id,
                            &comment_id,
                            EventPayload::full(json!({
                                "report_id": comment.report_id,
                                "comment_id": comment.comment_id,
                                "body": comment.body,
                                "created_at_ms": comment.created_at_ms,
                                OWNER_FIELD: report.reporter_id,
                                PARTICIPANTS_FIELD: [comment.author_id],
                                RESTRICTED_FIELD: { "author_id": comment.author_id },
                            })),
                        )?
                        .with_origin_client(input.origin_client_id),
                        report_channels(&report),
                    )?;
                    Ok(comment)
                })
            })
            .await
    }
}

fn report_channels(report: &Report) -> Vec<Channel> {
    vec![Channel::Feed, Channel::user(report.reporter_id.as_str())]
}

fn validate_submit_input(mut input: SubmitReportInput) -> DomainResult<SubmitReportInput> {
    input.title = input.title.trim().to_string();
    input.description = input.description.trim().to_string();
    input.category = input.category.trim().to_lowercase();
    input.location = input
        .location
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    input.contact = input
        .contact
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    input.request_id = input.request_id.trim().to_string();

    if input.title.is_empty() {
        return Err(DomainError::Validation("title is required".into()));
    }
    if input.title.chars().count() > MAX_TITLE_LENGTH {
        return Err(DomainError::Validation(format!(
            "title exceeds max length of {MAX_TITLE_LENGTH}"
        )));
    }
    if input.description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(DomainError::Validation(format!(
            "description exceeds max length of {MAX_DESCRIPTION_LENGTH}"
        )));
    }
    if input.category.is_empty() {
        return Err(DomainError::Validation("category is required".into()));
    }
    validate_request_id(&input.request_id)?;
    Ok(input)
}

fn validate_comment(body: &str, request_id: &str) -> DomainResult<()> {
    if body.is_empty() {
        return Err(DomainError::Validation("body is required".into()));
    }
    if body.chars().count() > MAX_COMMENT_LENGTH {
        return Err(DomainError::Validation(format!(
            "body exceeds max length of {MAX_COMMENT_LENGTH}"
        )));
    }
    validate_request_id(request_id)
}
