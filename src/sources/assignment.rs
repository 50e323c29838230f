use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, GradebookError};
use crate::gateway::{decode_rows, Filter, Gateway, RequestContext, Select, Table};
use crate::models::{full_name, AssignmentGrade};
use crate::sources::traditional::RecordOutcome;

#[derive(Debug, Deserialize)]
struct GradeRow {
    id: Uuid,
    submission_id: Uuid,
    grade: f64,
    #[serde(default)]
    feedback: Option<String>,
    graded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SubmissionRow {
    id: Uuid,
    assignment_id: Uuid,
    student_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct AssignmentRow {
    id: Uuid,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    #[serde(default)]
    student_id: Option<Uuid>,
}

/// Case-insensitive substring filters applied after the fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentFilters {
    pub title: Option<String>,
    pub student: Option<String>,
}

impl AssignmentFilters {
    pub fn matches(&self, grade: &AssignmentGrade) -> bool {
        contains(&grade.assignment_title, self.title.as_deref())
            && contains(&grade.student_name, self.student.as_deref())
    }
}

fn contains(haystack: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim) {
        None | Some("") => true,
        Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
    }
}

fn id_filter(column: &str, ids: impl Iterator<Item = Uuid>) -> Filter {
    let mut ids: Vec<Uuid> = ids.collect();
    ids.sort();
    ids.dedup();
    Filter::is_in(column, ids.into_iter().map(|id| json!(id)))
}

/// Grades written by the caller, newest first, joined through
/// submission -> assignment -> profile.
pub async fn fetch_graded_by(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    filters: &AssignmentFilters,
) -> Result<Vec<AssignmentGrade>, GatewayError> {
    let rows = gateway
        .select(
            ctx,
            Select::from(Table::AssignmentGrades)
                .filter(Filter::eq("graded_by", json!(ctx.user_id)))
                .order_by("graded_at", true),
        )
        .await?;
    let grades: Vec<GradeRow> = decode_rows(Table::AssignmentGrades, rows)?;
    if grades.is_empty() {
        return Ok(Vec::new());
    }

    let rows = gateway
        .select(
            ctx,
            Select::from(Table::Submissions)
                .filter(id_filter("id", grades.iter().map(|g| g.submission_id))),
        )
        .await?;
    let submissions: HashMap<Uuid, SubmissionRow> = decode_rows::<SubmissionRow>(Table::Submissions, rows)?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();
    if submissions.is_empty() {
        debug!(grades = grades.len(), "no visible submissions for graded work");
        return Ok(Vec::new());
    }

    let rows = gateway
        .select(
            ctx,
            Select::from(Table::Assignments)
                .filter(id_filter("id", submissions.values().map(|s| s.assignment_id))),
        )
        .await?;
    let assignments: HashMap<Uuid, AssignmentRow> = decode_rows::<AssignmentRow>(Table::Assignments, rows)?
        .into_iter()
        .map(|a| (a.id, a))
        .collect();

    let rows = gateway
        .select(
            ctx,
            Select::from(Table::Profiles)
                .filter(id_filter("id", submissions.values().map(|s| s.student_id))),
        )
        .await?;
    let profiles: HashMap<Uuid, ProfileRow> = decode_rows::<ProfileRow>(Table::Profiles, rows)?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let mut joined = Vec::with_capacity(grades.len());
    for grade in grades {
        let Some(submission) = submissions.get(&grade.submission_id) else {
            debug!(grade_id = %grade.id, "dropping grade without a visible submission");
            continue;
        };
        let (Some(assignment), Some(profile)) = (
            assignments.get(&submission.assignment_id),
            profiles.get(&submission.student_id),
        ) else {
            debug!(grade_id = %grade.id, "dropping grade with an incomplete submission chain");
            continue;
        };

        let row = AssignmentGrade {
            grade_id: grade.id,
            submission_id: submission.id,
            student_id: profile.student_id,
            student_name: full_name(&profile.first_name, &profile.last_name),
            assignment_title: assignment.title.clone(),
            grade: grade.grade,
            feedback: grade.feedback,
            graded_at: grade.graded_at,
        };
        if filters.matches(&row) {
            joined.push(row);
        }
    }
    Ok(joined)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentGradeRecord {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub grade: f64,
    #[serde(default)]
    pub feedback: Option<String>,
    pub graded_by: Uuid,
    pub graded_at: DateTime<Utc>,
}

/// Grades a submission as the caller. One grade per submission; regrading
/// overwrites the previous one.
pub async fn record_assignment_grade(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    submission_id: Uuid,
    grade: f64,
    feedback: Option<String>,
) -> Result<RecordOutcome<AssignmentGradeRecord>, GradebookError> {
    if !(0.0..=100.0).contains(&grade) {
        return Err(GradebookError::InvalidGrade(grade));
    }

    let key = Filter::eq("submission_id", json!(submission_id));
    let existing = gateway
        .select(ctx, Select::from(Table::AssignmentGrades).filter(key.clone()).limit(1))
        .await?;
    let now = Utc::now();

    let (rows, replaced) = if existing.is_empty() {
        let row = json!({
            "id": Uuid::new_v4(),
            "submission_id": submission_id,
            "grade": grade,
            "feedback": feedback,
            "graded_by": ctx.user_id,
            "graded_at": now,
        });
        (gateway.insert(ctx, Table::AssignmentGrades, vec![row]).await?, false)
    } else {
        let patch = json!({
            "grade": grade,
            "feedback": feedback,
            "graded_by": ctx.user_id,
            "graded_at": now,
        });
        (gateway.update(ctx, Table::AssignmentGrades, patch, vec![key]).await?, true)
    };

    let record = decode_rows::<AssignmentGradeRecord>(Table::AssignmentGrades, rows)?
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Rejected {
            table: Table::AssignmentGrades.as_str(),
            message: "write returned no rows".to_string(),
        })?;
    Ok(RecordOutcome { record, replaced })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};
    use uuid::Uuid;

    /// Rows for one graded submission: (grade, submission, assignment, profile).
    pub fn graded_submission(
        grader: Uuid,
        first: &str,
        last: &str,
        student_id: Option<Uuid>,
        title: &str,
        grade: f64,
        graded_at: &str,
    ) -> [Value; 4] {
        let (grade_id, submission_id, assignment_id, profile_id) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        [
            json!({
                "id": grade_id,
                "submission_id": submission_id,
                "grade": grade,
                "feedback": null,
                "graded_by": grader,
                "graded_at": graded_at,
            }),
            json!({"id": submission_id, "assignment_id": assignment_id, "student_id": profile_id}),
            json!({"id": assignment_id, "title": title}),
            json!({
                "id": profile_id,
                "first_name": first,
                "last_name": last,
                "student_id": student_id,
            }),
        ]
    }
}
