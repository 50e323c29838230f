//! Unified gradebook: one row per enrolled student combining the
//! traditional and assignment grade sources.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GradebookError};
use crate::gateway::{Gateway, RequestContext};
use crate::models::{AssignmentGrade, Student, TraditionalGrade};
use crate::notify::{Notice, Notifier};
use crate::sources::assignment::{fetch_graded_by, AssignmentFilters};
use crate::sources::traditional::{active_student_ids, fetch_grades_for, fetch_students, StudentGrades};
use crate::sources::GradeSource;

/// How assignment grades are matched to roster students.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinKey {
    /// Full-name string equality. Two students sharing a name merge.
    #[default]
    FullName,
    /// The roster student linked to the submitting profile.
    StudentId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedStudent {
    #[serde(flatten)]
    pub student: Student,
    pub traditional_grades: Vec<TraditionalGrade>,
    pub assignment_grades: Vec<AssignmentGrade>,
    pub traditional_average: Option<f64>,
    pub assignment_average: Option<f64>,
    pub overall_average: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GradebookSummary {
    pub total_students: usize,
    /// Mean of the defined overall averages; 0 when none are defined.
    pub average_grade: f64,
    pub total_assignment_grades: usize,
    pub total_traditional_grades: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedGradebook {
    pub students: Vec<UnifiedStudent>,
    pub summary: GradebookSummary,
}

pub fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

pub fn overall_average(traditional: Option<f64>, assignment: Option<f64>) -> Option<f64> {
    match (traditional, assignment) {
        (Some(t), Some(a)) => Some((t + a) / 2.0),
        (Some(t), None) => Some(t),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// Combines the roster with both grade sources. Pure: the same inputs
/// always produce the same gradebook.
pub fn combine(
    students: &[Student],
    traditional: &[StudentGrades],
    assignments: &[AssignmentGrade],
    join: JoinKey,
) -> UnifiedGradebook {
    let mut matched = vec![false; assignments.len()];

    let rows: Vec<UnifiedStudent> = students
        .iter()
        .map(|student| {
            let traditional_grades: Vec<TraditionalGrade> = traditional
                .iter()
                .filter(|entry| entry.student.id == student.id)
                .flat_map(|entry| entry.grades.iter().cloned())
                .collect();

            let name = student.full_name();
            let assignment_grades: Vec<AssignmentGrade> = assignments
                .iter()
                .enumerate()
                .filter(|(_, grade)| match join {
                    JoinKey::FullName => grade.student_name == name,
                    JoinKey::StudentId => grade.student_id == Some(student.id),
                })
                .map(|(i, grade)| {
                    matched[i] = true;
                    grade.clone()
                })
                .collect();

            let traditional_average = mean(traditional_grades.iter().filter_map(TraditionalGrade::percentage));
            let assignment_average = mean(assignment_grades.iter().map(|g| g.grade));

            UnifiedStudent {
                student: student.clone(),
                overall_average: overall_average(traditional_average, assignment_average),
                traditional_grades,
                assignment_grades,
                traditional_average,
                assignment_average,
            }
        })
        .collect();

    let misses = matched.iter().filter(|m| !**m).count();
    if misses > 0 {
        debug!(misses, ?join, "assignment grades matched no enrolled student");
    }

    let summary = GradebookSummary {
        total_students: rows.len(),
        average_grade: mean(rows.iter().filter_map(|s| s.overall_average)).unwrap_or(0.0),
        total_assignment_grades: rows.iter().map(|s| s.assignment_grades.len()).sum(),
        total_traditional_grades: rows.iter().map(|s| s.traditional_grades.len()).sum(),
    };

    UnifiedGradebook {
        students: rows,
        summary,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dependencies {
    class_id: Uuid,
    traditional: u64,
    assignments: u64,
}

/// Holds the current unified view for one selected class and recombines it
/// when the class or either source changes.
pub struct Gradebook {
    join: JoinKey,
    class_id: Option<Uuid>,
    students: Vec<Student>,
    traditional: GradeSource<StudentGrades>,
    assignments: GradeSource<AssignmentGrade>,
    combined_for: Option<Dependencies>,
    view: UnifiedGradebook,
}

impl Gradebook {
    pub fn new(join: JoinKey) -> Self {
        Self {
            join,
            class_id: None,
            students: Vec::new(),
            traditional: GradeSource::new("traditional grades"),
            assignments: GradeSource::new("assignment grades"),
            combined_for: None,
            view: UnifiedGradebook::default(),
        }
    }

    pub fn view(&self) -> &UnifiedGradebook {
        &self.view
    }

    pub fn class_id(&self) -> Option<Uuid> {
        self.class_id
    }

    pub fn traditional(&self) -> &GradeSource<StudentGrades> {
        &self.traditional
    }

    pub fn assignments(&self) -> &GradeSource<AssignmentGrade> {
        &self.assignments
    }

    /// Recombines when the class or a source revision moved since the last
    /// combination and neither source is loading. Returns whether it did.
    pub fn recompute(&mut self) -> bool {
        let Some(class_id) = self.class_id else {
            return false;
        };
        if self.traditional.loading() || self.assignments.loading() {
            return false;
        }
        let deps = Dependencies {
            class_id,
            traditional: self.traditional.revision(),
            assignments: self.assignments.revision(),
        };
        if self.combined_for == Some(deps) {
            return false;
        }

        self.view = combine(
            &self.students,
            self.traditional.items(),
            self.assignments.items(),
            self.join,
        );
        self.combined_for = Some(deps);
        true
    }

    /// Loads `class_id` and rebuilds the view.
    ///
    /// An empty class short-circuits after the enrollment fetch. Any gateway
    /// failure raises a notice and leaves the previous view in place.
    pub async fn refresh(
        &mut self,
        gateway: &dyn Gateway,
        ctx: &RequestContext,
        notifier: &dyn Notifier,
        class_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<&UnifiedGradebook, GradebookError> {
        let ids = guarded(notifier, cancel, active_student_ids(gateway, ctx, class_id)).await?;
        if ids.is_empty() {
            info!(%class_id, "class has no active enrollments");
            self.class_id = Some(class_id);
            self.students.clear();
            self.combined_for = None;
            self.view = UnifiedGradebook::default();
            return Ok(&self.view);
        }

        let students = guarded(notifier, cancel, fetch_students(gateway, ctx, &ids)).await?;

        let traditional = self
            .traditional
            .load(notifier, cancel, fetch_grades_for(gateway, ctx, students.clone()))
            .await?;
        let filters = AssignmentFilters::default();
        let assignments = self
            .assignments
            .load(notifier, cancel, fetch_graded_by(gateway, ctx, &filters))
            .await?;

        if cancel.is_cancelled() {
            return Err(GradebookError::Cancelled);
        }
        // Both sources and the roster move to the new class together.
        self.traditional.commit(traditional);
        self.assignments.commit(assignments);
        self.class_id = Some(class_id);
        self.students = students;
        self.recompute();
        info!(
            %class_id,
            students = self.view.summary.total_students,
            average = self.view.summary.average_grade,
            "gradebook refreshed"
        );
        Ok(&self.view)
    }
}

async fn guarded<T, F>(
    notifier: &dyn Notifier,
    cancel: &CancellationToken,
    fetch: F,
) -> Result<T, GradebookError>
where
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GradebookError::Cancelled),
        result = fetch => result,
    };
    result.map_err(|err| {
        warn!(error = %err, "gradebook fetch failed; keeping previous view");
        notifier.notify(Notice::error("Failed to load gradebook", err.to_string()));
        GradebookError::from(err)
    })
}
