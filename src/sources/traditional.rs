use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, GradebookError};
use crate::gateway::{decode_rows, Filter, Gateway, RequestContext, Select, Table};
use crate::models::{GradeCategory, Student, TraditionalGrade};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentGrades {
    pub student: Student,
    pub grades: Vec<TraditionalGrade>,
}

#[derive(Debug, Deserialize)]
struct EnrollmentRow {
    student_id: Uuid,
}

/// Students actively enrolled in `class_id`, in enrollment order.
pub async fn active_student_ids(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    class_id: Uuid,
) -> Result<Vec<Uuid>, GatewayError> {
    let rows = gateway
        .select(
            ctx,
            Select::from(Table::ClassEnrollments)
                .filter(Filter::eq("class_id", json!(class_id)))
                .filter(Filter::eq("is_active", json!(true)))
                .order_by("enrolled_at", false),
        )
        .await?;
    let enrollments: Vec<EnrollmentRow> = decode_rows(Table::ClassEnrollments, rows)?;
    Ok(enrollments.into_iter().map(|e| e.student_id).collect())
}

pub async fn fetch_students(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    ids: &[Uuid],
) -> Result<Vec<Student>, GatewayError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = gateway
        .select(
            ctx,
            Select::from(Table::Students)
                .filter(Filter::is_in("id", ids.iter().map(|id| json!(id))))
                .order_by("last_name", false),
        )
        .await?;
    decode_rows(Table::Students, rows)
}

/// Enrollment -> students -> grades -> categories, joined in memory.
pub async fn fetch_class_grades(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    class_id: Uuid,
) -> Result<Vec<StudentGrades>, GatewayError> {
    let ids = active_student_ids(gateway, ctx, class_id).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let students = fetch_students(gateway, ctx, &ids).await?;
    fetch_grades_for(gateway, ctx, students).await
}

/// Grades and category metadata for an already-loaded roster.
pub async fn fetch_grades_for(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    students: Vec<Student>,
) -> Result<Vec<StudentGrades>, GatewayError> {
    if students.is_empty() {
        return Ok(Vec::new());
    }

    let rows = gateway
        .select(
            ctx,
            Select::from(Table::TraditionalGrades)
                .filter(Filter::is_in(
                    "student_id",
                    students.iter().map(|s| json!(s.id)),
                ))
                .order_by("created_at", false),
        )
        .await?;
    let grades: Vec<TraditionalGrade> = decode_rows(Table::TraditionalGrades, rows)?;

    let mut category_ids: Vec<Uuid> = grades.iter().map(|g| g.category_id).collect();
    category_ids.sort();
    category_ids.dedup();

    let categories: HashMap<Uuid, GradeCategory> = if category_ids.is_empty() {
        HashMap::new()
    } else {
        let rows = gateway
            .select(
                ctx,
                Select::from(Table::GradeCategories)
                    .filter(Filter::is_in("id", category_ids.iter().map(|id| json!(id)))),
            )
            .await?;
        decode_rows::<GradeCategory>(Table::GradeCategories, rows)?
            .into_iter()
            .map(|c| (c.id, c))
            .collect()
    };

    let mut by_student: HashMap<Uuid, Vec<TraditionalGrade>> = HashMap::new();
    for mut grade in grades {
        match categories.get(&grade.category_id) {
            Some(category) => {
                grade.category_name = Some(category.name.clone());
                grade.category_weight = Some(category.weight);
            }
            None => debug!(grade_id = %grade.id, "grade references an unknown category"),
        }
        by_student.entry(grade.student_id).or_default().push(grade);
    }

    Ok(students
        .into_iter()
        .map(|student| {
            let grades = by_student.remove(&student.id).unwrap_or_default();
            StudentGrades { student, grades }
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTraditionalGrade {
    pub student_id: Uuid,
    pub category_id: Uuid,
    pub points_earned: f64,
    pub points_possible: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome<T> {
    pub record: T,
    /// True when an existing record was overwritten.
    pub replaced: bool,
}

/// Writes one grade for (student, category), overwriting any existing one.
pub async fn record_traditional_grade(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    grade: NewTraditionalGrade,
) -> Result<RecordOutcome<TraditionalGrade>, GradebookError> {
    if grade.points_earned < 0.0 || grade.points_possible < 0.0 {
        return Err(GradebookError::InvalidPoints {
            earned: grade.points_earned,
            possible: grade.points_possible,
        });
    }

    let key = vec![
        Filter::eq("student_id", json!(grade.student_id)),
        Filter::eq("category_id", json!(grade.category_id)),
    ];
    let mut lookup = Select::from(Table::TraditionalGrades).limit(1);
    for filter in &key {
        lookup = lookup.filter(filter.clone());
    }
    let existing = gateway.select(ctx, lookup).await?;
    let now = Utc::now();

    let (rows, replaced) = if existing.is_empty() {
        let row = json!({
            "id": Uuid::new_v4(),
            "student_id": grade.student_id,
            "category_id": grade.category_id,
            "points_earned": grade.points_earned,
            "points_possible": grade.points_possible,
            "created_at": now,
            "updated_at": now,
        });
        (gateway.insert(ctx, Table::TraditionalGrades, vec![row]).await?, false)
    } else {
        let patch = json!({
            "points_earned": grade.points_earned,
            "points_possible": grade.points_possible,
            "updated_at": now,
        });
        (gateway.update(ctx, Table::TraditionalGrades, patch, key).await?, true)
    };

    let record = decode_rows::<TraditionalGrade>(Table::TraditionalGrades, rows)?
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Rejected {
            table: Table::TraditionalGrades.as_str(),
            message: "write returned no rows".to_string(),
        })?;
    Ok(RecordOutcome { record, replaced })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};
    use uuid::Uuid;

    pub fn student(id: Uuid, first: &str, last: &str) -> Value {
        json!({"id": id, "first_name": first, "last_name": last, "grade_level": "7"})
    }

    pub fn enrollment(class_id: Uuid, student_id: Uuid, active: bool) -> Value {
        json!({
            "id": Uuid::new_v4(),
            "class_id": class_id,
            "student_id": student_id,
            "is_active": active,
            "enrolled_at": "2026-01-05T09:00:00Z",
        })
    }

    pub fn category(id: Uuid, class_id: Uuid, name: &str, weight: f64) -> Value {
        json!({"id": id, "class_id": class_id, "name": name, "weight": weight})
    }

    pub fn grade(student_id: Uuid, category_id: Uuid, earned: f64, possible: f64) -> Value {
        json!({
            "id": Uuid::new_v4(),
            "student_id": student_id,
            "category_id": category_id,
            "points_earned": earned,
            "points_possible": possible,
            "created_at": "2026-02-01T10:00:00Z",
            "updated_at": "2026-02-01T10:00:00Z",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::gateway::{InMemoryGateway, Operation};

    fn ctx() -> RequestContext {
        RequestContext::new(Uuid::new_v4(), "teacher")
    }

    #[tokio::test]
    async fn joins_grades_and_categories_per_student() {
        let class_id = Uuid::new_v4();
        let (noor, tomas, priya) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let homework = Uuid::new_v4();
        let gw = InMemoryGateway::new()
            .with_rows(
                Table::ClassEnrollments,
                vec![
                    enrollment(class_id, noor, true),
                    enrollment(class_id, tomas, true),
                    enrollment(class_id, priya, false),
                ],
            )
            .with_rows(
                Table::Students,
                vec![
                    student(noor, "Noor", "Haddad"),
                    student(tomas, "Tomas", "Lindqvist"),
                    student(priya, "Priya", "Sandoval"),
                ],
            )
            .with_rows(Table::GradeCategories, vec![category(homework, class_id, "Homework", 20.0)])
            .with_rows(
                Table::TraditionalGrades,
                vec![grade(noor, homework, 18.0, 20.0), grade(priya, homework, 10.0, 20.0)],
            );

        let result = fetch_class_grades(&gw, &ctx(), class_id).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].student.first_name, "Noor");
        assert_eq!(result[0].grades.len(), 1);
        assert_eq!(result[0].grades[0].category_name.as_deref(), Some("Homework"));
        assert_eq!(result[0].grades[0].category_weight, Some(20.0));
        assert_eq!(result[0].grades[0].percentage(), Some(90.0));
        assert!(result[1].grades.is_empty());
    }

    #[tokio::test]
    async fn empty_class_stops_after_enrollment() {
        let gw = InMemoryGateway::new();
        let result = fetch_class_grades(&gw, &ctx(), Uuid::new_v4()).await.unwrap();
        assert!(result.is_empty());
        let calls = gw.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].table, Table::ClassEnrollments);
    }

    #[tokio::test]
    async fn recording_twice_overwrites_in_place() {
        let gw = InMemoryGateway::new();
        let context = ctx();
        let new_grade = NewTraditionalGrade {
            student_id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            points_earned: 12.0,
            points_possible: 20.0,
        };

        let first = record_traditional_grade(&gw, &context, new_grade.clone())
            .await
            .unwrap();
        assert!(!first.replaced);

        let second = record_traditional_grade(
            &gw,
            &context,
            NewTraditionalGrade {
                points_earned: 17.0,
                ..new_grade
            },
        )
        .await
        .unwrap();
        assert!(second.replaced);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.percentage(), Some(85.0));
        assert_eq!(gw.rows(Table::TraditionalGrades).len(), 1);
        assert!(gw.calls().iter().any(|c| c.operation == Operation::Update));
    }

    #[tokio::test]
    async fn negative_points_are_rejected_before_any_call() {
        let gw = InMemoryGateway::new();
        let err = record_traditional_grade(
            &gw,
            &ctx(),
            NewTraditionalGrade {
                student_id: Uuid::new_v4(),
                category_id: Uuid::new_v4(),
                points_earned: -1.0,
                points_possible: 10.0,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GradebookError::InvalidPoints { .. }));
        assert!(gw.calls().is_empty());
    }
}
