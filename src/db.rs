use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::postgres::Postgres;
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::{
    check_identifier, object_columns, Filter, FilterOp, Gateway, RequestContext, Select, Table,
};
use crate::sources::assignment::record_assignment_grade;
use crate::sources::traditional::{record_traditional_grade, NewTraditionalGrade};

const SCHEMA: &str = "gradebook";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Gateway backed by the Postgres schema in `migrations/`. Rows are read
/// and written as `jsonb`, and the caller's identity is installed as
/// `request.jwt.claim.*` settings for row-level security policies.
#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self, ctx: &RequestContext) -> Result<Transaction<'static, Postgres>, GatewayError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "SELECT set_config('request.jwt.claim.sub', $1, true), \
             set_config('request.jwt.claim.role', $2, true)",
        )
        .bind(ctx.user_id.to_string())
        .bind(ctx.role.clone())
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }
}

fn qualified(table: Table) -> String {
    format!("{SCHEMA}.{}", table.as_str())
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) -> Result<(), GatewayError> {
    for (i, filter) in filters.iter().enumerate() {
        check_identifier(&filter.column)?;
        builder.push(if i == 0 { " WHERE " } else { " AND " });
        builder.push(format!("(to_jsonb(t) -> '{}')", filter.column));
        match filter.op {
            FilterOp::Eq => {
                builder.push(" = ");
                builder.push_bind(Json(filter.value.clone()));
            }
            FilterOp::In => {
                builder.push(" IN (SELECT jsonb_array_elements(");
                builder.push_bind(Json(filter.value.clone()));
                builder.push("))");
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Gateway for PgGateway {
    async fn select(&self, ctx: &RequestContext, query: Select) -> Result<Vec<Value>, GatewayError> {
        query.validate()?;
        let mut builder = QueryBuilder::<Postgres>::new("SELECT to_jsonb(t) FROM ");
        builder.push(qualified(query.table)).push(" AS t");
        push_filters(&mut builder, &query.filters)?;
        if let Some(order) = &query.order {
            builder.push(format!(
                " ORDER BY (to_jsonb(t) -> '{}') {}",
                order.column,
                if order.descending { "DESC" } else { "ASC" }
            ));
        }
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let mut tx = self.begin(ctx).await?;
        let rows: Vec<Json<Value>> = builder.build_query_scalar().fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn insert(
        &self,
        ctx: &RequestContext,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, GatewayError> {
        let mut tx = self.begin(ctx).await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let columns = object_columns(table, &row)?.join(", ");
            let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
            builder
                .push(qualified(table))
                .push(format!(" AS t ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::"))
                .push(qualified(table))
                .push(", ")
                .push_bind(Json(row))
                .push(") RETURNING to_jsonb(t)");
            let Json(value): Json<Value> = builder.build_query_scalar().fetch_one(&mut *tx).await?;
            inserted.push(value);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        table: Table,
        patch: Value,
        filters: Vec<Filter>,
    ) -> Result<Vec<Value>, GatewayError> {
        let columns = object_columns(table, &patch)?.join(", ");
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE ");
        builder
            .push(qualified(table))
            .push(format!(" AS t SET ({columns}) = (SELECT {columns} FROM jsonb_populate_record(NULL::"))
            .push(qualified(table))
            .push(", ")
            .push_bind(Json(patch))
            .push("))");
        push_filters(&mut builder, &filters)?;
        builder.push(" RETURNING to_jsonb(t)");

        let mut tx = self.begin(ctx).await?;
        let rows: Vec<Json<Value>> = builder.build_query_scalar().fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        table: Table,
        filters: Vec<Filter>,
    ) -> Result<Vec<Value>, GatewayError> {
        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM ");
        builder.push(qualified(table)).push(" AS t");
        push_filters(&mut builder, &filters)?;
        builder.push(" RETURNING to_jsonb(t)");

        let mut tx = self.begin(ctx).await?;
        let rows: Vec<Json<Value>> = builder.build_query_scalar().fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}

pub const DEMO_CLASS_ID: &str = "5b1e0c1a-7a43-4d55-9d0e-2f6a1c9e8b10";

/// Loads a small demo class graded by `ctx.user_id`. Does nothing if the
/// class already exists.
pub async fn seed(gateway: &dyn Gateway, ctx: &RequestContext) -> anyhow::Result<Uuid> {
    let class_id = Uuid::parse_str(DEMO_CLASS_ID)?;
    let existing = gateway
        .select(
            ctx,
            Select::from(Table::Classes)
                .filter(Filter::eq("id", json!(class_id)))
                .limit(1),
        )
        .await?;
    if !existing.is_empty() {
        return Ok(class_id);
    }

    let enrolled_at = Utc
        .with_ymd_and_hms(2026, 1, 5, 9, 0, 0)
        .single()
        .context("invalid enrollment date")?;

    gateway
        .insert(
            ctx,
            Table::Classes,
            vec![json!({"id": class_id, "name": "Grade 7 Math", "teacher_id": ctx.user_id})],
        )
        .await?;

    let students = vec![
        (Uuid::parse_str("9a41c2e8-6f0d-4b7a-a3c5-1e82d47f06b9")?, "Noor", "Haddad", "7", "On level"),
        (Uuid::parse_str("c7e3b915-2d48-4e61-8f9a-5b06a1d3e274")?, "Tomas", "Lindqvist", "7", "Above level"),
        (Uuid::parse_str("41f8d0a6-b3e2-47c9-9d15-e6a7c2b80f53")?, "Priya", "Sandoval", "7", "Below level"),
    ];

    let mut student_rows = Vec::new();
    let mut enrollment_rows = Vec::new();
    let mut profile_rows = Vec::new();
    for (id, first, last, grade_level, reading_level) in &students {
        student_rows.push(json!({
            "id": id,
            "first_name": first,
            "last_name": last,
            "grade_level": grade_level,
            "reading_level": reading_level,
            "class_id": class_id,
        }));
        enrollment_rows.push(json!({
            "id": Uuid::new_v4(),
            "class_id": class_id,
            "student_id": id,
            "is_active": true,
            "enrolled_at": enrolled_at,
        }));
        profile_rows.push(json!({
            "id": Uuid::new_v4(),
            "first_name": first,
            "last_name": last,
            "role": "student",
            "student_id": id,
        }));
    }
    gateway.insert(ctx, Table::Students, student_rows).await?;
    gateway.insert(ctx, Table::ClassEnrollments, enrollment_rows).await?;
    let profiles = gateway.insert(ctx, Table::Profiles, profile_rows).await?;

    let categories = [("Homework", 20.0), ("Tests", 50.0), ("Participation", 30.0)];
    let mut category_ids = Vec::new();
    let mut category_rows = Vec::new();
    for (name, weight) in categories {
        let id = Uuid::new_v4();
        category_ids.push(id);
        category_rows.push(json!({"id": id, "class_id": class_id, "name": name, "weight": weight}));
    }
    gateway.insert(ctx, Table::GradeCategories, category_rows).await?;

    let points = [
        (0, 0, 18.0, 20.0),
        (0, 1, 41.0, 50.0),
        (1, 0, 20.0, 20.0),
        (1, 2, 27.0, 30.0),
        (2, 1, 29.0, 50.0),
    ];
    for (student, category, earned, possible) in points {
        record_traditional_grade(
            gateway,
            ctx,
            NewTraditionalGrade {
                student_id: students[student].0,
                category_id: category_ids[category],
                points_earned: earned,
                points_possible: possible,
            },
        )
        .await?;
    }

    let assignment_id = Uuid::new_v4();
    gateway
        .insert(
            ctx,
            Table::Assignments,
            vec![json!({
                "id": assignment_id,
                "class_id": class_id,
                "title": "Fractions Exit Ticket",
                "created_by": ctx.user_id,
            })],
        )
        .await?;

    let scores = [(0, 88.0, "Clear working shown"), (2, 64.0, "Review equivalent fractions")];
    for (profile, grade, feedback) in scores {
        let submission_id = Uuid::new_v4();
        let profile_id = profiles[profile]["id"].clone();
        gateway
            .insert(
                ctx,
                Table::Submissions,
                vec![json!({
                    "id": submission_id,
                    "assignment_id": assignment_id,
                    "student_id": profile_id,
                    "content": "",
                    "submitted_at": enrolled_at,
                })],
            )
            .await?;
        record_assignment_grade(gateway, ctx, submission_id, grade, Some(feedback.to_string())).await?;
    }

    Ok(class_id)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Imports traditional grades from a CSV file with the columns
/// `student_id,category_id,points_earned,points_possible`. Existing
/// (student, category) grades are overwritten.
pub async fn import_csv(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    csv_path: &std::path::Path,
) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    import_reader(gateway, ctx, &mut reader).await
}

async fn import_reader<R: std::io::Read>(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    reader: &mut csv::Reader<R>,
) -> anyhow::Result<ImportSummary> {
    let rows: Vec<NewTraditionalGrade> = reader
        .deserialize::<NewTraditionalGrade>()
        .enumerate()
        .map(|(line, row)| row.with_context(|| format!("invalid CSV record {}", line + 1)))
        .collect::<anyhow::Result<_>>()?;

    let mut summary = ImportSummary::default();
    for row in rows {
        let outcome = record_traditional_grade(gateway, ctx, row).await?;
        if outcome.replaced {
            summary.updated += 1;
        } else {
            summary.inserted += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use crate::gradebook::{Gradebook, JoinKey};
    use crate::notify::RecordingNotifier;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn seeded_class_produces_a_gradebook() {
        let gw = InMemoryGateway::new();
        let ctx = RequestContext::new(Uuid::new_v4(), "teacher");
        let class_id = seed(&gw, &ctx).await.unwrap();
        assert_eq!(seed(&gw, &ctx).await.unwrap(), class_id);
        assert_eq!(gw.rows(Table::Students).len(), 3);

        let mut book = Gradebook::new(JoinKey::StudentId);
        let view = book
            .refresh(&gw, &ctx, &RecordingNotifier::new(), class_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(view.summary.total_students, 3);
        assert_eq!(view.summary.total_traditional_grades, 5);
        assert_eq!(view.summary.total_assignment_grades, 2);

        let noor = &view.students[0];
        assert_eq!(noor.student.first_name, "Noor");
        assert_eq!(noor.traditional_average, Some(86.0));
        assert_eq!(noor.overall_average, Some(87.0));
    }

    #[tokio::test]
    async fn csv_import_counts_inserts_and_overwrites() {
        let gw = InMemoryGateway::new();
        let ctx = RequestContext::new(Uuid::new_v4(), "teacher");
        let data = "\
student_id,category_id,points_earned,points_possible
9a41c2e8-6f0d-4b7a-a3c5-1e82d47f06b9,c7e3b915-2d48-4e61-8f9a-5b06a1d3e274,8,10
9a41c2e8-6f0d-4b7a-a3c5-1e82d47f06b9,c7e3b915-2d48-4e61-8f9a-5b06a1d3e274,9,10
41f8d0a6-b3e2-47c9-9d15-e6a7c2b80f53,c7e3b915-2d48-4e61-8f9a-5b06a1d3e274,4.5,10
";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let summary = import_reader(&gw, &ctx, &mut reader).await.unwrap();
        assert_eq!(summary, ImportSummary { inserted: 2, updated: 1 });
        assert_eq!(gw.rows(Table::TraditionalGrades).len(), 2);
    }

    #[tokio::test]
    async fn csv_import_rejects_bad_rows_before_writing() {
        let gw = InMemoryGateway::new();
        let ctx = RequestContext::new(Uuid::new_v4(), "teacher");
        let data = "student_id,category_id,points_earned,points_possible\nnot-a-uuid,x,1,2\n";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        assert!(import_reader(&gw, &ctx, &mut reader).await.is_err());
        assert!(gw.calls().is_empty());
    }
}
