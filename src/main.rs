use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use classroom_gradebook::db::{self, PgGateway};
use classroom_gradebook::gateway::{Filter, Gateway, RequestContext, Select, Table};
use classroom_gradebook::gradebook::{Gradebook, JoinKey, UnifiedGradebook};
use classroom_gradebook::models::letter_grade;
use classroom_gradebook::notify::{LogNotifier, Notice, Notifier};
use classroom_gradebook::read_aloud::ReadAloud;
use classroom_gradebook::report;
use classroom_gradebook::sources::assignment::{fetch_graded_by, record_assignment_grade, AssignmentFilters};
use classroom_gradebook::sources::traditional::{record_traditional_grade, NewTraditionalGrade};

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "classroom-gradebook")]
#[command(about = "Unified gradebook and read-aloud tools for classroom teachers", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: AppConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JoinArg {
    /// Match assignment grades by the student's full name
    Name,
    /// Match assignment grades by the linked roster student
    StudentId,
}

impl From<JoinArg> for JoinKey {
    fn from(value: JoinArg) -> Self {
        match value {
            JoinArg::Name => JoinKey::FullName,
            JoinArg::StudentId => JoinKey::StudentId,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo class graded by the current user
    Seed,
    /// Import traditional grades from a CSV file
    ImportGrades {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record points for a student in a grade category
    Grade {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        category: Uuid,
        #[arg(long)]
        earned: f64,
        #[arg(long)]
        possible: f64,
    },
    /// Grade a submitted assignment (0-100)
    GradeAssignment {
        #[arg(long)]
        submission: Uuid,
        #[arg(long)]
        grade: f64,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Show the unified gradebook for a class
    Gradebook {
        #[arg(long)]
        class: Uuid,
        #[arg(long, value_enum, default_value_t = JoinArg::Name)]
        join: JoinArg,
        #[arg(long)]
        json: bool,
    },
    /// List assignment grades written by the current user
    Assignments {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown gradebook report
    Report {
        #[arg(long)]
        class: Uuid,
        #[arg(long, value_enum, default_value_t = JoinArg::Name)]
        join: JoinArg,
        #[arg(long, default_value = "gradebook.md")]
        out: PathBuf,
    },
    /// Print words as they would be highlighted during read-aloud
    ReadAloud {
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("classroom_gradebook=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let notifier = LogNotifier;

    if let Commands::ReadAloud { text, speed } = &cli.command {
        return read_aloud(text, *speed).await;
    }

    let pool = cli.config.connect().await?;
    if let Commands::InitDb = cli.command {
        db::init_db(&pool).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let ctx = cli.config.request_context()?;
    let gateway = PgGateway::new(pool);

    match cli.command {
        Commands::InitDb | Commands::ReadAloud { .. } => {}
        Commands::Seed => {
            let class_id = db::seed(&gateway, &ctx).await?;
            println!("Seed data ready for class {class_id}.");
        }
        Commands::ImportGrades { csv } => {
            let summary = db::import_csv(&gateway, &ctx, &csv).await?;
            info!(inserted = summary.inserted, updated = summary.updated, "grades imported");
            println!(
                "Imported {} new and {} updated grades from {}.",
                summary.inserted,
                summary.updated,
                csv.display()
            );
        }
        Commands::Grade {
            student,
            category,
            earned,
            possible,
        } => {
            let outcome = record_traditional_grade(
                &gateway,
                &ctx,
                NewTraditionalGrade {
                    student_id: student,
                    category_id: category,
                    points_earned: earned,
                    points_possible: possible,
                },
            )
            .await?;
            let grade = outcome.record;
            notifier.notify(Notice::info(
                if outcome.replaced { "Grade updated" } else { "Grade recorded" },
                format!("{earned}/{possible} for student {student}"),
            ));
            match grade.percentage() {
                Some(pct) => println!("Saved {pct:.1}% ({}).", letter_grade(pct)),
                None => println!("Saved; no points possible, so no percentage."),
            }
        }
        Commands::GradeAssignment {
            submission,
            grade,
            feedback,
        } => {
            let outcome = record_assignment_grade(&gateway, &ctx, submission, grade, feedback).await?;
            notifier.notify(Notice::info(
                if outcome.replaced { "Grade updated" } else { "Grade recorded" },
                format!("{grade:.1}% for submission {submission}"),
            ));
            println!("Saved {:.1}% ({}).", outcome.record.grade, letter_grade(outcome.record.grade));
        }
        Commands::Gradebook { class, join, json } => {
            let book = load_gradebook(&gateway, &ctx, &notifier, class, join.into()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&book)?);
            } else {
                print_gradebook(&book);
            }
        }
        Commands::Assignments { title, student, json } => {
            let filters = AssignmentFilters { title, student };
            let grades = fetch_graded_by(&gateway, &ctx, &filters)
                .await
                .context("failed to load assignment grades")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&grades)?);
            } else if grades.is_empty() {
                println!("No assignment grades found.");
            } else {
                for grade in &grades {
                    println!(
                        "- {} / {}: {:.1}% graded {}",
                        grade.student_name,
                        grade.assignment_title,
                        grade.grade,
                        grade.graded_at.format("%Y-%m-%d")
                    );
                }
            }
        }
        Commands::Report { class, join, out } => {
            let book = load_gradebook(&gateway, &ctx, &notifier, class, join.into()).await?;
            let label = class_name(&gateway, &ctx, class).await?;
            let report = report::build_report(&label, chrono::Utc::now(), &book);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn load_gradebook(
    gateway: &dyn Gateway,
    ctx: &RequestContext,
    notifier: &dyn Notifier,
    class_id: Uuid,
    join: JoinKey,
) -> anyhow::Result<UnifiedGradebook> {
    let mut book = Gradebook::new(join);
    let view = book
        .refresh(gateway, ctx, notifier, class_id, &CancellationToken::new())
        .await
        .with_context(|| format!("failed to load gradebook for class {class_id}"))?;
    Ok(view.clone())
}

async fn class_name(gateway: &dyn Gateway, ctx: &RequestContext, class_id: Uuid) -> anyhow::Result<String> {
    let rows = gateway
        .select(
            ctx,
            Select::from(Table::Classes)
                .filter(Filter::eq("id", json!(class_id)))
                .limit(1),
        )
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("name"))
        .and_then(|name| name.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| class_id.to_string()))
}

fn print_gradebook(book: &UnifiedGradebook) {
    if book.students.is_empty() {
        println!("No students enrolled in this class.");
        return;
    }

    println!(
        "{} students, class average {:.1}% ({} traditional / {} assignment grades):",
        book.summary.total_students,
        book.summary.average_grade,
        book.summary.total_traditional_grades,
        book.summary.total_assignment_grades
    );
    for student in report::rank_students(book) {
        let overall = student
            .overall_average
            .map(|avg| format!("{avg:.1}% ({})", letter_grade(avg)))
            .unwrap_or_else(|| "no grades".to_string());
        println!(
            "- {} [{} traditional, {} assignment] {}",
            student.student.full_name(),
            student.traditional_grades.len(),
            student.assignment_grades.len(),
            overall
        );
    }
}

async fn read_aloud(text: &str, speed: f64) -> anyhow::Result<()> {
    let mut reader = ReadAloud::new();
    let Some(interval) = reader.start(text, speed)? else {
        println!("Nothing to read.");
        return Ok(());
    };
    info!(words = reader.tokens().len(), interval_ms = interval.as_millis() as u64, "reading");

    let mut current = reader.subscribe();
    let mut index = reader.current();
    while let Some(i) = index {
        if let Some(token) = reader.tokens().get(i) {
            println!("{:>4}  {}", i + 1, token.word);
        }
        if current.changed().await.is_err() {
            break;
        }
        index = *current.borrow_and_update();
    }
    Ok(())
}
