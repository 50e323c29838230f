use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::gradebook::{UnifiedGradebook, UnifiedStudent};
use crate::models::{letter_grade, AssignmentGrade};

const ATTENTION_THRESHOLD: f64 = 70.0;

fn format_average(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}% ({})", letter_grade(v)),
        None => "no grades".to_string(),
    }
}

/// Students ranked by overall average, ungraded students last.
pub fn rank_students(book: &UnifiedGradebook) -> Vec<&UnifiedStudent> {
    let mut ranked: Vec<&UnifiedStudent> = book.students.iter().collect();
    ranked.sort_by(|a, b| match (a.overall_average, b.overall_average) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.student.last_name.cmp(&b.student.last_name),
    });
    ranked
}

pub fn build_report(class_label: &str, generated_at: DateTime<Utc>, book: &UnifiedGradebook) -> String {
    let summary = &book.summary;
    let mut output = String::new();

    let _ = writeln!(output, "# Gradebook Report");
    let _ = writeln!(
        output,
        "Generated for {} on {}",
        class_label,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Students: {}", summary.total_students);
    let _ = writeln!(output, "- Class average: {:.1}%", summary.average_grade);
    let _ = writeln!(output, "- Traditional grades: {}", summary.total_traditional_grades);
    let _ = writeln!(output, "- Assignment grades: {}", summary.total_assignment_grades);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students");

    if book.students.is_empty() {
        let _ = writeln!(output, "No students enrolled in this class.");
    } else {
        for student in rank_students(book) {
            let _ = writeln!(
                output,
                "- {}: {} (traditional {}, assignments {})",
                student.student.full_name(),
                format_average(student.overall_average),
                format_average(student.traditional_average),
                format_average(student.assignment_average)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Attention");

    let flagged: Vec<&UnifiedStudent> = rank_students(book)
        .into_iter()
        .filter(|s| s.overall_average.is_some_and(|avg| avg < ATTENTION_THRESHOLD))
        .collect();
    if flagged.is_empty() {
        let _ = writeln!(output, "No students below {ATTENTION_THRESHOLD:.0}%.");
    } else {
        for student in flagged.iter().rev() {
            let _ = writeln!(
                output,
                "- {} at {}",
                student.student.full_name(),
                format_average(student.overall_average)
            );
        }
    }

    let mut recent: Vec<&AssignmentGrade> = book
        .students
        .iter()
        .flat_map(|s| s.assignment_grades.iter())
        .collect();
    recent.sort_by(|a, b| b.graded_at.cmp(&a.graded_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Feedback");

    if recent.is_empty() {
        let _ = writeln!(output, "No assignment grades recorded.");
    } else {
        for grade in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} on {} ({:.0}%): {}",
                grade.student_name,
                grade.assignment_title,
                grade.grade,
                grade.feedback.as_deref().unwrap_or("no feedback")
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradebook::{combine, JoinKey};
    use crate::models::Student;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn student(first: &str, last: &str) -> Student {
        Student {
            id: Uuid::new_v4(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            grade_level: None,
            reading_level: None,
            class_id: None,
        }
    }

    fn assignment(name: &str, title: &str, grade: f64, day: u32) -> AssignmentGrade {
        AssignmentGrade {
            grade_id: Uuid::new_v4(),
            submission_id: Uuid::new_v4(),
            student_id: None,
            student_name: name.to_string(),
            assignment_title: title.to_string(),
            grade,
            feedback: Some(format!("note {day}")),
            graded_at: Utc.with_ymd_and_hms(2026, 2, day, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn report_ranks_students_and_flags_low_averages() {
        let students = vec![student("Noor", "Haddad"), student("Tomas", "Lindqvist"), student("Priya", "Sandoval")];
        let grades = vec![
            assignment("Noor Haddad", "Quiz 1", 92.0, 2),
            assignment("Priya Sandoval", "Quiz 1", 58.0, 3),
        ];
        let book = combine(&students, &[], &grades, JoinKey::FullName);
        let generated = Utc.with_ymd_and_hms(2026, 2, 10, 8, 30, 0).unwrap();

        let report = build_report("Grade 7 Math", generated, &book);
        assert!(report.contains("Generated for Grade 7 Math on 2026-02-10 08:30 UTC"));
        assert!(report.contains("- Class average: 75.0%"));

        let noor = report.find("- Noor Haddad: 92.0% (A)").unwrap();
        let priya = report.find("- Priya Sandoval: 58.0% (F)").unwrap();
        let tomas = report.find("- Tomas Lindqvist: no grades").unwrap();
        assert!(noor < priya && priya < tomas);

        assert!(report.contains("- Priya Sandoval at 58.0% (F)"));
        assert!(report.contains("- Priya Sandoval on Quiz 1 (58%): note 3"));
    }

    #[test]
    fn empty_gradebook_reports_placeholders() {
        let report = build_report("Empty", Utc::now(), &UnifiedGradebook::default());
        assert!(report.contains("No students enrolled in this class."));
        assert!(report.contains("No students below 70%."));
        assert!(report.contains("No assignment grades recorded."));
    }
}
