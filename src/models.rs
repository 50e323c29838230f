use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn full_name(first: &str, last: &str) -> String {
    format!("{first} {last}").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub grade_level: Option<String>,
    #[serde(default)]
    pub reading_level: Option<String>,
    #[serde(default)]
    pub class_id: Option<Uuid>,
}

impl Student {
    pub fn full_name(&self) -> String {
        full_name(&self.first_name, &self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeCategory {
    pub id: Uuid,
    pub class_id: Uuid,
    pub name: String,
    /// Share of the final mark, in percent.
    pub weight: f64,
}

/// Point-based grade in a weighted category. Updates overwrite in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraditionalGrade {
    pub id: Uuid,
    pub student_id: Uuid,
    pub category_id: Uuid,
    pub points_earned: f64,
    pub points_possible: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub category_weight: Option<f64>,
}

impl TraditionalGrade {
    /// `None` when nothing was possible.
    pub fn percentage(&self) -> Option<f64> {
        if self.points_possible > 0.0 {
            Some(self.points_earned / self.points_possible * 100.0)
        } else {
            None
        }
    }

    pub fn letter_grade(&self) -> Option<&'static str> {
        self.percentage().map(letter_grade)
    }
}

pub fn letter_grade(percentage: f64) -> &'static str {
    match percentage {
        p if p >= 90.0 => "A",
        p if p >= 80.0 => "B",
        p if p >= 70.0 => "C",
        p if p >= 60.0 => "D",
        _ => "F",
    }
}

/// One graded submission, flattened through submission -> assignment -> profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentGrade {
    pub grade_id: Uuid,
    pub submission_id: Uuid,
    /// Roster student linked to the submitting profile, when the link exists.
    pub student_id: Option<Uuid>,
    pub student_name: String,
    pub assignment_title: String,
    pub grade: f64,
    pub feedback: Option<String>,
    pub graded_at: DateTime<Utc>,
}

/// Read-aloud token. `start`/`end` are byte offsets into the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordToken {
    pub word: String,
    pub start: usize,
    pub end: usize,
    pub index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade(earned: f64, possible: f64) -> TraditionalGrade {
        TraditionalGrade {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            points_earned: earned,
            points_possible: possible,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            category_name: None,
            category_weight: None,
        }
    }

    #[test]
    fn percentage_requires_points_possible() {
        assert_eq!(grade(18.0, 20.0).percentage(), Some(90.0));
        assert_eq!(grade(5.0, 0.0).percentage(), None);
        assert_eq!(grade(5.0, 0.0).letter_grade(), None);
    }

    #[test]
    fn letter_grades_follow_ten_point_bands() {
        assert_eq!(letter_grade(95.0), "A");
        assert_eq!(letter_grade(80.0), "B");
        assert_eq!(letter_grade(79.9), "C");
        assert_eq!(letter_grade(60.0), "D");
        assert_eq!(letter_grade(12.0), "F");
    }

    #[test]
    fn full_name_tolerates_missing_parts() {
        assert_eq!(full_name("Noor", "Haddad"), "Noor Haddad");
        assert_eq!(full_name("Noor", ""), "Noor");
    }

    #[test]
    fn student_rows_decode_without_optional_columns() {
        let row = serde_json::json!({
            "id": "9a41c2e8-6f0d-4b7a-a3c5-1e82d47f06b9",
            "first_name": "Noor",
            "last_name": "Haddad"
        });
        let student: Student = serde_json::from_value(row).unwrap();
        assert_eq!(student.full_name(), "Noor Haddad");
        assert!(student.reading_level.is_none());
    }
}
