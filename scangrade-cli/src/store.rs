use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use scangrade_core::{Assignment, AssignmentResolver, GradeEntry, GradeWriter};
use serde::{Deserialize, Serialize};

/// Grading store backed by plain files: assignments are read from a JSON
/// array, grades are appended to a JSON lines file.
pub struct JsonGradeStore {
    assignments: Vec<Assignment>,
    grades_path: PathBuf,
    grades: Mutex<File>,
}

/// One line of the grades file.
#[derive(Debug, Deserialize, Serialize)]
pub struct GradeRecord {
    pub assignment_id: u64,
    pub student_id: u64,
    pub exam_id: u64,
    #[serde(flatten)]
    pub entry: GradeEntry,
}

impl JsonGradeStore {
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        assignments_path: P,
        grades_path: Q,
    ) -> anyhow::Result<Self> {
        let assignments_path = assignments_path.as_ref();
        let file = File::open(assignments_path)
            .with_context(|| format!("can't open {}", assignments_path.display()))?;
        let assignments: Vec<Assignment> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid assignments in {}", assignments_path.display()))?;

        let grades_path = grades_path.as_ref().to_owned();
        let grades = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&grades_path)
            .with_context(|| format!("can't open {}", grades_path.display()))?;
        tracing::debug!(
            "loaded {} assignments, appending grades to {}",
            assignments.len(),
            grades_path.display()
        );
        Ok(Self {
            assignments,
            grades_path,
            grades: Mutex::new(grades),
        })
    }

    pub fn grades_path(&self) -> &Path {
        &self.grades_path
    }
}

impl AssignmentResolver for JsonGradeStore {
    fn find_latest_assignment(
        &self,
        student_id: u64,
        exam_id: u64,
    ) -> anyhow::Result<Option<Assignment>> {
        // ISO dates compare chronologically as strings; undated assignments sort first.
        Ok(self
            .assignments
            .iter()
            .filter(|a| a.student_id == student_id && a.exam_id == exam_id)
            .max_by(|a, b| a.scheduled_date.cmp(&b.scheduled_date))
            .cloned())
    }
}

impl GradeWriter for JsonGradeStore {
    fn write_grade(&self, assignment: &Assignment, entry: &GradeEntry) -> anyhow::Result<()> {
        let record = GradeRecord {
            assignment_id: assignment.id,
            student_id: assignment.student_id,
            exam_id: assignment.exam_id,
            entry: entry.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self
            .grades
            .lock()
            .map_err(|_| anyhow::anyhow!("grades file lock poisoned"))?;
        file.write_all(&line)
            .with_context(|| format!("can't append to {}", self.grades_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;

    use super::*;

    fn write_assignments(dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join("assignments.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 1, "student_id": 7, "exam_id": 3, "scheduled_date": "2024-06-01"},
                {"id": 2, "student_id": 7, "exam_id": 3, "scheduled_date": "2025-01-07"},
                {"id": 3, "student_id": 45, "exam_id": 9}
            ]"#,
        )?;
        Ok(path)
    }

    #[test]
    fn test_latest_assignment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonGradeStore::open(write_assignments(dir.path())?, dir.path().join("g.jsonl"))?;

        assert_eq!(store.find_latest_assignment(7, 3)?.map(|a| a.id), Some(2));
        assert_eq!(store.find_latest_assignment(45, 9)?.map(|a| a.id), Some(3));
        assert_eq!(store.find_latest_assignment(8, 3)?, None);
        Ok(())
    }

    #[test]
    fn test_grades_are_appended() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let grades_path = dir.path().join("grades.jsonl");
        let store = JsonGradeStore::open(write_assignments(dir.path())?, &grades_path)?;
        let assignment = store.find_latest_assignment(7, 3)?.expect("assignment");
        let entry = GradeEntry {
            score: 85,
            grader: "OCR".into(),
            method: "automated".into(),
            confidence: 0.8,
            notes: "OCR: 85 / 100".into(),
        };
        store.write_grade(&assignment, &entry)?;
        store.write_grade(&assignment, &entry)?;

        let lines: Vec<String> = BufReader::new(File::open(&grades_path)?)
            .lines()
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        let record: GradeRecord = serde_json::from_str(&lines[0])?;
        assert_eq!(record.assignment_id, 2);
        assert_eq!(record.entry, entry);
        Ok(())
    }

    #[test]
    fn test_missing_assignments_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = JsonGradeStore::open(dir.path().join("nope.json"), dir.path().join("g.jsonl"));
        assert!(result.is_err());
    }
}
