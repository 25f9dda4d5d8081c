use chrono::{DateTime, NaiveDate, NaiveTime, Weekday};
use rollcall_core::RollNumber;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage format for lecture dates.
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
/// Storage format for timetable start times.
pub(crate) const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub roll_number: RollNumber,
    pub name: String,
    pub branch: String,
    pub year: String,
}

/// All students sharing a branch and year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cohort {
    pub branch: String,
    pub year: String,
}

impl Cohort {
    pub fn new(branch: impl Into<String>, year: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            year: year.into(),
        }
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.year, self.branch)
    }
}

/// One attendance-taking event: a calendar date and a lecture identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LectureSlot {
    pub date: NaiveDate,
    pub lecture: String,
}

impl LectureSlot {
    pub fn new(date: NaiveDate, lecture: impl Into<String>) -> Self {
        Self {
            date,
            lecture: lecture.into(),
        }
    }

    /// Build a slot from client input. `date` may be `YYYY-MM-DD` or an
    /// RFC 3339 timestamp such as `2024-01-10T09:30:00.000Z`.
    pub fn parse(date: &str, lecture: &str) -> Result<Self, SlotError> {
        let lecture = lecture.trim();
        if lecture.is_empty() {
            return Err(SlotError::EmptyLecture);
        }
        Ok(Self::new(parse_date(date)?, lecture))
    }

    pub(crate) fn date_key(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }
}

impl fmt::Display for LectureSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date.format(DATE_FORMAT), self.lecture)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    #[error("invalid date {0:?}: expected YYYY-MM-DD or an RFC 3339 timestamp")]
    InvalidDate(String),
    #[error("lecture identifier is empty")]
    EmptyLecture,
    #[error("invalid weekday {0:?}: expected e.g. Mon or Monday")]
    InvalidDay(String),
    #[error("invalid start time {0:?}: expected HH:MM or an hour such as 11")]
    InvalidTime(String),
}

pub fn parse_date(input: &str) -> Result<NaiveDate, SlotError> {
    let input = input.trim();
    NaiveDate::parse_from_str(input, DATE_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(input).map(|dt| dt.date_naive()))
        .map_err(|_| SlotError::InvalidDate(input.to_string()))
}

pub fn parse_weekday(input: &str) -> Result<Weekday, SlotError> {
    input
        .trim()
        .parse()
        .map_err(|_| SlotError::InvalidDay(input.trim().to_string()))
}

/// Lecture start time: `HH:MM`, or a bare hour as the old timetables stored it.
pub fn parse_start_time(input: &str) -> Result<NaiveTime, SlotError> {
    let input = input.trim();
    NaiveTime::parse_from_str(input, TIME_FORMAT)
        .ok()
        .or_else(|| input.parse::<u32>().ok().and_then(|hour| NaiveTime::from_hms_opt(hour, 0, 0)))
        .ok_or_else(|| SlotError::InvalidTime(input.to_string()))
}

/// One weekly lecture of a cohort: when it starts and which subject it is.
/// The subject is the lecture identifier attendance is recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledLecture {
    pub start: NaiveTime,
    pub subject: String,
}

impl ScheduledLecture {
    pub fn parse(start: &str, subject: &str) -> Result<Self, SlotError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(SlotError::EmptyLecture);
        }
        Ok(Self {
            start: parse_start_time(start)?,
            subject: subject.to_string(),
        })
    }
}

/// A cohort's lectures on one weekday, in start order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimetableDay {
    pub day: Weekday,
    pub lectures: Vec<ScheduledLecture>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(Self::Present),
            "Absent" => Ok(Self::Absent),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

/// Attendance totals for one student across every recorded lecture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSummary {
    pub roll_number: RollNumber,
    pub total_classes: u32,
    pub present_count: u32,
    /// Percentage of lectures attended, two decimals; 0 when nothing is recorded.
    pub attendance_percentage: f64,
}

impl AttendanceSummary {
    pub(crate) fn new(roll_number: RollNumber, total_classes: u32, present_count: u32) -> Self {
        let attendance_percentage = if total_classes == 0 {
            0.0
        } else {
            (present_count as f64 / total_classes as f64 * 10_000.0).round() / 100.0
        };
        Self {
            roll_number,
            total_classes,
            present_count,
            attendance_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_plain() {
        assert_eq!(parse_date("2024-01-10").unwrap(), NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
    }

    #[test]
    fn test_parse_date_client_timestamp() {
        assert_eq!(
            parse_date("2024-01-10T09:30:00.000Z").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
        );
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(matches!(parse_date("10/01/2024"), Err(SlotError::InvalidDate(_))));
    }

    #[test]
    fn test_slot_requires_lecture() {
        assert_eq!(LectureSlot::parse("2024-01-10", "  "), Err(SlotError::EmptyLecture));
        let slot = LectureSlot::parse("2024-01-10", " L1 ").unwrap();
        assert_eq!(slot.lecture, "L1");
        assert_eq!(slot.to_string(), "2024-01-10 L1");
    }

    #[test]
    fn test_parse_weekday() {
        assert_eq!(parse_weekday("Mon").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday(" thursday ").unwrap(), Weekday::Thu);
        assert!(matches!(parse_weekday("Someday"), Err(SlotError::InvalidDay(_))));
    }

    #[test]
    fn test_parse_start_time() {
        assert_eq!(parse_start_time("11").unwrap(), NaiveTime::from_hms_opt(11, 0, 0).unwrap());
        assert_eq!(parse_start_time("09:30").unwrap(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert!(matches!(parse_start_time("25"), Err(SlotError::InvalidTime(_))));
        assert!(matches!(parse_start_time("noon"), Err(SlotError::InvalidTime(_))));
    }

    #[test]
    fn test_scheduled_lecture_requires_subject() {
        assert_eq!(ScheduledLecture::parse("11", " "), Err(SlotError::EmptyLecture));
        assert_eq!(ScheduledLecture::parse("11", " DSA ").unwrap().subject, "DSA");
    }

    #[test]
    fn test_summary_percentage() {
        let roll: RollNumber = "101".parse().unwrap();
        assert_eq!(AttendanceSummary::new(roll.clone(), 0, 0).attendance_percentage, 0.0);
        assert_eq!(AttendanceSummary::new(roll.clone(), 3, 2).attendance_percentage, 66.67);
        assert_eq!(AttendanceSummary::new(roll, 4, 4).attendance_percentage, 100.0);
    }
}
