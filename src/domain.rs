use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;

/// Role-keyed strategy over the three profile kinds. All provisioning and
/// approval paths dispatch through this one enum instead of per-role modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn profile_table(&self) -> &'static str {
        match self {
            Role::Student => "student_profiles",
            Role::Teacher => "teacher_profiles",
            Role::Admin => "admin_profiles",
        }
    }

    /// Prefix for the generated human identifier (enrollment no / employee id).
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Role::Student => "STU",
            Role::Teacher => "TCH",
            Role::Admin => "ADM",
        }
    }

    pub fn human_id_column(&self) -> &'static str {
        match self {
            Role::Student => "enrollment_no",
            Role::Teacher | Role::Admin => "employee_id",
        }
    }

    pub fn all() -> [Role; 3] {
        [Role::Student, Role::Teacher, Role::Admin]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProfileStatus {
    pub fn parse(s: &str) -> Option<ProfileStatus> {
        match s {
            "PENDING" => Some(ProfileStatus::Pending),
            "APPROVED" => Some(ProfileStatus::Approved),
            "REJECTED" => Some(ProfileStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Pending => "PENDING",
            ProfileStatus::Approved => "APPROVED",
            ProfileStatus::Rejected => "REJECTED",
        }
    }

}

/// Error taxonomy surfaced to callers. Each variant maps onto one wire code.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Auth(String),
    #[error("profile creation failed: {0}")]
    ProfileCreation(String),
    #[error("{0}")]
    Persistence(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    NotFound(String),
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::Auth(_) => "auth_error",
            DomainError::ProfileCreation(_) => "profile_creation_failed",
            DomainError::Persistence(_) => "db_update_failed",
            DomainError::Permission(_) => "permission_denied",
            DomainError::NotFound(_) => "not_found",
        }
    }
}

/// Subjects and batches are persisted as comma-joined strings so they survive
/// identity-metadata constraints. Parsing trims and drops empties.
pub fn split_subject_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn join_subject_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Case-insensitive set intersection on two comma-joined subject strings.
pub fn subjects_intersect(a: &str, b: &str) -> bool {
    let left: Vec<String> = split_subject_list(a)
        .into_iter()
        .map(|s| s.to_ascii_lowercase())
        .collect();
    split_subject_list(b)
        .iter()
        .any(|s| left.contains(&s.trim().to_ascii_lowercase()))
}

/// `{PREFIX}{YYYY}{MM}{4-digit suffix}`, e.g. STU2026080007.
pub fn format_human_id(prefix: &str, now: DateTime<Utc>, suffix: u32) -> String {
    format!("{}{}{:02}{:04}", prefix, now.year(), now.month(), suffix % 10_000)
}

/// Month-scoped LIKE pattern for counting prior identifiers of a role.
pub fn human_id_month_pattern(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}{}{:02}%", prefix, now.year(), now.month())
}

/// Fallback suffix when the count query fails: current-time low-order digits.
pub fn time_derived_suffix(now: DateTime<Utc>) -> u32 {
    (now.timestamp_millis().unsigned_abs() % 10_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn human_id_format_is_prefix_year_month_suffix() {
        let now = Utc.with_ymd_and_hms(2026, 8, 24, 10, 0, 0).unwrap();
        assert_eq!(format_human_id("STU", now, 7), "STU2026080007");
        assert_eq!(format_human_id("TCH", now, 12345), "TCH2026082345");
        assert_eq!(human_id_month_pattern("STU", now), "STU202608%");
    }

    #[test]
    fn subject_intersection_ignores_case_and_whitespace() {
        assert!(subjects_intersect("Physics, Math", "math,Chemistry"));
        assert!(!subjects_intersect("Physics", "Chemistry,Biology"));
        assert!(!subjects_intersect("", "Physics"));
    }

    #[test]
    fn subject_list_roundtrip_drops_empties() {
        let parsed = split_subject_list(" Physics ,, Math ,");
        assert_eq!(parsed, vec!["Physics".to_string(), "Math".to_string()]);
        assert_eq!(join_subject_list(&parsed), "Physics,Math");
    }

    #[test]
    fn role_strategy_table_is_consistent() {
        for role in Role::all() {
            assert_eq!(Role::parse(role.as_str()), Some(role));
            assert_eq!(role.id_prefix().len(), 3);
        }
        assert_eq!(Role::Student.human_id_column(), "enrollment_no");
        assert_eq!(Role::Teacher.human_id_column(), "employee_id");
    }

    #[test]
    fn status_parsing_is_exact() {
        assert_eq!(ProfileStatus::parse("REJECTED"), Some(ProfileStatus::Rejected));
        assert_eq!(ProfileStatus::Pending.as_str(), "PENDING");
        assert_eq!(ProfileStatus::parse("rejected"), None);
    }
}
