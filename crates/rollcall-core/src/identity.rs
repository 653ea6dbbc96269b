//! Identity resolution: scraped participant -> roster member

use rollcall_config::{Policy, RosterMember, Subject};
use rollcall_util::{MeetCode, SubjectId, UserId};
use std::collections::HashSet;
use tracing::trace;

use crate::Observation;

/// Shortest scraped name that may be matched by prefix
const MIN_PREFIX_LEN: usize = 3;

/// Source of subjects and rosters
pub trait Directory: Send + Sync {
    fn subject(&self, id: &SubjectId) -> Option<Subject>;

    fn subject_for_meet_code(&self, code: &MeetCode) -> Option<Subject>;

    /// Members eligible for a session. With no subject context every
    /// member of every subject is a candidate.
    fn roster(&self, subject: Option<&SubjectId>) -> Vec<RosterMember>;

    fn subject_count(&self) -> usize;
}

/// Directory backed by the loaded configuration
pub struct PolicyDirectory {
    policy: Policy,
}

impl PolicyDirectory {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }
}

impl Directory for PolicyDirectory {
    fn subject(&self, id: &SubjectId) -> Option<Subject> {
        self.policy.get_subject(id).cloned()
    }

    fn subject_for_meet_code(&self, code: &MeetCode) -> Option<Subject> {
        self.policy.subject_for_meet_code(code).cloned()
    }

    fn roster(&self, subject: Option<&SubjectId>) -> Vec<RosterMember> {
        match subject {
            Some(id) => self
                .policy
                .get_subject(id)
                .map(|s| s.roster.clone())
                .unwrap_or_default(),
            None => {
                let mut seen = HashSet::new();
                self.policy
                    .subjects
                    .iter()
                    .flat_map(|s| s.roster.iter())
                    .filter(|m| seen.insert(m.user_id.clone()))
                    .cloned()
                    .collect()
            }
        }
    }

    fn subject_count(&self) -> usize {
        self.policy.subjects.len()
    }
}

/// How a participant was tied to a roster member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    UserId,
    Email,
    StudentId,
    Name,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIdentity {
    pub user_id: UserId,
    /// Roster name, used as the record's display name
    pub display_name: String,
    pub student_id: Option<String>,
    pub method: MatchMethod,
}

impl ResolvedIdentity {
    fn from_member(member: &RosterMember, method: MatchMethod) -> Self {
        Self {
            user_id: member.user_id.clone(),
            display_name: member.name.clone(),
            student_id: member.student_id.clone(),
            method,
        }
    }
}

/// Resolve an observation against the eligible roster.
///
/// Precedence: explicit user id, verified email, verified student id, then
/// name. A name matches when it equals exactly one roster name after
/// normalization, or failing that is an unambiguous prefix of one (or one
/// is a prefix of it). Ambiguity resolves to nothing.
pub fn resolve_identity(roster: &[RosterMember], obs: &Observation) -> Option<ResolvedIdentity> {
    if let Some(user_id) = &obs.user_id {
        if let Some(member) = roster.iter().find(|m| m.user_id.as_str() == user_id) {
            return Some(ResolvedIdentity::from_member(member, MatchMethod::UserId));
        }
    }

    if let Some(email) = &obs.email {
        if let Some(member) = roster.iter().find(|m| {
            m.email_verified
                && m.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
        }) {
            return Some(ResolvedIdentity::from_member(member, MatchMethod::Email));
        }
    }

    if let Some(student_id) = &obs.student_id {
        if let Some(member) = roster.iter().find(|m| {
            m.student_id_verified && m.student_id.as_deref() == Some(student_id.as_str())
        }) {
            return Some(ResolvedIdentity::from_member(member, MatchMethod::StudentId));
        }
    }

    let scraped = normalize_name(&obs.name);
    if scraped.is_empty() {
        return None;
    }

    let exact: Vec<&RosterMember> = roster
        .iter()
        .filter(|m| normalize_name(&m.name) == scraped)
        .collect();
    if let [member] = exact.as_slice() {
        return Some(ResolvedIdentity::from_member(member, MatchMethod::Name));
    }
    if exact.len() > 1 {
        trace!(name = %obs.name, "Ambiguous exact name match");
        return None;
    }

    if scraped.chars().count() < MIN_PREFIX_LEN {
        return None;
    }

    let prefixed: Vec<&RosterMember> = roster
        .iter()
        .filter(|m| {
            let known = normalize_name(&m.name);
            !known.is_empty() && (known.starts_with(&scraped) || scraped.starts_with(&known))
        })
        .collect();
    match prefixed.as_slice() {
        [member] => Some(ResolvedIdentity::from_member(member, MatchMethod::Name)),
        _ => {
            trace!(name = %obs.name, candidates = prefixed.len(), "No unique name match");
            None
        }
    }
}

/// Lower-case, keep letters and digits, collapse everything else to single spaces
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, name: &str) -> RosterMember {
        RosterMember {
            user_id: UserId::new(id),
            name: name.into(),
            email: None,
            email_verified: false,
            student_id: None,
            student_id_verified: false,
        }
    }

    fn roster() -> Vec<RosterMember> {
        let mut jane = member("stu-1", "Jane Doe");
        jane.email = Some("jane@school.edu".into());
        jane.email_verified = true;
        jane.student_id = Some("S-001".into());
        jane.student_id_verified = true;

        let mut john = member("stu-2", "John Doe");
        john.email = Some("john@school.edu".into());
        john.email_verified = false;

        vec![
            jane,
            john,
            member("stu-3", "Maria Garcia-Lopez"),
            member("stu-4", "Jane Dobson"),
        ]
    }

    #[test]
    fn explicit_identifiers_take_precedence() {
        let roster = roster();

        let mut obs = Observation::named("Someone Else");
        obs.user_id = Some("stu-2".into());
        let id = resolve_identity(&roster, &obs).unwrap();
        assert_eq!(id.user_id.as_str(), "stu-2");
        assert_eq!(id.method, MatchMethod::UserId);

        let mut obs = Observation::named("J.");
        obs.email = Some("JANE@school.edu".into());
        let id = resolve_identity(&roster, &obs).unwrap();
        assert_eq!(id.user_id.as_str(), "stu-1");
        assert_eq!(id.method, MatchMethod::Email);

        let mut obs = Observation::named("J.");
        obs.student_id = Some("S-001".into());
        assert_eq!(resolve_identity(&roster, &obs).unwrap().method, MatchMethod::StudentId);
    }

    #[test]
    fn unverified_email_is_ignored() {
        let mut obs = Observation::named("Jx");
        obs.email = Some("john@school.edu".into());
        assert!(resolve_identity(&roster(), &obs).is_none());
    }

    #[test]
    fn name_matching() {
        let roster = roster();

        let id = resolve_identity(&roster, &Observation::named("  jane   DOE ")).unwrap();
        assert_eq!(id.user_id.as_str(), "stu-1");
        assert_eq!(id.display_name, "Jane Doe");

        // Truncated by the meeting UI
        let id = resolve_identity(&roster, &Observation::named("Maria Garc")).unwrap();
        assert_eq!(id.user_id.as_str(), "stu-3");

        // Decorated by the meeting UI
        let id = resolve_identity(&roster, &Observation::named("Jane Doe (Presenting)")).unwrap();
        assert_eq!(id.user_id.as_str(), "stu-1");
    }

    #[test]
    fn ambiguous_or_short_names_do_not_match() {
        let roster = roster();
        assert!(resolve_identity(&roster, &Observation::named("J")).is_none());
        assert!(resolve_identity(&roster, &Observation::named("Ja")).is_none());
        // Prefix of both Jane Doe and Jane Dobson
        assert!(resolve_identity(&roster, &Observation::named("Jane D")).is_none());
        assert!(resolve_identity(&roster, &Observation::named("Stranger")).is_none());
    }

    #[test]
    fn directory_roster_without_subject_spans_all_subjects() {
        let policy = rollcall_config::parse_config(
            r#"
            config_version = 1

            [[subjects]]
            id = "a"
            name = "A"
            [[subjects.roster]]
            user_id = "stu-1"
            name = "Jane Doe"

            [[subjects]]
            id = "b"
            name = "B"
            [[subjects.roster]]
            user_id = "stu-1"
            name = "Jane Doe"
            [[subjects.roster]]
            user_id = "stu-2"
            name = "John Doe"
            "#,
        )
        .unwrap();
        let directory = PolicyDirectory::new(policy);

        assert_eq!(directory.roster(None).len(), 2);
        assert_eq!(directory.roster(Some(&SubjectId::new("a"))).len(), 1);
        assert!(directory.roster(Some(&SubjectId::new("zzz"))).is_empty());
        assert_eq!(directory.subject_count(), 2);
    }
}
