//! Instructor detection
//!
//! An ordered list of strategies; the first that yields a unique candidate
//! wins. Strategies are tried from most to least reliable.

use rollcall_api::DetectionConfidence;
use rollcall_config::Instructor;
use tracing::debug;

use crate::{normalize_name, Observation};

/// What a strategy may look at
pub struct DetectionContext<'a> {
    pub instructor: Option<&'a Instructor>,
    pub participants: &'a [Observation],
    /// Per participant: resolved to an enrolled student
    pub enrolled: &'a [bool],
}

impl DetectionContext<'_> {
    fn is_enrolled(&self, index: usize) -> bool {
        self.enrolled.get(index).copied().unwrap_or(false)
    }

    /// Index of the single participant satisfying `pred`, if exactly one does
    fn unique(&self, mut pred: impl FnMut(usize, &Observation) -> bool) -> Option<usize> {
        let mut found = None;
        for (i, p) in self.participants.iter().enumerate() {
            if pred(i, p) {
                if found.is_some() {
                    return None;
                }
                found = Some(i);
            }
        }
        found
    }
}

pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn confidence(&self) -> DetectionConfidence;

    /// Index into `ctx.participants` of the instructor
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<usize>;
}

/// Explicit user id, email or staff id of the designated instructor
pub struct ExactIdentity;

impl DetectionStrategy for ExactIdentity {
    fn name(&self) -> &'static str {
        "exact_identity"
    }

    fn confidence(&self) -> DetectionConfidence {
        DetectionConfidence::High
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<usize> {
        let instructor = ctx.instructor?;
        ctx.unique(|_, p| {
            let by_id = matches!(
                (&instructor.user_id, &p.user_id),
                (Some(expected), Some(seen)) if expected.as_str() == seen
            );
            let by_email = matches!(
                (&instructor.email, &p.email),
                (Some(expected), Some(seen)) if expected.eq_ignore_ascii_case(seen)
            );
            let by_staff_id = matches!(
                (&instructor.staff_id, &p.student_id),
                (Some(expected), Some(seen)) if expected == seen
            );
            by_id || by_email || by_staff_id
        })
    }
}

/// Full name equal after normalization
pub struct NormalizedFullName;

impl DetectionStrategy for NormalizedFullName {
    fn name(&self) -> &'static str {
        "full_name"
    }

    fn confidence(&self) -> DetectionConfidence {
        DetectionConfidence::High
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<usize> {
        let expected = normalize_name(&ctx.instructor?.name);
        if expected.is_empty() {
            return None;
        }
        ctx.unique(|_, p| normalize_name(&p.name) == expected)
    }
}

/// The meeting UI's host marker
pub struct HostFlag;

impl DetectionStrategy for HostFlag {
    fn name(&self) -> &'static str {
        "host_flag"
    }

    fn confidence(&self) -> DetectionConfidence {
        DetectionConfidence::Medium
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<usize> {
        ctx.unique(|_, p| p.is_host)
    }
}

/// Instructor's last name appears as a word in exactly one non-student name
pub struct FuzzyLastName;

impl DetectionStrategy for FuzzyLastName {
    fn name(&self) -> &'static str {
        "last_name"
    }

    fn confidence(&self) -> DetectionConfidence {
        DetectionConfidence::Low
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<usize> {
        let full = normalize_name(&ctx.instructor?.name);
        let last = full.split(' ').next_back().filter(|w| w.chars().count() >= 2)?;
        ctx.unique(|i, p| {
            !ctx.is_enrolled(i) && normalize_name(&p.name).split(' ').any(|w| w == last)
        })
    }
}

/// Only one person in the meeting and it is not an enrolled student
pub struct SoleParticipant;

impl DetectionStrategy for SoleParticipant {
    fn name(&self) -> &'static str {
        "sole_participant"
    }

    fn confidence(&self) -> DetectionConfidence {
        DetectionConfidence::Low
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<usize> {
        match ctx.participants {
            [_] if !ctx.is_enrolled(0) => Some(0),
            _ => None,
        }
    }
}

/// A detected instructor
#[derive(Debug, Clone, PartialEq)]
pub struct InstructorMatch {
    pub index: usize,
    pub strategy: &'static str,
    pub confidence: DetectionConfidence,
}

pub struct InstructorDetector {
    strategies: Vec<Box<dyn DetectionStrategy>>,
}

impl Default for InstructorDetector {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ExactIdentity),
            Box::new(NormalizedFullName),
            Box::new(HostFlag),
            Box::new(FuzzyLastName),
            Box::new(SoleParticipant),
        ])
    }
}

impl InstructorDetector {
    pub fn new(strategies: Vec<Box<dyn DetectionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn detect(&self, ctx: &DetectionContext<'_>) -> Option<InstructorMatch> {
        for strategy in &self.strategies {
            if let Some(index) = strategy.detect(ctx) {
                debug!(
                    strategy = strategy.name(),
                    name = %ctx.participants[index].name,
                    "Instructor detected"
                );
                return Some(InstructorMatch {
                    index,
                    strategy: strategy.name(),
                    confidence: strategy.confidence(),
                });
            }
        }
        None
    }
}
