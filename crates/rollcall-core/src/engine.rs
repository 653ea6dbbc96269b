//! Core reconciliation engine
//!
//! Stateless between calls apart from the injected caches: every decision is
//! made from what the store holds, so any number of callers may drive one
//! engine concurrently.

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{
    AttendanceStatus, AttendanceSubmission, FinalizeReport, FinalizeTrigger, HealthStatus,
    InstructorView, LiveParticipant, ParticipantRecordView, SessionStatus, SessionView,
    StatusTransition, SubmissionReceipt, SubmissionWarning, TokenConsumed, TokenGrant,
    WarningCode, WarningSeverity,
};
use rollcall_config::{EngineSettings, Policy, Subject};
use rollcall_store::{AuditEvent, AuditEventType, ParticipantRecord, SessionRecord, Store};
use rollcall_util::{MeetCode, Result, RollcallError, SessionId, SubjectId, TtlCache, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    apply_observation, evaluate, normalize, propose_fields, record_view, resolve_identity,
    CoreEvent, DetectionContext, Directory, Finalization, Finalizer, InstructorDetector,
    NormalizedSubmission, Observation, PolicyDirectory, ResolvedIdentity, SessionRegistrar,
    SyncTolerance, TokenManager,
};
use crate::finalizer::MAX_WRITE_ATTEMPTS;

/// Shared caches, owned by the caller and injected into the engine
#[derive(Clone)]
pub struct EngineCaches {
    /// Last reported room roster per session, from progress pings
    pub live: Arc<TtlCache<SessionId, Vec<LiveParticipant>>>,
    /// Last time any submission mentioned a meet code
    pub activity: Arc<TtlCache<MeetCode, DateTime<Local>>>,
}

impl EngineCaches {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            live: Arc::new(TtlCache::new(
                settings.live_cache_ttl,
                settings.live_cache_max_entries,
            )),
            activity: Arc::new(TtlCache::new(
                settings.live_cache_ttl,
                settings.live_cache_max_entries,
            )),
        }
    }
}

/// How a submission is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Full submission; token-gated when tokens are required
    Submission,
    /// Live progress ping; never token-gated
    Progress,
}

/// Result of ingesting a submission
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub receipt: SubmissionReceipt,
    pub events: Vec<CoreEvent>,
}

/// Result of a finalization request
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub report: FinalizeReport,
    pub events: Vec<CoreEvent>,
}

enum Reconciled {
    Changed,
    Unchanged,
    /// Guarded write kept losing
    Stale,
}

/// The core reconciliation engine
pub struct CoreEngine {
    settings: EngineSettings,
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    detector: InstructorDetector,
    registrar: SessionRegistrar,
    tokens: Arc<TokenManager>,
    finalizer: Finalizer,
    caches: EngineCaches,
}

impl CoreEngine {
    /// Create an engine over the loaded policy
    pub fn new(policy: Policy, store: Arc<dyn Store>, caches: EngineCaches) -> Self {
        let settings = policy.engine.clone();
        Self::with_directory(
            settings,
            store,
            Arc::new(PolicyDirectory::new(policy)),
            caches,
        )
    }

    pub fn with_directory(
        settings: EngineSettings,
        store: Arc<dyn Store>,
        directory: Arc<dyn Directory>,
        caches: EngineCaches,
    ) -> Self {
        let subject_count = directory.subject_count();
        info!(
            subject_count,
            require_token = settings.require_token,
            "Core engine initialized"
        );

        let _ = store.append_audit(AuditEvent::new(AuditEventType::PolicyLoaded {
            subject_count,
        }));

        let tolerance = SyncTolerance::from_settings(&settings);
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            crate::span(settings.token_lead),
            crate::span(settings.token_grace),
        ));
        let finalizer = Finalizer::new(
            store.clone(),
            tokens.clone(),
            settings.tardy_fraction,
            tolerance,
        );

        Self {
            registrar: SessionRegistrar::new(store.clone()),
            detector: InstructorDetector::default(),
            settings,
            store,
            directory,
            tokens,
            finalizer,
            caches,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Ingest an attendance submission
    pub fn submit(
        &self,
        raw: &AttendanceSubmission,
        client: &str,
        now: DateTime<Local>,
    ) -> Result<IngestOutcome> {
        self.ingest(raw, IngestMode::Submission, client, now)
    }

    /// Ingest a live progress ping
    pub fn report_progress(
        &self,
        raw: &AttendanceSubmission,
        client: &str,
        now: DateTime<Local>,
    ) -> Result<IngestOutcome> {
        self.ingest(raw, IngestMode::Progress, client, now)
    }

    fn ingest(
        &self,
        raw: &AttendanceSubmission,
        mode: IngestMode,
        client: &str,
        now: DateTime<Local>,
    ) -> Result<IngestOutcome> {
        let normalized = normalize(raw)?;
        let mut warnings = normalized.warnings.clone();

        if mode == IngestMode::Submission
            && self.settings.require_token
            && normalized.token.is_none()
        {
            return Err(RollcallError::validation("verificationToken is required"));
        }

        let subject = self.resolve_subject(&normalized, &mut warnings);
        let roster = self.directory.roster(subject.as_ref().map(|s| &s.id));
        let proposed = propose_fields(
            subject.as_ref(),
            normalized.day,
            normalized.start,
            normalized.stop,
            normalized.earliest_observed(),
            normalized.latest_observed(),
            now,
        );
        let registration = self.registrar.ensure_session(
            &normalized.meet_code,
            normalized.day,
            &proposed,
            &roster,
            now,
        )?;
        let session = registration.session;
        self.caches.activity.put(normalized.meet_code.clone(), now);

        if session.fields.is_placeholder {
            warnings.push(SubmissionWarning::new(
                WarningSeverity::Info,
                WarningCode::PlaceholderSession,
                format!(
                    "no subject is scheduled for {}; session is provisional",
                    normalized.meet_code
                ),
            ));
        }

        if session.is_finalized() {
            debug!(session_id = %session.id, "Submission for finalized session; nothing to do");
            let receipt = self.receipt(&session, None, true, 0, warnings, 0)?;
            return Ok(IngestOutcome {
                receipt,
                events: Vec::new(),
            });
        }

        if mode == IngestMode::Submission
            && let Some(token) = &normalized.token
        {
            self.authorize(token, &session, client, now)?;
        }

        let resolved: Vec<Option<ResolvedIdentity>> = normalized
            .participants
            .iter()
            .map(|p| resolve_identity(&roster, p))
            .collect();
        let enrolled: Vec<bool> = resolved.iter().map(Option::is_some).collect();

        let instructor_cfg = subject.as_ref().and_then(|s| s.instructor.as_ref());
        let detection = self.detector.detect(&DetectionContext {
            instructor: instructor_cfg,
            participants: &normalized.participants,
            enrolled: &enrolled,
        });
        let instructor_index = detection.as_ref().map(|m| m.index);

        let mut meeting_just_ended = false;
        let instructor = match &detection {
            Some(found) => {
                let obs = &normalized.participants[found.index];
                meeting_just_ended = self.record_instructor(&session, obs, now)?;
                Some(InstructorView {
                    display_name: obs.name.clone(),
                    user_id: instructor_cfg.and_then(|i| i.user_id.clone()),
                    strategy: found.strategy.to_string(),
                    confidence: found.confidence,
                    join_time: obs.join,
                    leave_time: obs.leave,
                    late: obs.join.is_some_and(|j| j > session.fields.start_time),
                })
            }
            None => {
                warnings.push(SubmissionWarning::new(
                    WarningSeverity::Warn,
                    WarningCode::InstructorNotDetected,
                    RollcallError::InstructorNotDetected(session.id).to_string(),
                ));
                None
            }
        };

        self.log_unmatched(
            &session,
            &normalized.participants,
            &resolved,
            instructor_index,
            &mut warnings,
            now,
        );

        let mut matched = 0;
        let mut changed = Vec::new();
        for (index, (obs, identity)) in normalized.participants.iter().zip(&resolved).enumerate() {
            if Some(index) == instructor_index {
                continue;
            }
            let Some(identity) = identity else {
                continue;
            };
            matched += 1;

            match self.reconcile_participant(&session, identity, obs, now) {
                Ok((outcome, row_warnings)) => {
                    warnings.extend(row_warnings);
                    match outcome {
                        Reconciled::Changed => changed.push(identity.user_id.clone()),
                        Reconciled::Unchanged => {}
                        Reconciled::Stale => warnings.push(
                            SubmissionWarning::new(
                                WarningSeverity::Warn,
                                WarningCode::StaleUpdate,
                                "record changed concurrently; update skipped",
                            )
                            .for_participant(&obs.name),
                        ),
                    }
                }
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        user_id = %identity.user_id,
                        error = %e,
                        "Failed to reconcile participant"
                    );
                    warnings.push(
                        SubmissionWarning::new(
                            WarningSeverity::Critical,
                            WarningCode::StorageFault,
                            e.to_string(),
                        )
                        .for_participant(&obs.name),
                    );
                }
            }
        }

        if normalized.participants.iter().any(|p| p.join.is_some()) {
            self.store
                .advance_session_status(&session.id, SessionStatus::Active, now)?;
        }

        if mode == IngestMode::Progress {
            self.update_live(&session, &normalized.participants, &resolved, now);
        }

        let session = self.load_session(&session.id)?;
        let mut events = Vec::new();
        let mut finalized = 0;

        if session.meeting_ended && !session.is_finalized() {
            match self.run_finalization(&session.id, FinalizeTrigger::InstructorLeft, now) {
                Ok(outcome) => {
                    finalized = outcome.report.newly_finalized;
                    events.extend(outcome.events);
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Finalization after meeting end failed");
                    warnings.push(SubmissionWarning::new(
                        WarningSeverity::Critical,
                        WarningCode::StorageFault,
                        format!("finalization deferred: {}", e),
                    ));
                }
            }
        } else {
            let records = self.views_for(&session.id, &changed)?;
            match mode {
                IngestMode::Progress => events.push(CoreEvent::AttendanceProgress {
                    session_id: session.id,
                    meet_code: session.meet_code.clone(),
                    records,
                }),
                IngestMode::Submission if !records.is_empty() => {
                    events.push(CoreEvent::AttendanceSaved {
                        session_id: session.id,
                        meet_code: session.meet_code.clone(),
                        transition: None,
                        authoritative: false,
                        records,
                    })
                }
                IngestMode::Submission => {}
            }
        }

        let existing = !registration.created
            && !registration.refined
            && !meeting_just_ended
            && changed.is_empty();

        let session = self.load_session(&session.id)?;
        let receipt = self.receipt(&session, instructor, existing, matched, warnings, finalized)?;

        debug!(
            session_id = %session.id,
            mode = ?mode,
            matched,
            changed = changed.len(),
            finalized,
            existing,
            "Submission ingested"
        );

        Ok(IngestOutcome { receipt, events })
    }

    fn resolve_subject(
        &self,
        normalized: &NormalizedSubmission,
        warnings: &mut Vec<SubmissionWarning>,
    ) -> Option<Subject> {
        if let Some(id) = &normalized.subject_id {
            if let Some(subject) = self.directory.subject(id) {
                return Some(subject);
            }
            warnings.push(SubmissionWarning::new(
                WarningSeverity::Warn,
                WarningCode::PlaceholderSession,
                RollcallError::SubjectNotFound(id.clone()).to_string(),
            ));
        }
        self.directory.subject_for_meet_code(&normalized.meet_code)
    }

    /// Token gate for a submission. The token must belong to this session
    /// and is consumed by the first accepted submission.
    fn authorize(
        &self,
        token: &str,
        session: &SessionRecord,
        client: &str,
        now: DateTime<Local>,
    ) -> Result<()> {
        let checked = self.tokens.check(token, now)?;
        if checked.session_id != session.id {
            return Err(RollcallError::TokenMismatch(format!(
                "token belongs to session {}, submission is for {}",
                checked.session_id, session.id
            )));
        }
        self.tokens.consume(token, client, now)?;
        Ok(())
    }

    /// Record the instructor's join and leave. Returns true if this call
    /// marked the meeting ended.
    fn record_instructor(
        &self,
        session: &SessionRecord,
        obs: &Observation,
        now: DateTime<Local>,
    ) -> Result<bool> {
        if let Some(join) = obs.join
            && session.instructor_join.is_none_or(|known| join < known)
        {
            let late = join > session.fields.start_time;
            self.store.set_instructor_join(&session.id, join, late, now)?;
            if late {
                debug!(session_id = %session.id, join = %join, "Instructor joined late");
            }
        }

        let Some(leave) = obs.leave.filter(|leave| obs.join.is_none_or(|join| *leave > join))
        else {
            return Ok(false);
        };

        if !self.store.mark_meeting_ended(&session.id, leave, now)? {
            return Ok(false);
        }

        info!(
            session_id = %session.id,
            meet_code = %session.meet_code,
            instructor_leave = %leave,
            "Meeting ended"
        );
        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::MeetingEnded {
            session_id: session.id,
            instructor_leave: leave,
        }));
        Ok(true)
    }

    fn log_unmatched(
        &self,
        session: &SessionRecord,
        participants: &[Observation],
        resolved: &[Option<ResolvedIdentity>],
        instructor_index: Option<usize>,
        warnings: &mut Vec<SubmissionWarning>,
        now: DateTime<Local>,
    ) {
        let mut seen = HashSet::new();
        let names: Vec<String> = participants
            .iter()
            .zip(resolved)
            .enumerate()
            .filter(|(i, (_, identity))| Some(*i) != instructor_index && identity.is_none())
            .map(|(_, (obs, _))| obs.name.clone())
            .filter(|name| seen.insert(name.clone()))
            .collect();

        if names.is_empty() {
            return;
        }

        for name in &names {
            warnings.push(
                SubmissionWarning::new(
                    WarningSeverity::Warn,
                    WarningCode::IdentityUnresolved,
                    RollcallError::IdentityUnresolved(name.clone()).to_string(),
                )
                .for_participant(name),
            );
        }

        if let Err(e) = self.store.push_unmatched(
            &session.id,
            &names,
            self.settings.unmatched_log_capacity,
            now,
        ) {
            warn!(session_id = %session.id, error = %e, "Failed to record unmatched names");
        }
        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::ParticipantsUnmatched {
            session_id: session.id,
            names,
        }));
    }

    /// Fold one observation into the user's record with a guarded write,
    /// re-reading and retrying when a concurrent writer got there first.
    fn reconcile_participant(
        &self,
        session: &SessionRecord,
        identity: &ResolvedIdentity,
        obs: &Observation,
        now: DateTime<Local>,
    ) -> Result<(Reconciled, Vec<SubmissionWarning>)> {
        if self
            .store
            .get_participant(&session.id, &identity.user_id)?
            .is_none()
        {
            let fresh = ParticipantRecord::baseline(
                session.id,
                identity.user_id.clone(),
                identity.display_name.clone(),
                identity.student_id.clone(),
                now,
            );
            self.store.insert_participant_if_absent(&fresh)?;
        }

        let mut row_warnings = Vec::new();
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get_participant(&session.id, &identity.user_id)?
                .ok_or_else(|| {
                    RollcallError::internal(format!("record for {} vanished", identity.user_id))
                })?;
            if current.finalized {
                return Ok((Reconciled::Unchanged, row_warnings));
            }

            let mut next = current.clone();
            row_warnings = apply_observation(&mut next, obs);
            if next.has_joined() {
                let verdict = evaluate(session, &next, self.settings.tardy_fraction);
                next.is_tardy = verdict.is_tardy;
                next.time_to_enter_secs = verdict.time_to_enter_secs;
                next.status = AttendanceStatus::Pending;
                if next.pending_since.is_none() {
                    next.pending_since = Some(now);
                }
            }

            if next == current {
                return Ok((Reconciled::Unchanged, row_warnings));
            }
            next.updated_at = now;

            if self.store.advance_participant(&next)? {
                return Ok((Reconciled::Changed, row_warnings));
            }
            debug!(
                session_id = %session.id,
                user_id = %identity.user_id,
                attempt,
                "Guarded write lost; retrying"
            );
        }

        Ok((Reconciled::Stale, row_warnings))
    }

    fn update_live(
        &self,
        session: &SessionRecord,
        participants: &[Observation],
        resolved: &[Option<ResolvedIdentity>],
        now: DateTime<Local>,
    ) {
        let live = participants
            .iter()
            .zip(resolved)
            .map(|(obs, identity)| LiveParticipant {
                display_name: identity
                    .as_ref()
                    .map(|i| i.display_name.clone())
                    .unwrap_or_else(|| obs.name.clone()),
                user_id: identity.as_ref().map(|i| i.user_id.clone()),
                in_meeting: match (obs.join, obs.leave) {
                    (_, None) => true,
                    (Some(join), Some(leave)) => join > leave,
                    (None, Some(_)) => false,
                },
                joined_at: obs.join,
                seen_at: now,
            })
            .collect();
        self.caches.live.put(session.id, live);
    }

    /// Finalize a session on request. Without `force` this only succeeds once
    /// the meeting has ended or timed out.
    pub fn finalize(
        &self,
        session_id: &SessionId,
        force: bool,
        now: DateTime<Local>,
    ) -> Result<FinalizeOutcome> {
        let session = self.load_session(session_id)?;

        let trigger = if session.meeting_ended {
            FinalizeTrigger::InstructorLeft
        } else if self.timed_out(&session, now) {
            FinalizeTrigger::Timeout
        } else if force || session.is_finalized() {
            FinalizeTrigger::Manual
        } else {
            return Err(RollcallError::validation(format!(
                "session {} is still in progress; use force to finalize early",
                session.id
            )));
        };

        self.run_finalization(session_id, trigger, now)
    }

    fn timed_out(&self, session: &SessionRecord, now: DateTime<Local>) -> bool {
        !session.meeting_ended
            && now > session.fields.end_time + crate::span(self.settings.finalize_timeout)
    }

    fn run_finalization(
        &self,
        session_id: &SessionId,
        trigger: FinalizeTrigger,
        now: DateTime<Local>,
    ) -> Result<FinalizeOutcome> {
        let Finalization {
            report,
            leaving,
            finalized,
            session,
        } = self.finalizer.finalize(session_id, trigger, now)?;

        let mut events = Vec::new();
        if report.newly_finalized > 0 {
            self.caches.live.remove(&session.id);
            events.push(CoreEvent::AttendanceSaved {
                session_id: session.id,
                meet_code: session.meet_code.clone(),
                transition: Some(StatusTransition::Leaving),
                authoritative: false,
                records: leaving,
            });
            events.push(CoreEvent::AttendanceSaved {
                session_id: session.id,
                meet_code: session.meet_code.clone(),
                transition: Some(StatusTransition::Finalized),
                authoritative: true,
                records: finalized,
            });
            events.push(CoreEvent::MeetingEnded {
                session_id: session.id,
                meet_code: session.meet_code.clone(),
                trigger,
                instructor_leave: session.instructor_leave,
                finalized: report.newly_finalized,
            });
        }

        Ok(FinalizeOutcome { report, events })
    }

    /// Periodic pass: finalize sessions whose meeting ended (recovery after a
    /// partial pass) or that timed out, and sweep the caches.
    pub fn tick(&self, now: DateTime<Local>) -> Vec<CoreEvent> {
        let mut events = Vec::new();

        let sessions = match self.store.list_open_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to list open sessions");
                return events;
            }
        };

        for session in sessions {
            let trigger = if session.meeting_ended {
                FinalizeTrigger::InstructorLeft
            } else if self.timed_out(&session, now) {
                FinalizeTrigger::Timeout
            } else {
                continue;
            };

            debug!(
                session_id = %session.id,
                trigger = ?trigger,
                last_activity = ?self.caches.activity.get(&session.meet_code),
                "Finalizing from tick"
            );
            match self.run_finalization(&session.id, trigger, now) {
                Ok(outcome) => events.extend(outcome.events),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Tick finalization failed");
                }
            }
        }

        let swept = self.caches.live.sweep() + self.caches.activity.sweep();
        if swept > 0 {
            debug!(swept, "Cache entries expired");
        }

        events
    }

    /// Issue (or reuse) the user's token for today's session of the subject
    pub fn request_token(
        &self,
        user_id: &UserId,
        subject_id: &SubjectId,
        now: DateTime<Local>,
    ) -> Result<TokenGrant> {
        let subject = self
            .directory
            .subject(subject_id)
            .ok_or_else(|| RollcallError::SubjectNotFound(subject_id.clone()))?;

        if !subject.is_enrolled(user_id) {
            return Err(RollcallError::permission(format!(
                "{} is not enrolled in {}",
                user_id, subject_id
            )));
        }

        let meet_code = subject.meet_code.clone().ok_or_else(|| {
            RollcallError::validation(format!("subject {} has no meet code", subject_id))
        })?;

        let day = now.date_naive();
        let proposed = propose_fields(Some(&subject), day, None, None, None, None, now);
        let registration =
            self.registrar
                .ensure_session(&meet_code, day, &proposed, &subject.roster, now)?;
        let session = registration.session;

        if session.is_finalized() {
            return Err(RollcallError::validation(format!(
                "session {} is already finalized",
                session.id
            )));
        }

        let token = self.tokens.get_or_create(&session, user_id, now)?;
        Ok(TokenGrant {
            token: token.token,
            session_id: token.session_id,
            valid_from: token.valid_from,
            expires_at: token.expires_at,
        })
    }

    /// Consume a token outside of a submission
    pub fn consume_token(
        &self,
        token: &str,
        client: &str,
        now: DateTime<Local>,
    ) -> Result<TokenConsumed> {
        let record = self.tokens.consume(token, client, now)?;
        Ok(TokenConsumed {
            session_id: record.session_id,
            user_id: record.user_id,
            consumed_at: now,
        })
    }

    /// Administrative change of a finalized record
    pub fn override_status(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        status: AttendanceStatus,
        excused: bool,
        by: &str,
        now: DateTime<Local>,
    ) -> Result<ParticipantRecordView> {
        if status == AttendanceStatus::Pending {
            return Err(RollcallError::validation("cannot override to pending"));
        }

        let session = self.load_session(session_id)?;
        let record = self
            .store
            .get_participant(&session.id, user_id)?
            .ok_or_else(|| RollcallError::IdentityUnresolved(user_id.to_string()))?;

        if !record.finalized {
            return Err(RollcallError::validation(format!(
                "record for {} is not finalized yet",
                user_id
            )));
        }

        if !self
            .store
            .override_participant(&session.id, user_id, status, excused, by, now)?
        {
            return Err(RollcallError::validation(format!(
                "record for {} could not be overridden",
                user_id
            )));
        }

        info!(
            session_id = %session.id,
            user_id = %user_id,
            status = status.as_str(),
            excused,
            by,
            "Attendance status overridden"
        );
        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::StatusOverridden {
            session_id: session.id,
            user_id: user_id.clone(),
            status,
            excused,
            by: by.to_string(),
        }));

        let record = self
            .store
            .get_participant(&session.id, user_id)?
            .ok_or_else(|| RollcallError::IdentityUnresolved(user_id.to_string()))?;
        Ok(record_view(&record))
    }

    pub fn session_view(&self, session_id: &SessionId) -> Result<SessionView> {
        let session = self.load_session(session_id)?;
        self.build_session_view(session)
    }

    pub fn find_session(&self, meet_code: &str, day: NaiveDate) -> Result<SessionView> {
        let code = MeetCode::parse(meet_code)
            .ok_or_else(|| RollcallError::validation(format!("invalid meet code '{}'", meet_code)))?;
        let session = self
            .store
            .find_session(&code, day)?
            .ok_or_else(|| RollcallError::SessionNotFound(format!("{} on {}", code, day)))?;
        self.build_session_view(session)
    }

    pub fn live_participants(&self, session_id: &SessionId) -> Vec<LiveParticipant> {
        self.caches.live.get(session_id).unwrap_or_default()
    }

    pub fn last_activity(&self, meet_code: &MeetCode) -> Option<DateTime<Local>> {
        self.caches.activity.get(meet_code)
    }

    pub fn health(&self) -> HealthStatus {
        let store_ok = self.store.is_healthy();
        let open_sessions = self
            .store
            .list_open_sessions()
            .map(|s| s.len())
            .unwrap_or(0);
        HealthStatus {
            live: true,
            ready: store_ok,
            store_ok,
            subject_count: self.directory.subject_count(),
            open_sessions,
        }
    }

    /// Record service shutdown in the audit log
    pub fn notify_shutdown(&self) {
        let _ = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped));
    }

    fn load_session(&self, id: &SessionId) -> Result<SessionRecord> {
        self.store
            .get_session(id)?
            .ok_or_else(|| RollcallError::SessionNotFound(id.to_string()))
    }

    fn views_for(&self, session_id: &SessionId, users: &[UserId]) -> Result<Vec<ParticipantRecordView>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .list_participants(session_id)?
            .iter()
            .filter(|r| users.contains(&r.user_id))
            .map(record_view)
            .collect())
    }

    fn receipt(
        &self,
        session: &SessionRecord,
        instructor: Option<InstructorView>,
        existing: bool,
        matched: usize,
        warnings: Vec<SubmissionWarning>,
        finalized: usize,
    ) -> Result<SubmissionReceipt> {
        let records = self
            .store
            .list_participants(&session.id)?
            .iter()
            .map(record_view)
            .collect();

        // First warning of the highest severity
        let summary = warnings
            .iter()
            .rev()
            .max_by_key(|w| w.severity)
            .map(|w| w.message.clone());

        Ok(SubmissionReceipt {
            session_id: session.id,
            meet_code: session.meet_code.clone(),
            day: session.day,
            existing,
            session_status: session.status,
            meeting_ended: session.meeting_ended,
            instructor,
            records,
            matched,
            warnings,
            summary,
            finalized,
        })
    }

    fn build_session_view(&self, session: SessionRecord) -> Result<SessionView> {
        let participants = self
            .store
            .list_participants(&session.id)?
            .iter()
            .map(record_view)
            .collect();

        Ok(SessionView {
            session_id: session.id,
            meet_code: session.meet_code,
            day: session.day,
            subject_id: session.fields.subject_id,
            placeholder: session.fields.is_placeholder,
            status: session.status,
            start_time: session.fields.start_time,
            end_time: session.fields.end_time,
            first_third_threshold: session.fields.first_third,
            grace_period: session.fields.grace_period,
            instructor_join_time: session.instructor_join,
            instructor_leave_time: session.instructor_leave,
            instructor_late: session.instructor_late,
            meeting_ended: session.meeting_ended,
            finalized_at: session.finalized_at,
            unmatched: session.unmatched,
            participants,
        })
    }
}
