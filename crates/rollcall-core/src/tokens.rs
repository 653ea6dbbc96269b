//! Submission tokens
//!
//! One live token per (session, user). A token is valid from `lead` before
//! the scheduled start until `grace` after the scheduled end and can be
//! consumed exactly once.

use chrono::{DateTime, Local};
use rollcall_store::{AuditEvent, AuditEventType, SessionRecord, Store, StoreError, TokenRecord};
use rollcall_util::{Result, RollcallError, SessionId, UserId};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct TokenManager {
    store: Arc<dyn Store>,
    lead: chrono::Duration,
    grace: chrono::Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn Store>, lead: chrono::Duration, grace: chrono::Duration) -> Self {
        Self { store, lead, grace }
    }

    /// Return the user's usable token for the session, issuing a fresh one
    /// if there is none or the stored one is consumed or expired.
    pub fn get_or_create(
        &self,
        session: &SessionRecord,
        user_id: &UserId,
        now: DateTime<Local>,
    ) -> Result<TokenRecord> {
        // Second pass only after losing an insert race
        for _ in 0..2 {
            if let Some(existing) = self.store.find_token_for(&session.id, user_id)? {
                if existing.is_usable_at(now) {
                    return Ok(existing);
                }
                debug!(session_id = %session.id, user_id = %user_id, "Replacing stale token");
                self.store.delete_token(&existing.token)?;
            }

            let record = TokenRecord {
                token: Uuid::new_v4().simple().to_string(),
                session_id: session.id,
                user_id: user_id.clone(),
                subject_id: session.fields.subject_id.clone(),
                valid_from: session.fields.start_time - self.lead,
                expires_at: session.fields.end_time + self.grace,
                consumed: false,
                consumed_at: None,
                consumed_by: None,
                created_at: now,
            };

            match self.store.insert_token(&record) {
                Ok(()) => {
                    info!(session_id = %session.id, user_id = %user_id, "Token issued");
                    let _ = self.store.append_audit(AuditEvent::new(AuditEventType::TokenIssued {
                        session_id: session.id,
                        user_id: user_id.clone(),
                    }));
                    return Ok(record);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.store
            .find_token_for(&session.id, user_id)?
            .filter(|t| t.is_usable_at(now))
            .ok_or_else(|| {
                RollcallError::StorageConflict(format!(
                    "token for {} in session {} kept changing",
                    user_id, session.id
                ))
            })
    }

    /// Check a token without consuming it
    pub fn check(&self, token: &str, now: DateTime<Local>) -> Result<TokenRecord> {
        let record = self
            .store
            .find_token(token)?
            .ok_or(RollcallError::TokenNotFound)?;

        if record.consumed {
            return Err(RollcallError::TokenAlreadyConsumed);
        }
        if now < record.valid_from {
            return Err(RollcallError::TokenNotYetValid);
        }
        if now > record.expires_at {
            return Err(RollcallError::TokenExpired);
        }
        Ok(record)
    }

    /// Consume a token. Exactly one caller wins; the rest see `TokenAlreadyConsumed`.
    pub fn consume(&self, token: &str, by: &str, now: DateTime<Local>) -> Result<TokenRecord> {
        let mut record = self.check(token, now)?;

        if !self.store.consume_token(token, by, now)? {
            return Err(RollcallError::TokenAlreadyConsumed);
        }

        record.consumed = true;
        record.consumed_at = Some(now);
        record.consumed_by = Some(by.to_string());

        info!(session_id = %record.session_id, user_id = %record.user_id, "Token consumed");
        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::TokenConsumed {
            session_id: record.session_id,
            user_id: record.user_id.clone(),
        }));
        Ok(record)
    }

    /// Invalidate every token of a finalized session
    pub fn expire_for_session(&self, session_id: &SessionId, now: DateTime<Local>) -> Result<usize> {
        let count = self.store.expire_tokens_for_session(session_id, now)?;
        if count > 0 {
            let _ = self.store.append_audit(AuditEvent::new(AuditEventType::TokensExpired {
                session_id: *session_id,
                count,
            }));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rollcall_store::{SessionFields, SqliteStore};
    use rollcall_util::MeetCode;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn setup() -> (Arc<dyn Store>, TokenManager, SessionRecord) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let session = SessionRecord::new(
            MeetCode::parse("abc-defg-hij").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            SessionFields {
                subject_id: None,
                is_placeholder: false,
                start_time: at(10, 0, 0),
                end_time: at(11, 0, 0),
                first_third: at(10, 20, 0),
                grace_period: false,
            },
            at(9, 0, 0),
        );
        store.insert_session(&session).unwrap();
        let tokens = TokenManager::new(
            store.clone(),
            chrono::Duration::minutes(15),
            chrono::Duration::minutes(30),
        );
        (store, tokens, session)
    }

    #[test]
    fn usable_token_is_reused() {
        let (_, tokens, session) = setup();
        let user = UserId::new("stu-1");

        let first = tokens.get_or_create(&session, &user, at(9, 50, 0)).unwrap();
        assert_eq!(first.valid_from, at(9, 45, 0));
        assert_eq!(first.expires_at, at(11, 30, 0));
        assert_eq!(first.token.len(), 32);

        let second = tokens.get_or_create(&session, &user, at(9, 55, 0)).unwrap();
        assert_eq!(first.token, second.token);
    }

    #[test]
    fn consumed_token_is_replaced() {
        let (_, tokens, session) = setup();
        let user = UserId::new("stu-1");

        let first = tokens.get_or_create(&session, &user, at(9, 50, 0)).unwrap();
        tokens.consume(&first.token, "client-1", at(10, 5, 0)).unwrap();

        let second = tokens.get_or_create(&session, &user, at(10, 6, 0)).unwrap();
        assert_ne!(first.token, second.token);
        assert!(matches!(tokens.check(&first.token, at(10, 6, 0)), Err(RollcallError::TokenNotFound)));
    }

    #[test]
    fn consume_exactly_once() {
        let (_, tokens, session) = setup();
        let t = tokens
            .get_or_create(&session, &UserId::new("stu-1"), at(9, 50, 0))
            .unwrap();

        let consumed = tokens.consume(&t.token, "client-1", at(10, 5, 0)).unwrap();
        assert!(consumed.consumed);
        assert_eq!(consumed.consumed_by.as_deref(), Some("client-1"));

        assert!(matches!(
            tokens.consume(&t.token, "client-2", at(10, 6, 0)),
            Err(RollcallError::TokenAlreadyConsumed)
        ));
    }

    #[test]
    fn validity_window() {
        let (_, tokens, session) = setup();
        let t = tokens
            .get_or_create(&session, &UserId::new("stu-1"), at(9, 0, 0))
            .unwrap();

        assert!(matches!(tokens.check(&t.token, at(9, 30, 0)), Err(RollcallError::TokenNotYetValid)));
        assert!(matches!(tokens.check(&t.token, at(11, 31, 0)), Err(RollcallError::TokenExpired)));
        assert!(tokens.check(&t.token, at(10, 0, 0)).is_ok());
        assert!(matches!(tokens.check("nope", at(10, 0, 0)), Err(RollcallError::TokenNotFound)));
    }

    #[test]
    fn expire_for_session_removes_tokens() {
        let (_, tokens, session) = setup();
        let t = tokens
            .get_or_create(&session, &UserId::new("stu-1"), at(9, 50, 0))
            .unwrap();
        tokens
            .get_or_create(&session, &UserId::new("stu-2"), at(9, 50, 0))
            .unwrap();

        assert_eq!(tokens.expire_for_session(&session.id, at(11, 5, 0)).unwrap(), 2);
        assert!(matches!(tokens.check(&t.token, at(11, 5, 0)), Err(RollcallError::TokenNotFound)));
    }
}
