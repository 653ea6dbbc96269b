//! Command types for the rollcalld protocol

use chrono::NaiveDate;
use rollcall_util::{ClientId, RollcallError, SessionId, SubjectId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    AttendanceStatus, AttendanceSubmission, ClientRole, FinalizeReport, HealthStatus,
    LiveParticipant, ParticipantRecordView, SessionView, SubmissionReceipt, TokenConsumed,
    TokenGrant, API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    /// The caller may retry the same request later
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&RollcallError> for ErrorInfo {
    fn from(err: &RollcallError) -> Self {
        let code = match err {
            RollcallError::Validation(_) => ErrorCode::ValidationFailed,
            RollcallError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RollcallError::SubjectNotFound(_) => ErrorCode::SubjectNotFound,
            RollcallError::IdentityUnresolved(_) => ErrorCode::UserNotFound,
            RollcallError::TokenNotFound
            | RollcallError::TokenAlreadyConsumed
            | RollcallError::TokenExpired
            | RollcallError::TokenNotYetValid
            | RollcallError::TokenMismatch(_) => ErrorCode::TokenRejected,
            RollcallError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            RollcallError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            RollcallError::Config(_) => ErrorCode::ConfigError,
            RollcallError::StorageConflict(_)
            | RollcallError::InstructorNotDetected(_)
            | RollcallError::Store(_)
            | RollcallError::Ipc(_)
            | RollcallError::Internal(_) => ErrorCode::InternalError,
        };
        Self {
            code,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    ValidationFailed,
    SessionNotFound,
    SubjectNotFound,
    UserNotFound,
    TokenRejected,
    PermissionDenied,
    StorageUnavailable,
    ConfigError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Submit a scraped attendance snapshot (consumes the verification token if any)
    SubmitAttendance { submission: AttendanceSubmission },

    /// Report an in-progress snapshot (never consumes tokens)
    ReportProgress { submission: AttendanceSubmission },

    /// Finalize a session now. `force` skips the meeting-ended/timeout check (admin only).
    FinalizeSession {
        session_id: SessionId,
        #[serde(default)]
        force: bool,
    },

    /// Issue (or reuse) a submission token for today's session of a subject
    RequestToken { user_id: UserId, subject_id: SubjectId },

    /// Consume a token exactly once
    ConsumeToken { token: String },

    GetSession { session_id: SessionId },

    FindSession { meet_code: String, day: NaiveDate },

    /// Last known presence from progress pings
    LiveParticipants { session_id: SessionId },

    // Admin commands

    /// Manually set the status of a finalized record (admin only)
    OverrideStatus {
        session_id: SessionId,
        user_id: UserId,
        status: AttendanceStatus,
        #[serde(default)]
        excused: bool,
    },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    /// Get health status
    GetHealth,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Receipt(SubmissionReceipt),
    Finalized(FinalizeReport),
    Token(TokenGrant),
    TokenConsumed(TokenConsumed),
    Session(SessionView),
    LiveParticipants { participants: Vec<LiveParticipant> },
    Overridden(ParticipantRecordView),
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = Request::new(1, Command::Ping);
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.request_id, 1);
        assert!(matches!(parsed.command, Command::Ping));
    }

    #[test]
    fn submit_command_accepts_scraper_payload() {
        let json = r#"{
            "request_id": 7,
            "api_version": 1,
            "command": {
                "type": "submit_attendance",
                "submission": {
                    "meetCode": "abc-defg-hij",
                    "date": "2024-01-01",
                    "participants": [{ "name": "Jane Doe", "joinTime": "10:05:00" }]
                }
            }
        }"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req.command {
            Command::SubmitAttendance { submission } => {
                assert_eq!(submission.meet_code.as_deref(), Some("abc-defg-hij"));
                assert_eq!(submission.participants.map(|p| p.len()), Some(1));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn finalize_force_defaults_to_false() {
        let id = SessionId::new();
        let json = format!(
            r#"{{"type":"finalize_session","session_id":"{}"}}"#,
            id
        );
        let cmd: Command = serde_json::from_str(&json).unwrap();
        assert!(matches!(cmd, Command::FinalizeSession { force: false, .. }));
    }

    #[test]
    fn error_info_carries_retryability() {
        let info = ErrorInfo::from(&RollcallError::unavailable("database is locked"));
        assert_eq!(info.code, ErrorCode::StorageUnavailable);
        assert!(info.retryable);

        let info = ErrorInfo::from(&RollcallError::TokenAlreadyConsumed);
        assert_eq!(info.code, ErrorCode::TokenRejected);
        assert!(!info.retryable);
    }

    #[test]
    fn response_serialization() {
        let resp = Response::success(
            1,
            ResponsePayload::Health(HealthStatus {
                live: true,
                ready: true,
                store_ok: true,
                subject_count: 2,
                open_sessions: 0,
            }),
        );

        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.request_id, 1);
        assert!(matches!(
            parsed.result,
            ResponseResult::Ok(ResponsePayload::Health(_))
        ));
    }
}
