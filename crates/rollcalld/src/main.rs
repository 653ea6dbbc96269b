//! rollcalld - The rollcall background service
//!
//! This is the main entry point for the rollcalld service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Reconciliation engine
//! - IPC server
//! - Periodic finalization tick

use anyhow::{Context, Result};
use clap::Parser;
use rollcall_api::{
    AttendanceUpdate, ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload,
    MeetingEnded, Response, ResponsePayload, UpdateKind,
};
use rollcall_config::load_config;
use rollcall_core::{CoreEngine, CoreEvent, EngineCaches};
use rollcall_ipc::{IpcServer, ServerMessage};
use rollcall_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use rollcall_util::{default_config_path, ClientId, RollcallError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// rollcalld - Attendance reconciliation service for online classes
#[derive(Parser, Debug)]
#[command(name = "rollcalld")]
#[command(about = "Attendance reconciliation service for online classes", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/rollcall/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set ROLLCALL_SOCKET env var)
    #[arg(short, long, env = "ROLLCALL_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set ROLLCALL_DATA_DIR env var)
    #[arg(short, long, env = "ROLLCALL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Main service state
struct Service {
    engine: Arc<CoreEngine>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
    tick_interval: Duration,
    republish_delay: Duration,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let policy = load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            subject_count = policy.subjects.len(),
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| policy.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| policy.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join("rollcalld.db");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let tick_interval = policy.engine.tick_interval;
        let republish_delay = policy.engine.finalized_republish_delay;
        let caches = EngineCaches::from_settings(&policy.engine);
        let engine = Arc::new(CoreEngine::new(policy, store.clone(), caches));

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            engine,
            ipc: Arc::new(ipc),
            store,
            tick_interval,
            republish_delay,
        })
    }

    async fn run(self) -> Result<()> {
        let ipc = self.ipc.clone();
        let mut ipc_messages = ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let ipc_accept = ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

        let mut tick_timer = tokio::time::interval(self.tick_interval);
        tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            tick_interval = ?self.tick_interval,
            "Service running"
        );

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }

                // Finalize ended or timed-out sessions
                _ = tick_timer.tick() => {
                    let engine = self.engine.clone();
                    let now = rollcall_util::now();
                    match tokio::task::spawn_blocking(move || engine.tick(now)).await {
                        Ok(events) => publish(&ipc, events, self.republish_delay),
                        Err(e) => error!(error = %e, "Tick task failed"),
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    self.handle_ipc_message(msg);
                }
            }
        }

        info!("Shutting down rollcalld");

        ipc.broadcast_event(Event::new(EventPayload::Shutdown));
        self.engine.notify_shutdown();

        info!("Shutdown complete");
        Ok(())
    }

    fn handle_ipc_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let engine = self.engine.clone();
                let ipc = self.ipc.clone();
                let delay = self.republish_delay;

                // Requests run concurrently; the engine serializes nothing itself
                tokio::spawn(async move {
                    let role = ipc
                        .get_client_info(&client_id)
                        .await
                        .map(|info| info.role)
                        .unwrap_or(ClientRole::Reporter);

                    let response = handle_command(
                        &engine,
                        &ipc,
                        &client_id,
                        role,
                        request.request_id,
                        request.command,
                        delay,
                    )
                    .await;

                    if let Err(e) = ipc.send_response(&client_id, response).await {
                        debug!(client_id = %client_id, error = %e, "Failed to send response");
                    }
                });
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = self
                    .store
                    .append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                        client_id: client_id.to_string(),
                        role: format!("{:?}", info.role),
                        uid: info.uid,
                    }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self
                    .store
                    .append_audit(AuditEvent::new(AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    }));
            }
        }
    }
}

/// Commands a role may not issue
fn check_permission(role: ClientRole, command: &Command) -> Option<ErrorInfo> {
    let allowed = match command {
        Command::SubmitAttendance { .. }
        | Command::ReportProgress { .. }
        | Command::RequestToken { .. }
        | Command::ConsumeToken { .. } => role.can_submit(),
        Command::FinalizeSession { force: true, .. } => role.can_force_finalize(),
        Command::OverrideStatus { .. } => role.can_override(),
        _ => true,
    };

    if allowed {
        None
    } else {
        Some(ErrorInfo::new(
            ErrorCode::PermissionDenied,
            "Admin role required",
        ))
    }
}

fn error_response(request_id: u64, err: &RollcallError) -> Response {
    Response::error(request_id, ErrorInfo::from(err))
}

/// Run a blocking engine call off the async runtime
async fn blocking<T, F>(engine: &Arc<CoreEngine>, f: F) -> rollcall_util::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CoreEngine) -> rollcall_util::Result<T> + Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| RollcallError::internal(format!("engine task failed: {}", e)))?
}

async fn handle_command(
    engine: &Arc<CoreEngine>,
    ipc: &Arc<IpcServer>,
    client_id: &ClientId,
    role: ClientRole,
    request_id: u64,
    command: Command,
    republish_delay: Duration,
) -> Response {
    if let Some(denied) = check_permission(role, &command) {
        warn!(client_id = %client_id, role = ?role, "Permission denied");
        return Response::error(request_id, denied);
    }

    let now = rollcall_util::now();
    let client = client_id.to_string();

    match command {
        Command::SubmitAttendance { submission } => {
            match blocking(engine, move |e| e.submit(&submission, &client, now)).await {
                Ok(outcome) => {
                    publish(ipc, outcome.events, republish_delay);
                    Response::success(request_id, ResponsePayload::Receipt(outcome.receipt))
                }
                Err(e) => {
                    debug!(error = %e, "Submission rejected");
                    error_response(request_id, &e)
                }
            }
        }

        Command::ReportProgress { submission } => {
            match blocking(engine, move |e| e.report_progress(&submission, &client, now)).await {
                Ok(outcome) => {
                    publish(ipc, outcome.events, republish_delay);
                    Response::success(request_id, ResponsePayload::Receipt(outcome.receipt))
                }
                Err(e) => error_response(request_id, &e),
            }
        }

        Command::FinalizeSession { session_id, force } => {
            match blocking(engine, move |e| e.finalize(&session_id, force, now)).await {
                Ok(outcome) => {
                    publish(ipc, outcome.events, republish_delay);
                    Response::success(request_id, ResponsePayload::Finalized(outcome.report))
                }
                Err(e) => error_response(request_id, &e),
            }
        }

        Command::RequestToken {
            user_id,
            subject_id,
        } => match blocking(engine, move |e| e.request_token(&user_id, &subject_id, now)).await {
            Ok(grant) => Response::success(request_id, ResponsePayload::Token(grant)),
            Err(e) => error_response(request_id, &e),
        },

        Command::ConsumeToken { token } => {
            match blocking(engine, move |e| e.consume_token(&token, &client, now)).await {
                Ok(consumed) => {
                    Response::success(request_id, ResponsePayload::TokenConsumed(consumed))
                }
                Err(e) => error_response(request_id, &e),
            }
        }

        Command::GetSession { session_id } => {
            match blocking(engine, move |e| e.session_view(&session_id)).await {
                Ok(view) => Response::success(request_id, ResponsePayload::Session(view)),
                Err(e) => error_response(request_id, &e),
            }
        }

        Command::FindSession { meet_code, day } => {
            match blocking(engine, move |e| e.find_session(&meet_code, day)).await {
                Ok(view) => Response::success(request_id, ResponsePayload::Session(view)),
                Err(e) => error_response(request_id, &e),
            }
        }

        Command::LiveParticipants { session_id } => {
            let participants = engine.live_participants(&session_id);
            Response::success(
                request_id,
                ResponsePayload::LiveParticipants { participants },
            )
        }

        Command::OverrideStatus {
            session_id,
            user_id,
            status,
            excused,
        } => {
            let by = format!("{}:{:?}", client, role);
            match blocking(engine, move |e| {
                e.override_status(&session_id, &user_id, status, excused, &by, now)
            })
            .await
            {
                Ok(view) => Response::success(request_id, ResponsePayload::Overridden(view)),
                Err(e) => error_response(request_id, &e),
            }
        }

        Command::SubscribeEvents => Response::success(
            request_id,
            ResponsePayload::Subscribed {
                client_id: client_id.clone(),
            },
        ),

        Command::UnsubscribeEvents => Response::success(request_id, ResponsePayload::Unsubscribed),

        Command::GetHealth => match blocking(engine, |e| Ok(e.health())).await {
            Ok(health) => Response::success(request_id, ResponsePayload::Health(health)),
            Err(e) => error_response(request_id, &e),
        },

        Command::Ping => Response::success(request_id, ResponsePayload::Pong),
    }
}

/// Outbound event for a core event
fn to_event(event: CoreEvent) -> Event {
    let payload = match event {
        CoreEvent::AttendanceSaved {
            session_id,
            meet_code,
            transition,
            authoritative,
            records,
        } => EventPayload::AttendanceUpdate(AttendanceUpdate {
            kind: UpdateKind::AttendanceSaved,
            session_id,
            meet_code,
            status_transition: transition,
            authoritative,
            records,
        }),
        CoreEvent::AttendanceProgress {
            session_id,
            meet_code,
            records,
        } => EventPayload::AttendanceUpdate(AttendanceUpdate {
            kind: UpdateKind::AttendanceProgress,
            session_id,
            meet_code,
            status_transition: None,
            authoritative: false,
            records,
        }),
        CoreEvent::MeetingEnded {
            session_id,
            meet_code,
            trigger,
            instructor_leave,
            finalized,
        } => EventPayload::MeetingEnded(MeetingEnded {
            session_id,
            meet_code,
            trigger,
            instructor_leave_time: instructor_leave,
            finalized,
        }),
    };
    Event::new(payload)
}

/// Broadcast events in order. Finalized snapshots go out a second time after
/// `republish_delay` for subscribers that missed the first copy.
fn publish(ipc: &Arc<IpcServer>, events: Vec<CoreEvent>, republish_delay: Duration) {
    for event in events {
        let repeat = event.is_finalized_snapshot();
        let event = to_event(event);

        if repeat && !republish_delay.is_zero() {
            let ipc = ipc.clone();
            let again = event.clone();
            tokio::spawn(async move {
                tokio::time::sleep(republish_delay).await;
                ipc.broadcast_event(Event::new(again.payload));
            });
        }

        ipc.broadcast_event(event);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let service = Service::new(&args).await?;
    service.run().await
}
