use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use solenoid_common::{
    ActuatorId, ButtonId, ClockView, ConfigStore, ControllerEngine, ControllerError,
    ControllerStatus, DateTimeRequest, EngineAction, LoadSource, OutputState, RuntimeConfig,
    SettingsModel, SettingsUpdate, SettingsUpdateResponse, SettingsView, SoftClock, StoreError,
    ToggleResponse, ACTUATOR_COUNT, BUTTON_COUNT,
};

const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<Command>,
}

/// Requests from the remote interface. They are serviced by the control
/// loop between ticks, never from the HTTP task itself.
enum Command {
    GetSettings(oneshot::Sender<SettingsView>),
    UpdateSettings(
        SettingsUpdate,
        oneshot::Sender<Result<(bool, SettingsView), ControllerError>>,
    ),
    Toggle(
        u8,
        oneshot::Sender<Result<(ActuatorId, OutputState), ControllerError>>,
    ),
    Status(oneshot::Sender<ControllerStatus>),
    GetClock(oneshot::Sender<ClockView>),
    SetClock(
        DateTimeRequest,
        oneshot::Sender<Result<ClockView, ControllerError>>,
    ),
    SetButton(u8, bool, oneshot::Sender<Result<(), ControllerError>>),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    error: String,
}

#[derive(Debug, Deserialize)]
struct ButtonLineUpdate {
    pressed: bool,
}

#[derive(Debug, Serialize)]
struct ButtonLineView {
    id: u8,
    pressed: bool,
}

struct FileStore {
    path: PathBuf,
}

/// Owns the engine plus the simulated I/O lines around it.
struct Driver<S> {
    engine: ControllerEngine<S>,
    clock: SoftClock,
    inputs: [bool; BUTTON_COUNT],
    outputs: [bool; ACTUATOR_COUNT],
    access_point_active: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = RuntimeConfig::default();
    let store = FileStore::from_env();
    info!("settings record at {}", store.path.display());

    let engine = ControllerEngine::new(runtime.controller.clone(), SettingsModel::new(store));
    let mut driver = Driver::new(engine);
    driver.start(monotonic_ms());

    if let Some(now) = system_time_in_zone() {
        driver.clock.set_datetime(now, monotonic_ms());
        info!("wall clock seeded from system time: {}", now);
    } else {
        info!("wall clock not synchronized; schedules stay idle until POST /api/time");
    }

    let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    spawn_control_loop(driver, receiver, runtime.controller.control_tick_ms);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route(
            "/api/settings",
            get(handle_get_settings).post(handle_update_settings),
        )
        .route("/api/actuators/{id}/toggle", post(handle_toggle))
        .route("/api/status", get(handle_get_status))
        .route("/api/time", get(handle_get_time).post(handle_set_time))
        .route("/api/sim/buttons/{id}", put(handle_set_button))
        .fallback_service(ServeDir::new(web_root))
        .with_state(AppState { commands });

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop<S>(mut driver: Driver<S>, mut commands: mpsc::Receiver<Command>, tick_ms: u64)
where
    S: ConfigStore + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            driver.step(now_ms);
            while let Ok(command) = commands.try_recv() {
                driver.service(command, now_ms);
            }
        }
    });
}

impl<S: ConfigStore> Driver<S> {
    fn new(engine: ControllerEngine<S>) -> Self {
        Self {
            engine,
            clock: SoftClock::new(),
            inputs: [true; BUTTON_COUNT],
            outputs: [false; ACTUATOR_COUNT],
            access_point_active: false,
        }
    }

    fn start(&mut self, now_ms: u64) {
        let (loaded, actions) = self.engine.startup();
        match loaded {
            Ok(LoadSource::Stored) => info!("settings loaded from store"),
            Ok(LoadSource::Defaults) => {
                info!("settings record not initialized; defaults written")
            }
            Err(err) => warn!("failed to load settings, running with defaults: {err}"),
        }
        for view in self.engine.settings_view().actuators {
            info!(
                "actuator {}: on {} min, schedule {:02}:{:02} ({})",
                view.id,
                view.on_time_minutes,
                view.schedule_hour,
                view.schedule_minute,
                if view.schedule_enabled { "enabled" } else { "disabled" },
            );
        }
        self.execute(actions, now_ms);
    }

    fn step(&mut self, now_ms: u64) {
        let wall_clock = self.clock.now(now_ms);
        let actions = self.engine.poll(self.inputs, now_ms, wall_clock.as_ref());
        if !actions.is_empty() {
            self.execute(actions, now_ms);
        }
    }

    fn execute(&mut self, actions: Vec<EngineAction>, now_ms: u64) {
        for action in actions {
            match action {
                EngineAction::OutputOn {
                    id,
                    duration_minutes,
                    source,
                } => {
                    self.outputs[id.index()] = true;
                    info!("actuator {id} turned ON for {duration_minutes} min ({source:?}) at {now_ms}ms");
                }
                EngineAction::OutputOff { id, source } => {
                    if self.outputs[id.index()] {
                        info!("actuator {id} turned OFF ({source:?}) at {now_ms}ms");
                    }
                    self.outputs[id.index()] = false;
                }
                EngineAction::AlreadyActive { id, source } => {
                    info!("actuator {id} already active; {source:?} trigger ignored");
                }
                EngineAction::StartAccessPoint => {
                    if self.access_point_active {
                        info!("access point already active");
                    } else {
                        self.access_point_active = true;
                        info!("access point started (simulated)");
                    }
                }
            }
        }
    }

    fn service(&mut self, command: Command, now_ms: u64) {
        match command {
            Command::GetSettings(reply) => {
                let _ = reply.send(self.engine.settings_view());
            }
            Command::UpdateSettings(update, reply) => {
                let result = match self.engine.update_settings(&update) {
                    Ok(changed) => {
                        if changed {
                            info!("settings updated via remote interface");
                        }
                        Ok((changed, self.engine.settings_view()))
                    }
                    Err(err) => {
                        warn!("settings update rejected: {err}");
                        Err(err)
                    }
                };
                let _ = reply.send(result);
            }
            Command::Toggle(raw_id, reply) => {
                let result = self
                    .engine
                    .toggle_raw(raw_id, now_ms)
                    .map(|(id, state, actions)| {
                        self.execute(actions, now_ms);
                        (id, state)
                    });
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let status = self.engine.status(
                    now_ms,
                    self.clock.formatted(now_ms),
                    self.access_point_active,
                );
                let _ = reply.send(status);
            }
            Command::GetClock(reply) => {
                let _ = reply.send(self.clock_view(now_ms));
            }
            Command::SetClock(request, reply) => {
                let result = self
                    .clock
                    .set(
                        request.year,
                        request.month,
                        request.day,
                        request.hour,
                        request.minute,
                        request.second,
                        now_ms,
                    )
                    .map(|now| {
                        info!("wall clock set to {now}");
                        self.clock_view(now_ms)
                    });
                let _ = reply.send(result);
            }
            Command::SetButton(raw_id, pressed, reply) => {
                let result = ButtonId::from_number(raw_id).map(|button| {
                    self.inputs[button.index()] = !pressed;
                });
                let _ = reply.send(result);
            }
        }
    }

    fn clock_view(&self, now_ms: u64) -> ClockView {
        ClockView {
            status: "success",
            time_synced: self.clock.is_synchronized(),
            time: self.clock.formatted(now_ms),
        }
    }
}

async fn request<T>(
    state: &AppState,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, axum::response::Response> {
    let (reply, response) = oneshot::channel();
    if state.commands.send(build(reply)).await.is_err() {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Control loop is not running",
        ));
    }
    response.await.map_err(|_| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Control loop dropped the request",
        )
    })
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    match request(&state, Command::GetSettings).await {
        Ok(view) => Json(view).into_response(),
        Err(response) => response,
    }
}

async fn handle_update_settings(
    State(state): State<AppState>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(update)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
    };

    match request(&state, |reply| Command::UpdateSettings(update, reply)).await {
        Ok(Ok((changed, settings))) => Json(SettingsUpdateResponse {
            status: "success",
            message: if changed {
                "Settings updated"
            } else {
                "No changes detected"
            },
            settings,
        })
        .into_response(),
        Ok(Err(err)) => controller_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_toggle(State(state): State<AppState>, Path(id): Path<u8>) -> impl IntoResponse {
    match request(&state, |reply| Command::Toggle(id, reply)).await {
        Ok(Ok((id, state))) => Json(ToggleResponse {
            status: "success",
            id,
            state,
            message: format!(
                "Actuator {id} {}",
                if state.is_on() { "activated" } else { "deactivated" }
            ),
        })
        .into_response(),
        Ok(Err(err)) => controller_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    match request(&state, Command::Status).await {
        Ok(status) => Json(status).into_response(),
        Err(response) => response,
    }
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    match request(&state, Command::GetClock).await {
        Ok(view) => Json(view).into_response(),
        Err(response) => response,
    }
}

async fn handle_set_time(
    State(state): State<AppState>,
    payload: Result<Json<DateTimeRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(datetime)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
    };

    match request(&state, |reply| Command::SetClock(datetime, reply)).await {
        Ok(Ok(view)) => Json(view).into_response(),
        Ok(Err(err)) => controller_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_set_button(
    State(state): State<AppState>,
    Path(id): Path<u8>,
    Json(update): Json<ButtonLineUpdate>,
) -> impl IntoResponse {
    match request(&state, |reply| Command::SetButton(id, update.pressed, reply)).await {
        Ok(Ok(())) => Json(ButtonLineView {
            id,
            pressed: update.pressed,
        })
        .into_response(),
        Ok(Err(err)) => controller_error_response(&err),
        Err(response) => response,
    }
}

impl FileStore {
    fn from_env() -> Self {
        let data_dir = std::env::var("SOLENOID_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.solenoid"));

        Self {
            path: data_dir.join("settings.bin"),
        }
    }
}

impl ConfigStore for FileStore {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_record(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

fn system_time_in_zone() -> Option<NaiveDateTime> {
    let timezone = std::env::var("SOLENOID_TIMEZONE").ok()?;
    match timezone.parse::<Tz>() {
        Ok(tz) => Some(Utc::now().with_timezone(&tz).naive_local()),
        Err(_) => {
            warn!("ignoring invalid SOLENOID_TIMEZONE `{timezone}`");
            None
        }
    }
}

fn controller_error_response(err: &ControllerError) -> axum::response::Response {
    match err {
        ControllerError::UnknownActuator(_) | ControllerError::UnknownButton(_) => {
            error_response(StatusCode::NOT_FOUND, &err.to_string())
        }
        ControllerError::InvalidSettings(_) | ControllerError::InvalidDateTime => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        ControllerError::Storage(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        ),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            status: "error",
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
