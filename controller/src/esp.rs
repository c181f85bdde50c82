use core::convert::TryInto;
use std::{
    ffi::CString,
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use solenoid_common::{
    ActuatorId, ClockView, ConfigStore, ControllerEngine, ControllerError, ControllerStatus,
    DateTimeRequest, EngineAction, LoadSource, NetworkConfig, OutputState, RuntimeConfig,
    SettingsModel, SettingsUpdate, SettingsUpdateResponse, SettingsView, SoftClock, StoreError,
    ToggleResponse, ACTUATOR_COUNT, BUTTON_COUNT,
};

const NVS_NAMESPACE: &str = "solenoid";
const NVS_SETTINGS_KEY: &str = "settings";
const NVS_RECORD_CAPACITY: usize = 64;
const MAX_HTTP_BODY: usize = 2048;
const REQUEST_TIMEOUT_MS: u64 = 2_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const OUTPUT_PINS: [i32; ACTUATOR_COUNT] = [25, 26, 27];
const BUTTON_PINS: [i32; BUTTON_COUNT] = [32, 33];

const INDEX_HTML: &str = include_str!("../web/index.html");

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;
type Reply<T> = mpsc::SyncSender<T>;

enum Command {
    GetSettings(Reply<SettingsView>),
    UpdateSettings(SettingsUpdate, Reply<Result<(bool, SettingsView), ControllerError>>),
    Toggle(ActuatorId, Reply<OutputState>),
    Status(Reply<ControllerStatus>),
    GetClock(Reply<ClockView>),
    SetClock(DateTimeRequest, Reply<Result<ClockView, ControllerError>>),
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

struct MdnsResponder;

/// Soft AP plus the services that only live while it is up.
struct AccessPoint {
    wifi: BlockingWifi<EspWifi<'static>>,
    network: NetworkConfig,
    commands: mpsc::Sender<Command>,
    services: Option<(EspHttpServer<'static>, MdnsResponder)>,
    idle_check_from_ms: u64,
}

struct Firmware {
    engine: ControllerEngine<NvsStore>,
    clock: SoftClock,
    outputs: [PinDriver<'static, AnyOutputPin, Output>; ACTUATOR_COUNT],
    buttons: [PinDriver<'static, AnyInputPin, Input>; BUTTON_COUNT],
    access_point: AccessPoint,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let runtime = RuntimeConfig::default();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    // Outputs are driven low before anything else touches the engine.
    let outputs = init_outputs().context("failed to configure output lines")?;
    let buttons = init_buttons().context("failed to configure button lines")?;

    let wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?,
        sys_loop,
    )?;

    let (commands, receiver) = mpsc::channel();
    let store = NvsStore {
        partition: nvs_partition,
    };
    let mut firmware = Firmware {
        engine: ControllerEngine::new(runtime.controller.clone(), SettingsModel::new(store)),
        clock: SoftClock::new(),
        outputs,
        buttons,
        access_point: AccessPoint {
            wifi,
            network: runtime.network.clone(),
            commands,
            services: None,
            idle_check_from_ms: 0,
        },
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    firmware.start(monotonic_ms());

    let tick = Duration::from_millis(runtime.controller.control_tick_ms);
    let ap_idle_timeout_ms = runtime.controller.ap_idle_timeout_ms;
    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        firmware.step(now_ms);
        while let Ok(command) = receiver.try_recv() {
            firmware.service(command, now_ms);
        }
        firmware.access_point.check_idle(now_ms, ap_idle_timeout_ms);

        thread::sleep(tick);
    }
}

impl Firmware {
    fn start(&mut self, now_ms: u64) {
        let (loaded, actions) = self.engine.startup();
        match loaded {
            Ok(LoadSource::Stored) => info!("settings loaded from NVS"),
            Ok(LoadSource::Defaults) => info!("NVS record not initialized; defaults written"),
            Err(err) => warn!("failed to read settings from NVS, using defaults: {err}"),
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
        let mut inputs = [true; BUTTON_COUNT];
        for (reading, pin) in inputs.iter_mut().zip(&self.buttons) {
            *reading = pin.is_high();
        }

        let wall_clock = self.clock.now(now_ms);
        let actions = self.engine.poll(inputs, now_ms, wall_clock.as_ref());
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
                    self.drive(id, true);
                    info!(
                        "actuator {id} (GPIO{}) ON for {duration_minutes} min ({source:?})",
                        OUTPUT_PINS[id.index()]
                    );
                }
                EngineAction::OutputOff { id, source } => {
                    self.drive(id, false);
                    info!(
                        "actuator {id} (GPIO{}) OFF ({source:?})",
                        OUTPUT_PINS[id.index()]
                    );
                }
                EngineAction::AlreadyActive { id, source } => {
                    info!("actuator {id} already active; {source:?} trigger ignored");
                }
                EngineAction::StartAccessPoint => {
                    if let Err(err) = self.access_point.start(now_ms) {
                        warn!("failed to start access point: {err:#}");
                    }
                }
            }
        }
    }

    fn drive(&mut self, id: ActuatorId, on: bool) {
        let pin = &mut self.outputs[id.index()];
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive output for actuator {id}: {err}");
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
                            info!("settings updated via web interface");
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
            Command::Toggle(id, reply) => {
                let (state, actions) = self.engine.toggle(id, now_ms);
                self.execute(actions, now_ms);
                let _ = reply.send(state);
            }
            Command::Status(reply) => {
                let status = self.engine.status(
                    now_ms,
                    self.clock.formatted(now_ms),
                    self.access_point.is_active(),
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

impl AccessPoint {
    fn is_active(&self) -> bool {
        self.services.is_some()
    }

    fn start(&mut self, now_ms: u64) -> anyhow::Result<()> {
        if self.is_active() {
            info!("access point already active");
            return Ok(());
        }

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: self
                    .network
                    .ap_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("AP SSID too long"))?,
                password: self
                    .network
                    .ap_password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("AP password too long"))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.wifi.wait_netif_up()?;

        let ip = self.wifi.wifi().ap_netif().get_ip_info()?.ip;
        info!("access point `{}` up at {ip}", self.network.ap_ssid);

        let server = create_http_server(self.commands.clone(), self.network.http_port)?;
        let mdns = MdnsResponder::start(&self.network.hostname, self.network.http_port)?;
        info!("web interface at http://{}.local", self.network.hostname);

        self.services = Some((server, mdns));
        self.idle_check_from_ms = now_ms;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.services = None;
        self.wifi.stop()?;
        info!("access point stopped");
        Ok(())
    }

    /// Shuts the AP down once a full timeout window passes with no
    /// stations attached. Connected stations restart the window.
    fn check_idle(&mut self, now_ms: u64, timeout_ms: u64) {
        if !self.is_active() || now_ms.saturating_sub(self.idle_check_from_ms) < timeout_ms {
            return;
        }

        let stations = connected_stations();
        if stations > 0 {
            info!("{stations} station(s) connected; keeping access point up");
            self.idle_check_from_ms = now_ms;
            return;
        }

        info!(
            "no stations for {} min; shutting down access point",
            timeout_ms / 60_000
        );
        if let Err(err) = self.stop() {
            warn!("failed to stop access point: {err:#}");
        }
    }
}

fn create_http_server(
    commands: mpsc::Sender<Command>,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let commands = commands.clone();
        server.fn_handler::<anyhow::Error, _>("/api/settings", Method::Get, move |req| {
            let settings = request(&commands, Command::GetSettings)?;
            write_json(req, &settings)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler::<anyhow::Error, _>("/api/settings", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<SettingsUpdate>(&body) else {
                return write_error(req, 400, "Invalid JSON");
            };

            match request(&commands, |reply| Command::UpdateSettings(update, reply))? {
                Ok((changed, settings)) => write_json(
                    req,
                    &SettingsUpdateResponse {
                        status: "success",
                        message: if changed {
                            "Settings updated"
                        } else {
                            "No changes detected"
                        },
                        settings,
                    },
                ),
                Err(err) => write_controller_error(req, &err),
            }
        })?;
    }

    for id in ActuatorId::ALL {
        let commands = commands.clone();
        let path = format!("/api/actuators/{id}/toggle");
        server.fn_handler::<anyhow::Error, _>(&path, Method::Post, move |req| {
            let state = request(&commands, |reply| Command::Toggle(id, reply))?;
            write_json(
                req,
                &ToggleResponse {
                    status: "success",
                    id,
                    state,
                    message: format!(
                        "Actuator {id} {}",
                        if state.is_on() { "activated" } else { "deactivated" }
                    ),
                },
            )
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            let status = request(&commands, Command::Status)?;
            write_json(req, &status)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler::<anyhow::Error, _>("/api/time", Method::Get, move |req| {
            let clock = request(&commands, Command::GetClock)?;
            write_json(req, &clock)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/time", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let Ok(datetime) = serde_json::from_slice::<DateTimeRequest>(&body) else {
            return write_error(req, 400, "Invalid JSON");
        };

        match request(&commands, |reply| Command::SetClock(datetime, reply))? {
            Ok(clock) => write_json(req, &clock),
            Err(err) => write_controller_error(req, &err),
        }
    })?;

    Ok(server)
}

/// Hands a command to the control loop and waits for its reply.
fn request<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(Reply<T>) -> Command,
) -> anyhow::Result<T> {
    let (reply, response) = mpsc::sync_channel(1);
    commands
        .send(build(reply))
        .map_err(|_| anyhow!("control loop is not running"))?;
    response
        .recv_timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
        .map_err(|_| anyhow!("control loop did not answer"))
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "status": "error", "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_controller_error(req: HttpRequest<'_, '_>, err: &ControllerError) -> anyhow::Result<()> {
    match err {
        ControllerError::UnknownActuator(_) | ControllerError::UnknownButton(_) => {
            write_error(req, 404, &err.to_string())
        }
        ControllerError::InvalidSettings(_) | ControllerError::InvalidDateTime => {
            write_error(req, 400, &err.to_string())
        }
        ControllerError::Storage(_) => write_error(req, 500, "Failed to persist settings"),
    }
}

impl ConfigStore for NvsStore {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut buffer = [0_u8; NVS_RECORD_CAPACITY];

        match nvs.get_raw(NVS_SETTINGS_KEY, &mut buffer) {
            Ok(value) => Ok(value.map(<[u8]>::to_vec)),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn write_record(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        nvs.set_raw(NVS_SETTINGS_KEY, bytes)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }
}

impl MdnsResponder {
    fn start(hostname: &str, port: u16) -> anyhow::Result<Self> {
        let hostname = CString::new(hostname)?;
        let rc = unsafe { esp_idf_svc::sys::mdns_init() };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(anyhow!("mdns_init failed with code {rc}"));
        }

        unsafe {
            esp_idf_svc::sys::mdns_hostname_set(hostname.as_ptr());
            esp_idf_svc::sys::mdns_instance_name_set(c"Solenoid Controller".as_ptr());
            esp_idf_svc::sys::mdns_service_add(
                core::ptr::null(),
                c"_http".as_ptr(),
                c"_tcp".as_ptr(),
                port,
                core::ptr::null_mut(),
                0,
            );
        }
        Ok(Self)
    }
}

impl Drop for MdnsResponder {
    fn drop(&mut self) {
        unsafe { esp_idf_svc::sys::mdns_free() };
    }
}

fn init_outputs() -> anyhow::Result<[PinDriver<'static, AnyOutputPin, Output>; ACTUATOR_COUNT]> {
    let [first, second, third] = OUTPUT_PINS;
    let mut pins = unsafe {
        [
            PinDriver::output(AnyOutputPin::new(first))?,
            PinDriver::output(AnyOutputPin::new(second))?,
            PinDriver::output(AnyOutputPin::new(third))?,
        ]
    };
    for pin in &mut pins {
        pin.set_low()?;
    }
    Ok(pins)
}

fn init_buttons() -> anyhow::Result<[PinDriver<'static, AnyInputPin, Input>; BUTTON_COUNT]> {
    let [first, second] = BUTTON_PINS;
    let mut pins = unsafe {
        [
            PinDriver::input(AnyInputPin::new(first))?,
            PinDriver::input(AnyInputPin::new(second))?,
        ]
    };
    for pin in &mut pins {
        pin.set_pull(Pull::Up)?;
    }
    Ok(pins)
}

fn connected_stations() -> usize {
    let mut list = esp_idf_svc::sys::wifi_sta_list_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_ap_get_sta_list(&mut list) };
    if rc == esp_idf_svc::sys::ESP_OK {
        list.num.max(0) as usize
    } else {
        0
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
