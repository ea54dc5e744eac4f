pub mod memory;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::config::Config;
use crate::protocol::{CommandFrame, ResponseFrame};
use crate::safety::SafetyLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Target {
    pub tab_id: Option<u64>,
    pub selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ElementClick,
    ElementType,
    ElementRead,
    ElementUpload,
    ElementScroll,
    ElementWait,
    TabCreate,
    TabClose,
    TabNavigate,
    TabQuery,
    WindowClose,
    UiLock,
    UiUnlock,
}

impl CommandKind {
    pub const ALL: [CommandKind; 13] = [
        CommandKind::ElementClick,
        CommandKind::ElementType,
        CommandKind::ElementRead,
        CommandKind::ElementUpload,
        CommandKind::ElementScroll,
        CommandKind::ElementWait,
        CommandKind::TabCreate,
        CommandKind::TabClose,
        CommandKind::TabNavigate,
        CommandKind::TabQuery,
        CommandKind::WindowClose,
        CommandKind::UiLock,
        CommandKind::UiUnlock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::ElementClick => "element-click",
            CommandKind::ElementType => "element-type",
            CommandKind::ElementRead => "element-read",
            CommandKind::ElementUpload => "element-upload",
            CommandKind::ElementScroll => "element-scroll",
            CommandKind::ElementWait => "element-wait",
            CommandKind::TabCreate => "tab-create",
            CommandKind::TabClose => "tab-close",
            CommandKind::TabNavigate => "tab-navigate",
            CommandKind::TabQuery => "tab-query",
            CommandKind::WindowClose => "window-close",
            CommandKind::UiLock => "ui-lock",
            CommandKind::UiUnlock => "ui-unlock",
        }
    }

    /// Accepts kebab, snake and dotted spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name
            .trim()
            .to_ascii_lowercase()
            .replace(|c: char| c == '_' || c == '.', "-");
        Self::ALL.into_iter().find(|kind| kind.name() == normalized)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ElementClick { target: Target },
    ElementType { target: Target, text: String, clear: bool },
    ElementRead { target: Target, attribute: Option<String> },
    ElementUpload { target: Target, files: Vec<UploadFile> },
    ElementScroll { target: Target, delta_x: i64, delta_y: i64 },
    ElementWait { target: Target, timeout_ms: Option<u64> },
    TabCreate { url: Option<String>, active: bool },
    TabClose { tab_id: Option<u64> },
    TabNavigate { tab_id: Option<u64>, url: String },
    TabQuery { url_pattern: Option<String> },
    WindowClose { window_id: Option<u64> },
    UiLock { reason: Option<String> },
    UiUnlock,
}

#[derive(Deserialize)]
struct TypePayload {
    text: String,
    #[serde(default)]
    clear: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ReadPayload {
    attribute: Option<String>,
}

#[derive(Deserialize)]
struct UploadPayload {
    files: Vec<UploadFileSpec>,
}

#[derive(Deserialize)]
struct UploadFileSpec {
    name: String,
    #[serde(default = "default_mime_type")]
    mime_type: String,
    data: String,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ScrollPayload {
    x: i64,
    y: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WaitPayload {
    timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TabCreatePayload {
    url: Option<String>,
    active: Option<bool>,
}

#[derive(Deserialize)]
struct NavigatePayload {
    url: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TabQueryPayload {
    url: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WindowPayload {
    window_id: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LockPayload {
    reason: Option<String>,
}

impl Command {
    pub fn parse(frame: &CommandFrame) -> Result<Self, CommandError> {
        let kind = CommandKind::from_name(&frame.command)
            .ok_or_else(|| CommandError::Unsupported(frame.command.clone()))?;
        let target: Target = parse_field(kind, &frame.target)?;
        let payload = &frame.payload;

        let command = match kind {
            CommandKind::ElementClick => Command::ElementClick {
                target: require_selector(kind, target)?,
            },
            CommandKind::ElementType => {
                let p: TypePayload = parse_field(kind, payload)?;
                Command::ElementType {
                    target: require_selector(kind, target)?,
                    text: p.text,
                    clear: p.clear,
                }
            }
            CommandKind::ElementRead => {
                let p: ReadPayload = parse_field(kind, payload)?;
                Command::ElementRead {
                    target: require_selector(kind, target)?,
                    attribute: p.attribute,
                }
            }
            CommandKind::ElementUpload => {
                let p: UploadPayload = parse_field(kind, payload)?;
                let files = p
                    .files
                    .into_iter()
                    .map(|spec| {
                        STANDARD
                            .decode(spec.data.as_bytes())
                            .map(|bytes| UploadFile {
                                name: spec.name,
                                mime_type: spec.mime_type,
                                bytes,
                            })
                            .map_err(|err| CommandError::InvalidPayload {
                                command: kind.name(),
                                reason: format!("file data is not base64: {err}"),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Command::ElementUpload {
                    target: require_selector(kind, target)?,
                    files,
                }
            }
            CommandKind::ElementScroll => {
                let p: ScrollPayload = parse_field(kind, payload)?;
                Command::ElementScroll {
                    target,
                    delta_x: p.x,
                    delta_y: p.y,
                }
            }
            CommandKind::ElementWait => {
                let p: WaitPayload = parse_field(kind, payload)?;
                Command::ElementWait {
                    target: require_selector(kind, target)?,
                    timeout_ms: p.timeout_ms,
                }
            }
            CommandKind::TabCreate => {
                let p: TabCreatePayload = parse_field(kind, payload)?;
                Command::TabCreate {
                    url: p.url,
                    active: p.active.unwrap_or(true),
                }
            }
            CommandKind::TabClose => Command::TabClose {
                tab_id: target.tab_id,
            },
            CommandKind::TabNavigate => {
                let p: NavigatePayload = parse_field(kind, payload)?;
                Command::TabNavigate {
                    tab_id: target.tab_id,
                    url: p.url,
                }
            }
            CommandKind::TabQuery => {
                let p: TabQueryPayload = parse_field(kind, payload)?;
                Command::TabQuery { url_pattern: p.url }
            }
            CommandKind::WindowClose => {
                let p: WindowPayload = parse_field(kind, payload)?;
                Command::WindowClose {
                    window_id: p.window_id,
                }
            }
            CommandKind::UiLock => {
                let p: LockPayload = parse_field(kind, payload)?;
                Command::UiLock { reason: p.reason }
            }
            CommandKind::UiUnlock => Command::UiUnlock,
        };
        Ok(command)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ElementClick { .. } => CommandKind::ElementClick,
            Command::ElementType { .. } => CommandKind::ElementType,
            Command::ElementRead { .. } => CommandKind::ElementRead,
            Command::ElementUpload { .. } => CommandKind::ElementUpload,
            Command::ElementScroll { .. } => CommandKind::ElementScroll,
            Command::ElementWait { .. } => CommandKind::ElementWait,
            Command::TabCreate { .. } => CommandKind::TabCreate,
            Command::TabClose { .. } => CommandKind::TabClose,
            Command::TabNavigate { .. } => CommandKind::TabNavigate,
            Command::TabQuery { .. } => CommandKind::TabQuery,
            Command::WindowClose { .. } => CommandKind::WindowClose,
            Command::UiLock { .. } => CommandKind::UiLock,
            Command::UiUnlock => CommandKind::UiUnlock,
        }
    }
}

fn parse_field<T: DeserializeOwned>(kind: CommandKind, value: &Value) -> Result<T, CommandError> {
    let value = if value.is_null() {
        Value::Object(Map::new())
    } else {
        value.clone()
    };
    serde_json::from_value(value).map_err(|err| CommandError::InvalidPayload {
        command: kind.name(),
        reason: err.to_string(),
    })
}

fn require_selector(kind: CommandKind, target: Target) -> Result<Target, CommandError> {
    match target.selector.as_deref() {
        Some(selector) if !selector.trim().is_empty() => Ok(target),
        _ => Err(CommandError::InvalidPayload {
            command: kind.name(),
            reason: "target.selector is required".to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("no element matches {0}")]
    ElementNotFound(String),
    #[error("tab {0} not found")]
    TabNotFound(u64),
    #[error("window {0} not found")]
    WindowNotFound(u64),
    #[error("no active tab")]
    NoActiveTab,
    #[error("element {selector} cannot {action}")]
    NotInteractable {
        selector: String,
        action: &'static str,
    },
    #[error("{0}")]
    Execution(String),
}

impl DriverError {
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::ElementNotFound(_) => "element_not_found",
            DriverError::TabNotFound(_) => "tab_not_found",
            DriverError::WindowNotFound(_) => "window_not_found",
            DriverError::NoActiveTab => "no_active_tab",
            DriverError::NotInteractable { .. } => "not_interactable",
            DriverError::Execution(_) => "execution_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unsupported command: {0}")]
    Unsupported(String),
    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload {
        command: &'static str,
        reason: String,
    },
    #[error("timed out after {timeout_ms} ms waiting for {selector}")]
    Timeout { selector: String, timeout_ms: u64 },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Unsupported(_) => "unsupported",
            CommandError::InvalidPayload { .. } => "invalid_payload",
            CommandError::Timeout { .. } => "timeout",
            CommandError::Driver(err) => err.code(),
        }
    }

    fn into_response(self, id: impl Into<String>) -> ResponseFrame {
        ResponseFrame::failure(id, self.code(), self.to_string())
    }
}

/// Page primitives provided by the hosting browser runtime.
pub trait PageDriver {
    fn click(&mut self, target: &Target) -> Result<Value, DriverError>;
    fn type_text(&mut self, target: &Target, text: &str, clear: bool) -> Result<Value, DriverError>;
    fn read(&mut self, target: &Target, attribute: Option<&str>) -> Result<Value, DriverError>;
    fn upload(&mut self, target: &Target, files: &[UploadFile]) -> Result<Value, DriverError>;
    fn scroll(&mut self, target: &Target, delta_x: i64, delta_y: i64) -> Result<Value, DriverError>;
    fn element_exists(&mut self, target: &Target) -> Result<bool, DriverError>;
    fn create_tab(&mut self, url: Option<&str>, active: bool) -> Result<Value, DriverError>;
    fn close_tab(&mut self, tab_id: Option<u64>) -> Result<Value, DriverError>;
    fn navigate(&mut self, tab_id: Option<u64>, url: &str) -> Result<Value, DriverError>;
    fn query_tabs(&mut self, url_pattern: Option<&str>) -> Result<Value, DriverError>;
    fn close_window(&mut self, window_id: Option<u64>) -> Result<Value, DriverError>;
    /// Shows or hides the blocking overlay and suppresses user input.
    fn set_interaction_lock(&mut self, locked: bool, reason: Option<&str>) -> Result<(), DriverError>;
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub lock_timeout: Duration,
    pub wait_default_timeout: Duration,
    pub wait_max_timeout: Duration,
    pub wait_poll_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            wait_default_timeout: Duration::from_secs(10),
            wait_max_timeout: Duration::from_secs(60),
            wait_poll_interval: Duration::from_millis(100),
        }
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_timeout: Duration::from_millis(config.safety.lock_timeout_ms),
            wait_default_timeout: Duration::from_millis(config.dispatch.wait_default_timeout_ms),
            wait_max_timeout: Duration::from_millis(config.dispatch.wait_max_timeout_ms),
            wait_poll_interval: Duration::from_millis(config.dispatch.wait_poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Respond(ResponseFrame),
    /// The response follows from [`Dispatcher::on_timer`].
    Pending,
}

#[derive(Debug, Default)]
pub struct TimerOutput {
    pub responses: Vec<ResponseFrame>,
    pub lock_timeout: Option<Duration>,
}

#[derive(Debug)]
struct PendingWait {
    id: String,
    target: Target,
    started_at: Instant,
    deadline: Instant,
    next_poll: Instant,
}

impl PendingWait {
    fn selector(&self) -> &str {
        self.target.selector.as_deref().unwrap_or_default()
    }
}

pub struct Dispatcher<D> {
    driver: D,
    lock: SafetyLock,
    waits: Vec<PendingWait>,
    settings: DispatchSettings,
}

impl<D: PageDriver> Dispatcher<D> {
    pub fn new(driver: D, settings: DispatchSettings) -> Self {
        Self {
            driver,
            lock: SafetyLock::new(settings.lock_timeout),
            waits: Vec::new(),
            settings,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn safety_lock(&self) -> &SafetyLock {
        &self.lock
    }

    pub fn pending_waits(&self) -> usize {
        self.waits.len()
    }

    /// Runs one gated command. Exactly one response is produced per id,
    /// either here or later from [`Dispatcher::on_timer`].
    pub fn dispatch(&mut self, frame: &CommandFrame, now: Instant) -> DispatchOutcome {
        if self.lock.touch(now) {
            tracing::debug!(id = %frame.id, "safety lock deadline extended");
        }

        let command = match Command::parse(frame) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(id = %frame.id, command = %frame.command, error = %err, "command rejected");
                return DispatchOutcome::Respond(err.into_response(frame.id.clone()));
            }
        };

        let kind = command.kind();
        tracing::info!(id = %frame.id, command = kind.name(), "dispatching command");
        match self.execute(&frame.id, command, now) {
            Ok(Some(result)) => DispatchOutcome::Respond(ResponseFrame::success(frame.id.clone(), result)),
            Ok(None) => DispatchOutcome::Pending,
            Err(err) => {
                tracing::warn!(id = %frame.id, command = kind.name(), error = %err, "command failed");
                DispatchOutcome::Respond(err.into_response(frame.id.clone()))
            }
        }
    }

    fn execute(&mut self, id: &str, command: Command, now: Instant) -> Result<Option<Value>, CommandError> {
        let result = match command {
            Command::ElementClick { target } => self.driver.click(&target)?,
            Command::ElementType { target, text, clear } => {
                self.driver.type_text(&target, &text, clear)?
            }
            Command::ElementRead { target, attribute } => {
                self.driver.read(&target, attribute.as_deref())?
            }
            Command::ElementUpload { target, files } => self.driver.upload(&target, &files)?,
            Command::ElementScroll {
                target,
                delta_x,
                delta_y,
            } => self.driver.scroll(&target, delta_x, delta_y)?,
            Command::ElementWait { target, timeout_ms } => {
                if self.driver.element_exists(&target)? {
                    json!({"found": true, "selector": target.selector, "waited_ms": 0})
                } else {
                    let timeout = timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.settings.wait_default_timeout)
                        .min(self.settings.wait_max_timeout);
                    let deadline = now + timeout;
                    self.waits.push(PendingWait {
                        id: id.to_string(),
                        target,
                        started_at: now,
                        deadline,
                        next_poll: (now + self.settings.wait_poll_interval).min(deadline),
                    });
                    return Ok(None);
                }
            }
            Command::TabCreate { url, active } => self.driver.create_tab(url.as_deref(), active)?,
            Command::TabClose { tab_id } => self.driver.close_tab(tab_id)?,
            Command::TabNavigate { tab_id, url } => self.driver.navigate(tab_id, &url)?,
            Command::TabQuery { url_pattern } => self.driver.query_tabs(url_pattern.as_deref())?,
            Command::WindowClose { window_id } => self.driver.close_window(window_id)?,
            Command::UiLock { reason } => {
                self.driver.set_interaction_lock(true, reason.as_deref())?;
                self.lock.lock(reason, now);
                json!({
                    "locked": true,
                    "timeout_ms": self.lock.timeout().as_millis() as u64,
                })
            }
            Command::UiUnlock => {
                self.driver.set_interaction_lock(false, None)?;
                let was_locked = self.lock.unlock();
                json!({"locked": false, "was_locked": was_locked})
            }
        };
        Ok(Some(result))
    }

    /// Earliest instant at which [`Dispatcher::on_timer`] has work to do.
    pub fn next_wake(&self) -> Option<Instant> {
        let next_poll = self.waits.iter().map(|wait| wait.next_poll).min();
        match (self.lock.deadline(), next_poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> TimerOutput {
        let mut output = TimerOutput::default();

        let reason = self.lock.reason().map(str::to_string);
        if let Some(idle) = self.lock.expire_if_due(now) {
            match self.driver.set_interaction_lock(false, None) {
                Ok(()) => output.lock_timeout = Some(idle),
                Err(err) => {
                    tracing::error!(error = %err, "failed to remove interaction lock after timeout, retrying");
                    self.lock.reinstate(reason, now);
                }
            }
        }

        let mut remaining = Vec::with_capacity(self.waits.len());
        for mut wait in std::mem::take(&mut self.waits) {
            if wait.next_poll > now {
                remaining.push(wait);
                continue;
            }
            match self.driver.element_exists(&wait.target) {
                Ok(true) => {
                    let waited = now.saturating_duration_since(wait.started_at);
                    output.responses.push(ResponseFrame::success(
                        wait.id.clone(),
                        json!({
                            "found": true,
                            "selector": wait.selector(),
                            "waited_ms": waited.as_millis() as u64,
                        }),
                    ));
                }
                Ok(false) if now >= wait.deadline => {
                    let timeout_ms = wait.deadline.saturating_duration_since(wait.started_at).as_millis() as u64;
                    tracing::warn!(id = %wait.id, selector = wait.selector(), timeout_ms, "element wait timed out");
                    let err = CommandError::Timeout {
                        selector: wait.selector().to_string(),
                        timeout_ms,
                    };
                    output.responses.push(err.into_response(wait.id));
                }
                Ok(false) => {
                    wait.next_poll = (now + self.settings.wait_poll_interval).min(wait.deadline);
                    remaining.push(wait);
                }
                Err(err) => {
                    output
                        .responses
                        .push(CommandError::Driver(err).into_response(wait.id));
                }
            }
        }
        self.waits = remaining;
        output
    }

    /// Drops waits whose requester is gone. The safety lock is untouched.
    pub fn cancel_waits(&mut self) -> usize {
        let cancelled = self.waits.len();
        if cancelled > 0 {
            tracing::info!(cancelled, "pending element waits cancelled");
        }
        self.waits.clear();
        cancelled
    }

    pub fn shutdown(&mut self) {
        self.cancel_waits();
        if self.lock.unlock() {
            if let Err(err) = self.driver.set_interaction_lock(false, None) {
                tracing::error!(error = %err, "failed to remove interaction lock on shutdown");
            }
        }
    }
}
