//! The plugin child: one backend behind one pipe.
//!
//! ```text
//! UNINITIALIZED → INITIALIZED → CONNECTED → PLUGIN_LOADING → PLUGIN_LOADED
//!   → PLUGIN_INITIALIZING → RUNNING → UNLOADING → UNLOADED → DONE
//!                      any of the above ──▶ ERROR ──▶ DONE
//! ```
//!
//! The child never retries. A lost pipe or a backend that fails to load ends
//! the process, and the host notices the closed connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use plugin_config_and_utils::Config;
use plugin_instance::{PluginInstance, PluginResult};
use plugin_message::{
    ForeignAddress, Message, Value, MESSAGE_CLASS_BASE, MESSAGE_CLASS_INTERNAL,
};
use plugin_pipe::{MessagePipe, DEFAULT_MAX_FRAME_LEN};
use plugin_shm::SharedMemoryRegion;
use tracing::{debug, error, info, trace, warn};

/// Time allowed to push the last queued messages out before closing.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChildState {
    Uninitialized,
    Initialized,
    Connected,
    PluginLoading,
    PluginLoaded,
    PluginInitializing,
    Running,
    Unloading,
    Unloaded,
    Error,
    Done,
}

impl ChildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildState::Uninitialized => "uninitialized",
            ChildState::Initialized => "initialized",
            ChildState::Connected => "connected",
            ChildState::PluginLoading => "plugin_loading",
            ChildState::PluginLoaded => "plugin_loaded",
            ChildState::PluginInitializing => "plugin_initializing",
            ChildState::Running => "running",
            ChildState::Unloading => "unloading",
            ChildState::Unloaded => "unloaded",
            ChildState::Error => "error",
            ChildState::Done => "done",
        }
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces the backend named by `internal.load_plugin`.
pub trait PluginLoader {
    fn load(&mut self, path: &Path) -> PluginResult<PluginInstance>;
}

/// Loads backends from dynamic modules on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl PluginLoader for DylibLoader {
    fn load(&mut self, path: &Path) -> PluginResult<PluginInstance> {
        PluginInstance::load(path)
    }
}

/// Timing knobs for the child loop.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Target tick period.
    pub sleep_time: Duration,
    pub heartbeat_interval: Duration,
    /// Give up on an unanswered blocking request after this long.
    pub blocking_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            sleep_time: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(1),
            blocking_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ChildOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sleep_time: config.child_sleep_time(),
            heartbeat_interval: config.heartbeat_interval(),
            blocking_timeout: config.blocking_request_timeout(),
            max_frame_len: config.max_frame_len,
        }
    }
}

/// Where `internal.load_plugin` points.
fn resolve_plugin_path(dir: &str, file: &str) -> PathBuf {
    let file_path = Path::new(file);
    if dir.is_empty() || file_path.is_absolute() {
        file_path.to_path_buf()
    } else {
        Path::new(dir).join(file_path)
    }
}

/// Child-side process manager.
///
/// Drive it with [`run`](Self::run), or step it with [`idle`](Self::idle)
/// and [`pump`](Self::pump) when something else owns the loop.
pub struct ProcessChild<L = DylibLoader> {
    state: ChildState,
    port: u16,
    loader: L,
    options: ChildOptions,
    pipe: Option<MessagePipe>,
    instance: Option<PluginInstance>,
    plugin_path: Option<PathBuf>,
    regions: HashMap<String, SharedMemoryRegion>,
    message_class_versions: BTreeMap<String, String>,
    plugin_version: String,
    blocked_since: Option<Instant>,
    deferred: VecDeque<Message>,
    last_heartbeat: Instant,
    failed: bool,
}

impl<L: PluginLoader> ProcessChild<L> {
    pub fn new(loader: L, options: ChildOptions) -> Self {
        Self {
            state: ChildState::Uninitialized,
            port: 0,
            loader,
            options,
            pipe: None,
            instance: None,
            plugin_path: None,
            regions: HashMap::new(),
            message_class_versions: BTreeMap::new(),
            plugin_version: String::new(),
            blocked_since: None,
            deferred: VecDeque::new(),
            last_heartbeat: Instant::now(),
            failed: false,
        }
    }

    /// Remember the host's port. The connection is made on the next idle.
    pub fn init(&mut self, port: u16) {
        self.port = port;
        self.set_state(ChildState::Initialized);
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ChildState::Done
    }

    /// Whether the child passed through the error state on its way out.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Whether the backend is waiting on a blocking response.
    pub fn is_blocked(&self) -> bool {
        self.blocked_since.is_some()
    }

    pub fn sleep_time(&self) -> Duration {
        self.options.sleep_time
    }

    pub fn plugin_version(&self) -> &str {
        &self.plugin_version
    }

    pub fn message_class_version(&self, class: &str) -> Option<&str> {
        self.message_class_versions.get(class).map(String::as_str)
    }

    pub fn has_region(&self, name: &str) -> bool {
        self.regions.contains_key(name)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Tick until done, pumping the pipe for whatever is left of each
    /// period.
    pub async fn run(&mut self) {
        while !self.is_done() {
            let started = Instant::now();
            self.idle().await;
            if self.is_done() {
                break;
            }
            let remaining = self.options.sleep_time.saturating_sub(started.elapsed());
            self.pump(remaining).await;
        }
        info!("Plugin child finished");
    }

    /// Advance the state machine as far as it can go without new input.
    pub async fn idle(&mut self) {
        while self.step().await {}
    }

    /// Move pipe traffic and dispatch what arrived. Waits at most `timeout`.
    pub async fn pump(&mut self, timeout: Duration) {
        let Some(pipe) = self.pipe.as_mut() else {
            tokio::time::sleep(timeout).await;
            return;
        };
        match pipe.pump(timeout).await {
            Ok(messages) => {
                for message in messages {
                    self.receive_from_parent(message);
                }
            }
            Err(err) => {
                trace!(error = %err, state = %self.state, "Pipe pump failed");
            }
        }
    }

    /// One state transition. Returns whether another step should follow
    /// immediately.
    async fn step(&mut self) -> bool {
        if self.state > ChildState::Initialized
            && self.state < ChildState::Unloading
            && self.pipe.as_ref().map_or(true, MessagePipe::is_broken)
        {
            warn!(state = %self.state, "Lost connection to host");
            self.set_state(ChildState::Error);
            return true;
        }

        match self.state {
            ChildState::Uninitialized | ChildState::Connected | ChildState::Done => false,

            ChildState::Initialized => match MessagePipe::connect(self.port).await {
                Ok(pipe) => {
                    self.pipe = Some(pipe.with_max_frame_len(self.options.max_frame_len));
                    self.send_to_parent(&Message::new(MESSAGE_CLASS_INTERNAL, "hello"));
                    self.set_state(ChildState::Connected);
                    false
                }
                Err(err) => {
                    error!(port = self.port, error = %err, "Failed to connect to host");
                    self.set_state(ChildState::Error);
                    true
                }
            },

            ChildState::PluginLoading => {
                let Some(path) = self.plugin_path.clone() else {
                    self.set_state(ChildState::Error);
                    return true;
                };
                match self.loader.load(&path) {
                    Ok(instance) => {
                        info!(path = %path.display(), "Plugin loaded");
                        self.instance = Some(instance);
                        self.set_state(ChildState::PluginLoaded);
                    }
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "Plugin load failed");
                        self.set_state(ChildState::Error);
                    }
                }
                true
            }

            ChildState::PluginLoaded => {
                // The reply may arrive synchronously, so switch state first.
                self.set_state(ChildState::PluginInitializing);
                self.send_to_plugin(&Message::new(MESSAGE_CLASS_BASE, "init"));
                false
            }

            ChildState::PluginInitializing => false,

            ChildState::Running => {
                self.tick();
                false
            }

            ChildState::Unloading => {
                if self.instance.is_some() {
                    self.send_to_plugin(&Message::new(MESSAGE_CLASS_BASE, "cleanup"));
                    self.instance = None;
                    debug!("Plugin instance released");
                }
                self.detach_all();
                self.set_state(ChildState::Unloaded);
                true
            }

            ChildState::Unloaded => {
                self.close_pipe().await;
                self.set_state(ChildState::Done);
                false
            }

            ChildState::Error => {
                self.failed = true;
                if self.instance.is_some() {
                    self.send_to_plugin(&Message::new(MESSAGE_CLASS_BASE, "cleanup"));
                    self.instance = None;
                }
                self.detach_all();
                self.close_pipe().await;
                self.set_state(ChildState::Done);
                false
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.check_blocking_timeout(now);

        if now.saturating_duration_since(self.last_heartbeat) >= self.options.heartbeat_interval {
            let cpu_time = self
                .instance
                .as_mut()
                .map(PluginInstance::take_cpu_time)
                .unwrap_or_default();
            let mut heartbeat = Message::new(MESSAGE_CLASS_INTERNAL, "heartbeat");
            heartbeat.set_value_real("cpu_usage", cpu_time.as_secs_f64());
            self.send_to_parent(&heartbeat);
            self.last_heartbeat = now;
        }

        if self.is_blocked() {
            return;
        }

        let mut idle = Message::new(MESSAGE_CLASS_BASE, "idle");
        idle.set_value_real("time", self.options.sleep_time.as_secs_f64());
        self.send_to_plugin(&idle);

        if let Some(instance) = self.instance.as_mut() {
            instance.idle();
        }
        self.route_plugin_messages();
    }

    fn check_blocking_timeout(&mut self, now: Instant) {
        let (Some(since), Some(limit)) = (self.blocked_since, self.options.blocking_timeout) else {
            return;
        };
        if now.saturating_duration_since(since) > limit {
            warn!(
                waited_ms = now.saturating_duration_since(since).as_millis() as u64,
                deferred = self.deferred.len(),
                "Blocking request timed out"
            );
            self.blocked_since = None;
            self.flush_deferred();
        }
    }

    fn receive_from_parent(&mut self, message: Message) {
        if self.is_blocked() {
            if !message.is_blocking_response() {
                trace!(
                    class = message.class(),
                    name = message.name(),
                    "Deferring message until blocking response"
                );
                self.deferred.push_back(message);
                return;
            }
            self.blocked_since = None;
            debug!(
                class = message.class(),
                name = message.name(),
                "Blocking request answered"
            );
            self.dispatch_from_parent(message);
            self.flush_deferred();
            return;
        }
        self.dispatch_from_parent(message);
    }

    fn flush_deferred(&mut self) {
        while !self.is_blocked() {
            let Some(message) = self.deferred.pop_front() else {
                break;
            };
            self.dispatch_from_parent(message);
        }
    }

    fn dispatch_from_parent(&mut self, message: Message) {
        match message.class() {
            MESSAGE_CLASS_INTERNAL => self.handle_internal(&message),
            MESSAGE_CLASS_BASE if message.name() == "cleanup" => {
                if self.state < ChildState::Unloading {
                    info!(state = %self.state, "Host requested cleanup");
                    self.set_state(ChildState::Unloading);
                }
            }
            _ if self.instance.is_some() => self.send_to_plugin(&message),
            _ => warn!(
                class = message.class(),
                name = message.name(),
                state = %self.state,
                "No plugin loaded, dropping message"
            ),
        }
    }

    fn handle_internal(&mut self, message: &Message) {
        match message.name() {
            "load_plugin" => {
                if self.state != ChildState::Connected {
                    warn!(state = %self.state, "Ignoring load_plugin");
                    return;
                }
                let path = resolve_plugin_path(&message.get_value("dir"), &message.get_value("file"));
                debug!(path = %path.display(), "Plugin load requested");
                self.plugin_path = Some(path);
                self.set_state(ChildState::PluginLoading);
            }
            "shm_add" => self.attach_region(message),
            "shm_remove" => {
                let name = message.get_value("name");
                if self.instance.is_some() && self.regions.contains_key(&name) {
                    let mut remove = Message::new(MESSAGE_CLASS_BASE, "shm_remove");
                    remove.set_value("name", name);
                    self.send_to_plugin(&remove);
                } else {
                    self.release_region(&name);
                }
            }
            "sleep_time" => {
                let seconds = message.get_value_real("time");
                match Duration::try_from_secs_f64(seconds) {
                    Ok(sleep_time) => {
                        self.options.sleep_time = sleep_time;
                        debug!(sleep_ms = sleep_time.as_millis() as u64, "Tick period changed");
                    }
                    Err(err) => warn!(seconds, error = %err, "Ignoring invalid sleep time"),
                }
            }
            "crash" => {
                error!("Crash requested by host");
                std::process::abort();
            }
            "hang" => {
                warn!("Hang requested by host");
                loop {
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
            other => warn!(name = other, "Unknown internal message"),
        }
    }

    /// Map the region before the backend learns its address.
    fn attach_region(&mut self, message: &Message) {
        let name = message.get_value("name");
        let size = message.get_value_s32("size");
        let Ok(len) = usize::try_from(size) else {
            warn!(name = %name, size, "Ignoring shm_add with negative size");
            return;
        };

        match SharedMemoryRegion::attach(&name, len) {
            Ok(region) => {
                let address = ForeignAddress::from_ptr(region.as_ptr());
                if self.regions.insert(name.clone(), region).is_some() {
                    warn!(name = %name, "Replaced an already attached region");
                }
                debug!(name = %name, size, "Attached shared memory");

                let mut added = Message::new(MESSAGE_CLASS_BASE, "shm_added");
                added.set_value("name", name);
                added.set_value_s32("size", size);
                added.set_value_pointer("address", address);
                self.send_to_plugin(&added);
            }
            Err(err) => warn!(name = %name, size, error = %err, "Failed to attach shared memory"),
        }
    }

    /// Unmap a region and tell the host it may destroy it.
    fn release_region(&mut self, name: &str) {
        match self.regions.remove(name) {
            Some(region) => {
                if let Err(err) = region.detach() {
                    warn!(name, error = %err, "Failed to detach shared memory");
                }
            }
            None => debug!(name, "Release of unknown region"),
        }
        let mut response = Message::new(MESSAGE_CLASS_INTERNAL, "shm_remove_response");
        response.set_value("name", name);
        self.send_to_parent(&response);
    }

    fn detach_all(&mut self) {
        for (name, region) in self.regions.drain() {
            if let Err(err) = region.detach() {
                warn!(name = %name, error = %err, "Failed to detach shared memory");
            }
        }
    }

    fn send_to_plugin(&mut self, message: &Message) {
        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        let text = match message.generate() {
            Ok(text) => text,
            Err(err) => {
                warn!(class = message.class(), name = message.name(), error = %err, "Failed to encode message for plugin");
                return;
            }
        };
        if let Err(err) = instance.send_message(&text) {
            warn!(class = message.class(), name = message.name(), error = %err, "Failed to deliver message to plugin");
        }
        self.route_plugin_messages();
    }

    fn route_plugin_messages(&mut self) {
        loop {
            let Some(instance) = self.instance.as_ref() else {
                return;
            };
            let batch = instance.drain_messages();
            if batch.is_empty() {
                return;
            }
            for text in batch {
                match Message::parse(&text) {
                    Ok(message) => self.receive_from_plugin(message),
                    Err(err) => warn!(error = %err, "Dropping malformed message from plugin"),
                }
            }
        }
    }

    fn receive_from_plugin(&mut self, message: Message) {
        match (message.class(), message.name()) {
            (MESSAGE_CLASS_BASE, "init_response") => {
                self.message_class_versions = match message.get_value_structured("versions") {
                    Some(Value::Map(versions)) => versions
                        .iter()
                        .map(|(class, version)| (class.clone(), version.to_text()))
                        .collect(),
                    _ => BTreeMap::new(),
                };
                self.plugin_version = message.get_value("plugin_version");

                let mut response = Message::new(MESSAGE_CLASS_INTERNAL, "load_plugin_response");
                response.set_value_structured(
                    "versions",
                    Value::Map(
                        self.message_class_versions
                            .iter()
                            .map(|(class, version)| (class.clone(), Value::String(version.clone())))
                            .collect(),
                    ),
                );
                response.set_value("plugin_version", self.plugin_version.clone());
                self.send_to_parent(&response);

                if self.state == ChildState::PluginInitializing {
                    self.last_heartbeat = Instant::now();
                    self.set_state(ChildState::Running);
                }
            }
            (MESSAGE_CLASS_BASE, "shm_remove_response") => {
                self.release_region(&message.get_value("name"));
            }
            (MESSAGE_CLASS_BASE, "force_exit") => {
                if self.state < ChildState::Unloading {
                    info!("Plugin requested exit");
                    self.set_state(ChildState::Unloading);
                }
            }
            (MESSAGE_CLASS_INTERNAL, name) => {
                warn!(name, "Plugin sent an internal message, dropping");
            }
            _ => {
                if message.is_blocking_request() {
                    debug!(class = message.class(), name = message.name(), "Plugin is blocked on a request");
                    self.blocked_since = Some(Instant::now());
                }
                self.send_to_parent(&message);
            }
        }
    }

    fn send_to_parent(&mut self, message: &Message) {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.send(message),
            None => debug!(
                class = message.class(),
                name = message.name(),
                "No pipe to host, dropping message"
            ),
        }
    }

    async fn close_pipe(&mut self) {
        let Some(mut pipe) = self.pipe.take() else {
            return;
        };
        if !pipe.is_broken() {
            if let Err(err) = pipe.flush(CLOSE_FLUSH_TIMEOUT).await {
                debug!(error = %err, "Could not flush pipe before closing");
            }
        }
        pipe.close().await;
    }

    fn set_state(&mut self, state: ChildState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Child state change");
            self.state = state;
        }
    }
}
