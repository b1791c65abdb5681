//! The host side of one plugin child.
//!
//! ```text
//! UNINITIALIZED → INITIALIZED → LISTENING → LAUNCHED → CONNECTED → HELLO
//!   → LOADING → RUNNING
//! LAUNCH_FAILURE ─┐
//! ERROR ──────────┴─▶ CLEANUP → DONE        RUNNING ─(shutdown)─▶ EXITING → CLEANUP
//! ```
//!
//! Every wait is bounded: the launch, the backend load and, once running,
//! the gap between heartbeats. A child that dies or stops answering is
//! reported to the owner as [`ParentEvent::Died`] and torn down; the host
//! itself never blocks on it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use plugin_config_and_utils::Config;
use plugin_message::{Message, Value, MESSAGE_CLASS_BASE, MESSAGE_CLASS_INTERNAL};
use plugin_pipe::{MessagePipe, DEFAULT_MAX_FRAME_LEN};
use plugin_shm::{SharedMemoryFactory, SharedMemoryRegion};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::launcher::ChildLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParentState {
    Uninitialized,
    Initialized,
    Listening,
    Launched,
    Connected,
    Hello,
    Loading,
    Running,
    LaunchFailure,
    Error,
    Cleanup,
    Exiting,
    Done,
}

impl ParentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentState::Uninitialized => "uninitialized",
            ParentState::Initialized => "initialized",
            ParentState::Listening => "listening",
            ParentState::Launched => "launched",
            ParentState::Connected => "connected",
            ParentState::Hello => "hello",
            ParentState::Loading => "loading",
            ParentState::Running => "running",
            ParentState::LaunchFailure => "launch_failure",
            ParentState::Error => "error",
            ParentState::Cleanup => "cleanup",
            ParentState::Exiting => "exiting",
            ParentState::Done => "done",
        }
    }
}

impl fmt::Display for ParentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the owner hears back from [`ProcessParent::idle`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParentEvent {
    /// A message from the backend, already stripped of `internal` traffic.
    Message(Message),
    /// The child never connected or could not be started.
    LaunchFailed,
    /// The child went away or stopped answering after it connected.
    Died,
}

#[derive(Debug, Clone)]
pub struct ParentOptions {
    pub launch_timeout: Duration,
    pub load_timeout: Duration,
    pub lockup_timeout: Duration,
    /// Time allowed for a graceful shutdown before the child is killed.
    pub exit_timeout: Duration,
    /// Longest wait inside one [`ProcessParent::idle`] call.
    pub pump_timeout: Duration,
    /// Child tick period, sent once the backend is running.
    pub sleep_time: Option<Duration>,
    pub max_frame_len: usize,
    pub shm_factory: Arc<SharedMemoryFactory>,
}

impl Default for ParentOptions {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(10),
            load_timeout: Duration::from_secs(60),
            lockup_timeout: Duration::from_secs(15),
            exit_timeout: Duration::from_secs(2),
            pump_timeout: Duration::from_millis(1),
            sleep_time: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            shm_factory: SharedMemoryFactory::shared(),
        }
    }
}

impl ParentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            launch_timeout: config.plugin_launch_timeout(),
            load_timeout: config.plugin_load_timeout(),
            lockup_timeout: config.plugin_lockup_timeout(),
            sleep_time: Some(config.child_sleep_time()),
            max_frame_len: config.max_frame_len,
            ..Default::default()
        }
    }
}

/// Host-side manager for one child process.
pub struct ProcessParent<Ln> {
    state: ParentState,
    launcher: Ln,
    options: ParentOptions,
    plugin_dir: String,
    plugin_file: String,
    listener: Option<TcpListener>,
    port: Option<u16>,
    pipe: Option<MessagePipe>,
    deadline: Option<Instant>,
    heartbeat: HeartbeatMonitor,
    blocked: bool,
    regions: HashMap<String, SharedMemoryRegion>,
    pending_removal: HashMap<String, SharedMemoryRegion>,
    message_class_versions: BTreeMap<String, String>,
    plugin_version: String,
    cpu_usage: f64,
    events: Vec<ParentEvent>,
}

impl<Ln: ChildLauncher> ProcessParent<Ln> {
    pub fn new(launcher: Ln, options: ParentOptions) -> Self {
        let heartbeat = HeartbeatMonitor::new(options.lockup_timeout);
        Self {
            state: ParentState::Uninitialized,
            launcher,
            options,
            plugin_dir: String::new(),
            plugin_file: String::new(),
            listener: None,
            port: None,
            pipe: None,
            deadline: None,
            heartbeat,
            blocked: false,
            regions: HashMap::new(),
            pending_removal: HashMap::new(),
            message_class_versions: BTreeMap::new(),
            plugin_version: String::new(),
            cpu_usage: 0.0,
            events: Vec::new(),
        }
    }

    /// Name the backend module the child should load. Launching starts on
    /// the next idle.
    pub fn init(&mut self, plugin_dir: impl Into<String>, plugin_file: impl Into<String>) {
        self.plugin_dir = plugin_dir.into();
        self.plugin_file = plugin_file.into();
        self.set_state(ParentState::Initialized);
    }

    pub fn state(&self) -> ParentState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ParentState::Running
    }

    pub fn is_done(&self) -> bool {
        self.state == ParentState::Done
    }

    /// Whether the backend is waiting on a blocking response from us.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Port the child was told to connect to, once listening.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn launcher(&self) -> &Ln {
        &self.launcher
    }

    pub fn launcher_mut(&mut self) -> &mut Ln {
        &mut self.launcher
    }

    /// Version the backend reported for `class`, empty if unsupported.
    pub fn message_class_version(&self, class: &str) -> &str {
        self.message_class_versions
            .get(class)
            .map_or("", String::as_str)
    }

    pub fn plugin_version(&self) -> &str {
        &self.plugin_version
    }

    /// Heartbeats received since the backend started running.
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeat.beats()
    }

    /// CPU seconds the backend used in the last heartbeat interval.
    pub fn cpu_usage(&self) -> f64 {
        self.cpu_usage
    }

    /// Change the child's tick period, now if running, otherwise once it is.
    pub fn set_sleep_time(&mut self, sleep_time: Duration) {
        self.options.sleep_time = Some(sleep_time);
        if self.is_running() {
            self.send_sleep_time(sleep_time);
        }
    }

    /// Queue a message for the backend.
    ///
    /// A `blocking_response` releases the blocked state set by the
    /// backend's request.
    pub fn send_message(&mut self, message: &Message) {
        if message.is_blocking_response() {
            self.blocked = false;
            self.heartbeat.set_paused(false, Instant::now());
        }
        match self.pipe.as_mut() {
            Some(pipe) => pipe.send(message),
            None => debug!(
                class = message.class(),
                name = message.name(),
                state = %self.state,
                "No pipe to child, dropping message"
            ),
        }
    }

    /// Create a region, remember it and tell the child to attach.
    pub fn add_shared_memory(&mut self, size: usize) -> ProcessResult<String> {
        let wire_size = i32::try_from(size).map_err(|_| {
            ProcessError::Shm(plugin_shm::ShmError::Allocation(format!(
                "region of {} bytes is too large to announce",
                size
            )))
        })?;
        let region = self.options.shm_factory.create(size)?;
        let name = region.name().to_string();

        let mut add = Message::new(MESSAGE_CLASS_INTERNAL, "shm_add");
        add.set_value("name", name.clone());
        add.set_value_s32("size", wire_size);
        self.send_message(&add);

        debug!(name = %name, size, "Added shared memory");
        self.regions.insert(name.clone(), region);
        Ok(name)
    }

    /// Start the two-phase removal of a region.
    ///
    /// The region stays mapped until the child confirms it has unmapped its
    /// view; only then is the segment destroyed.
    pub fn remove_shared_memory(&mut self, name: &str) {
        let Some(region) = self.regions.remove(name) else {
            debug!(name, "Removal of unknown region");
            return;
        };

        if self.pipe.as_ref().map_or(true, MessagePipe::is_broken) {
            destroy_region(region);
            return;
        }

        let mut remove = Message::new(MESSAGE_CLASS_INTERNAL, "shm_remove");
        remove.set_value("name", name);
        self.send_message(&remove);
        self.pending_removal.insert(name.to_string(), region);
    }

    /// Region by name, if it is live (not pending removal).
    pub fn shared_memory(&self, name: &str) -> Option<&SharedMemoryRegion> {
        self.regions.get(name)
    }

    pub fn shared_memory_mut(&mut self, name: &str) -> Option<&mut SharedMemoryRegion> {
        self.regions.get_mut(name)
    }

    /// Base address of this process's view of a live region.
    pub fn shared_memory_address(&self, name: &str) -> Option<*mut u8> {
        self.regions.get(name).map(SharedMemoryRegion::as_ptr)
    }

    /// Size of a live region, 0 if unknown.
    pub fn shared_memory_size(&self, name: &str) -> usize {
        self.regions.get(name).map_or(0, SharedMemoryRegion::len)
    }

    pub fn is_pending_removal(&self, name: &str) -> bool {
        self.pending_removal.contains_key(name)
    }

    /// Ask the child to unload its backend and exit. Falls back to killing
    /// it after the exit timeout.
    pub fn shutdown(&mut self) {
        if self.state >= ParentState::LaunchFailure {
            return;
        }
        if self.pipe.is_some() {
            info!(state = %self.state, "Requesting plugin shutdown");
            self.send_message(&Message::new(MESSAGE_CLASS_BASE, "cleanup"));
            self.deadline = Some(Instant::now() + self.options.exit_timeout);
            self.set_state(ParentState::Exiting);
        } else {
            self.set_state(ParentState::Cleanup);
        }
    }

    /// Tear the child down now.
    pub fn exit(&mut self) {
        if self.state < ParentState::Cleanup {
            self.set_state(ParentState::Cleanup);
        }
    }

    /// Advance the state machine and move pipe traffic. Waits at most
    /// about one pump timeout.
    pub async fn idle(&mut self) -> Vec<ParentEvent> {
        loop {
            let again = self.step().await;
            if !again {
                break;
            }
        }
        std::mem::take(&mut self.events)
    }

    async fn step(&mut self) -> bool {
        let now = Instant::now();
        match self.state {
            ParentState::Uninitialized | ParentState::Done => false,

            ParentState::Initialized => {
                match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
                    Ok(listener) => {
                        self.port = listener.local_addr().ok().map(|addr| addr.port());
                        self.listener = Some(listener);
                        self.set_state(ParentState::Listening);
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to listen for plugin child");
                        self.set_state(ParentState::LaunchFailure);
                    }
                }
                true
            }

            ParentState::Listening => {
                let Some(port) = self.port else {
                    self.set_state(ParentState::LaunchFailure);
                    return true;
                };
                match self.launcher.launch(port) {
                    Ok(()) => {
                        self.deadline = Some(now + self.options.launch_timeout);
                        self.set_state(ParentState::Launched);
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to launch plugin child");
                        self.set_state(ParentState::LaunchFailure);
                    }
                }
                true
            }

            ParentState::Launched => {
                let accepted = match self.listener.as_ref() {
                    Some(listener) => {
                        tokio::time::timeout(self.options.pump_timeout, listener.accept()).await
                    }
                    None => {
                        self.set_state(ParentState::LaunchFailure);
                        return true;
                    }
                };
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        match MessagePipe::from_stream(stream) {
                            Ok(pipe) => {
                                debug!(peer = %peer, "Plugin child connected");
                                self.pipe =
                                    Some(pipe.with_max_frame_len(self.options.max_frame_len));
                                self.listener = None;
                                self.deadline = Some(now + self.options.launch_timeout);
                                self.set_state(ParentState::Connected);
                            }
                            Err(err) => {
                                error!(error = %err, "Failed to set up pipe to child");
                                self.set_state(ParentState::LaunchFailure);
                            }
                        }
                        true
                    }
                    Ok(Err(err)) => {
                        error!(error = %err, "Accepting plugin child failed");
                        self.set_state(ParentState::LaunchFailure);
                        true
                    }
                    Err(_elapsed) => {
                        if self.launcher.has_exited() {
                            warn!("Plugin child exited before connecting");
                            self.set_state(ParentState::LaunchFailure);
                            true
                        } else if self.deadline_passed(Instant::now()) {
                            warn!("Plugin child did not connect in time");
                            self.set_state(ParentState::LaunchFailure);
                            true
                        } else {
                            false
                        }
                    }
                }
            }

            ParentState::Connected => {
                self.pump().await;
                if self.state == ParentState::Connected && self.deadline_passed(now) {
                    warn!("Plugin child never said hello");
                    self.set_state(ParentState::Error);
                }
                self.state != ParentState::Connected
            }

            ParentState::Hello => {
                let mut load = Message::new(MESSAGE_CLASS_INTERNAL, "load_plugin");
                load.set_value("dir", self.plugin_dir.clone());
                load.set_value("file", self.plugin_file.clone());
                self.send_message(&load);
                self.deadline = Some(now + self.options.load_timeout);
                self.set_state(ParentState::Loading);
                false
            }

            ParentState::Loading => {
                self.pump().await;
                if self.state == ParentState::Loading && self.deadline_passed(now) {
                    warn!(
                        file = %self.plugin_file,
                        "Plugin did not finish loading in time"
                    );
                    self.set_state(ParentState::Error);
                }
                self.state != ParentState::Loading
            }

            ParentState::Running => {
                self.pump().await;
                if self.state == ParentState::Running && self.heartbeat.is_locked_up(Instant::now()) {
                    warn!(
                        beats = self.heartbeat.beats(),
                        "Plugin child stopped sending heartbeats"
                    );
                    self.set_state(ParentState::Error);
                }
                self.state != ParentState::Running
            }

            ParentState::LaunchFailure => {
                self.events.push(ParentEvent::LaunchFailed);
                self.set_state(ParentState::Cleanup);
                true
            }

            ParentState::Error => {
                self.events.push(ParentEvent::Died);
                self.set_state(ParentState::Cleanup);
                true
            }

            ParentState::Exiting => {
                if self.pipe.as_ref().is_some_and(|pipe| !pipe.is_broken()) {
                    self.pump().await;
                }
                let finished = self.pipe.as_ref().map_or(true, MessagePipe::is_broken)
                    || self.launcher.has_exited();
                if finished || self.deadline_passed(Instant::now()) {
                    self.set_state(ParentState::Cleanup);
                    true
                } else {
                    false
                }
            }

            ParentState::Cleanup => {
                self.launcher.terminate();
                self.listener = None;
                if let Some(mut pipe) = self.pipe.take() {
                    pipe.close().await;
                }
                for (_, region) in self.regions.drain().chain(self.pending_removal.drain()) {
                    destroy_region(region);
                }
                self.blocked = false;
                self.set_state(ParentState::Done);
                false
            }
        }
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    async fn pump(&mut self) {
        let Some(pipe) = self.pipe.as_mut() else {
            self.pipe_lost();
            return;
        };
        match pipe.pump(self.options.pump_timeout).await {
            Ok(messages) => {
                for message in messages {
                    self.receive_from_child(message);
                }
                if self.pipe.as_ref().is_some_and(MessagePipe::is_broken) {
                    self.pipe_lost();
                }
            }
            Err(err) => {
                debug!(error = %err, state = %self.state, "Pipe to child failed");
                self.pipe_lost();
            }
        }
    }

    fn pipe_lost(&mut self) {
        if self.state < ParentState::LaunchFailure {
            warn!(state = %self.state, "Lost connection to plugin child");
            self.set_state(ParentState::Error);
        }
    }

    fn receive_from_child(&mut self, message: Message) {
        if message.class() != MESSAGE_CLASS_INTERNAL {
            if message.is_blocking_request() {
                debug!(
                    class = message.class(),
                    name = message.name(),
                    "Plugin is blocked on a request"
                );
                self.blocked = true;
                self.heartbeat.set_paused(true, Instant::now());
            }
            self.events.push(ParentEvent::Message(message));
            return;
        }

        match message.name() {
            "hello" => {
                if self.state == ParentState::Connected {
                    self.set_state(ParentState::Hello);
                } else {
                    warn!(state = %self.state, "Unexpected hello");
                }
            }
            "load_plugin_response" => {
                self.message_class_versions = match message.get_value_structured("versions") {
                    Some(Value::Map(versions)) => versions
                        .iter()
                        .map(|(class, version)| (class.clone(), version.to_text()))
                        .collect(),
                    _ => BTreeMap::new(),
                };
                self.plugin_version = message.get_value("plugin_version");
                if self.state == ParentState::Loading {
                    info!(
                        plugin_version = %self.plugin_version,
                        classes = self.message_class_versions.len(),
                        "Plugin running"
                    );
                    self.heartbeat.start(Instant::now());
                    self.set_state(ParentState::Running);
                    if let Some(sleep_time) = self.options.sleep_time {
                        self.send_sleep_time(sleep_time);
                    }
                }
            }
            "heartbeat" => {
                self.heartbeat.beat(Instant::now());
                self.cpu_usage = message.get_value_real("cpu_usage");
                trace!(cpu_usage = self.cpu_usage, "Heartbeat");
            }
            "shm_remove_response" => {
                let name = message.get_value("name");
                match self.pending_removal.remove(&name) {
                    Some(region) => destroy_region(region),
                    None => debug!(name = %name, "Removal confirmed for unknown region"),
                }
            }
            other => warn!(name = other, "Unknown internal message from child"),
        }
    }

    fn send_sleep_time(&mut self, sleep_time: Duration) {
        let mut message = Message::new(MESSAGE_CLASS_INTERNAL, "sleep_time");
        message.set_value_real("time", sleep_time.as_secs_f64());
        self.send_message(&message);
    }

    fn set_state(&mut self, state: ParentState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Parent state change");
            self.state = state;
        }
    }
}

fn destroy_region(region: SharedMemoryRegion) {
    let name = region.name().to_string();
    match region.destroy() {
        Ok(()) => debug!(name = %name, "Destroyed shared memory"),
        Err(err) => warn!(name = %name, error = %err, "Failed to destroy shared memory"),
    }
}

impl<Ln> Drop for ProcessParent<Ln> {
    fn drop(&mut self) {
        if !self.pending_removal.is_empty() {
            debug!(
                count = self.pending_removal.len(),
                "Dropping regions still awaiting removal"
            );
        }
    }
}
