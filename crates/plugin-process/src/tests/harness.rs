//! Test harness for plugin process tests.
//!
//! Provides:
//! - A stub media backend behind the real C entry-point ABI
//! - StubLoader: hands the stub to the child instead of a dylib
//! - InProcessLauncher: "launches" the child inside the test thread
//! - PluginPair / MediaPair: step a host and a child in lockstep over a
//!   real loopback pipe

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::ptr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use plugin_instance::{PluginInstance, PluginLoadError, PluginResult, SendMessageFn};
use plugin_message::{message_class_versions, Message, Value};
use plugin_shm::SharedMemoryFactory;

use crate::child::{ChildOptions, PluginLoader, ProcessChild};
use crate::error::{ProcessError, ProcessResult};
use crate::launcher::ChildLauncher;
use crate::media::{MediaEvent, MediaOptions, MediaSession};
use crate::parent::{ParentEvent, ParentOptions, ProcessParent};

/// How long any scenario may wait for a condition.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte the stub writes at offset 0 of every region it is given.
pub const SHM_MARKER: u8 = 0xa5;

/// Byte the stub paints the texture with on size_change.
pub const TEXTURE_FILL: u8 = 0x5a;

pub const STUB_PLUGIN_VERSION: &str = "stub 1.0";

/// Whether the sandbox lets us listen and connect on loopback. Tests
/// return early when it does not.
pub fn loopback_ready() -> bool {
    let ready = std::net::TcpListener::bind("127.0.0.1:0").is_ok();
    if !ready {
        eprintln!("skipping: loopback sockets unavailable");
    }
    ready
}

/// Loopback plus shared memory.
pub fn shm_ready() -> bool {
    if !loopback_ready() {
        return false;
    }
    let ready = SharedMemoryFactory::with_prefix("slpprobe").create(64).is_ok();
    if !ready {
        eprintln!("skipping: shared memory unavailable");
    }
    ready
}

// ---------------------------------------------------------------------------
// Stub backend
// ---------------------------------------------------------------------------

/// What the stub saw, per test thread.
#[derive(Default)]
struct StubLog {
    received: Vec<String>,
    idles: u32,
    regions: HashMap<String, (u64, usize)>,
}

thread_local! {
    static STUB_LOG: RefCell<StubLog> = RefCell::new(StubLog::default());
}

/// `class.name` of every message the stub received, except `base.idle`.
pub fn stub_received() -> Vec<String> {
    STUB_LOG.with(|log| log.borrow().received.clone())
}

pub fn stub_idles() -> u32 {
    STUB_LOG.with(|log| log.borrow().idles)
}

/// Regions the stub currently knows, by name.
pub fn stub_regions() -> Vec<String> {
    STUB_LOG.with(|log| log.borrow().regions.keys().cloned().collect())
}

pub fn stub_reset() {
    STUB_LOG.with(|log| *log.borrow_mut() = StubLog::default());
}

struct StubBackend {
    host_send: SendMessageFn,
    host_user_data: *mut c_void,
    hold_removals: bool,
    held: Vec<String>,
}

impl StubBackend {
    unsafe fn reply(&mut self, message: &Message) {
        let text = CString::new(message.generate().unwrap()).unwrap();
        (self.host_send)(text.as_ptr(), &mut self.host_user_data);
    }

    unsafe fn confirm_removal(&mut self, name: &str) {
        STUB_LOG.with(|log| log.borrow_mut().regions.remove(name));
        let mut response = Message::new("base", "shm_remove_response");
        response.set_value("name", name);
        self.reply(&response);
    }

    unsafe fn handle(&mut self, message: &Message) {
        match (message.class(), message.name()) {
            ("base", "init") => {
                let versions = message_class_versions()
                    .into_iter()
                    .map(|(class, version)| (class, Value::String(version)))
                    .collect();
                let mut response = Message::new("base", "init_response");
                response.set_value_structured("versions", Value::Map(versions));
                response.set_value("plugin_version", STUB_PLUGIN_VERSION);
                self.reply(&response);
            }
            ("base", "shm_added") => {
                let name = message.get_value("name");
                let size = message.get_value_s32("size") as usize;
                let address = message.get_value_pointer("address").unwrap().token();
                if size > 0 {
                    *(address as usize as *mut u8) = SHM_MARKER;
                }
                STUB_LOG.with(|log| log.borrow_mut().regions.insert(name, (address, size)));
            }
            ("base", "shm_remove") => {
                let name = message.get_value("name");
                if self.hold_removals {
                    self.held.push(name);
                } else {
                    self.confirm_removal(&name);
                }
            }
            ("media", "init") => {
                let mut params = Message::new("media", "texture_params");
                params.set_value_s32("depth", 4);
                params.set_value_s32("default_width", 64);
                params.set_value_s32("default_height", 32);
                params.set_value_s32("padding", 0);
                self.reply(&params);
            }
            ("media", "size_change") => {
                let name = message.get_value("name");
                let width = message.get_value_s32("width");
                let height = message.get_value_s32("height");
                let region = STUB_LOG.with(|log| log.borrow().regions.get(&name).copied());
                if let Some((address, size)) = region {
                    ptr::write_bytes(address as usize as *mut u8, TEXTURE_FILL, size);
                }

                let mut response = Message::new("media", "size_change_response");
                response.set_value("name", name);
                response.set_value_s32("width", width);
                response.set_value_s32("height", height);
                response.set_value_s32("texture_width", message.get_value_s32("texture_width"));
                response.set_value_s32("texture_height", message.get_value_s32("texture_height"));
                self.reply(&response);

                // Rows reported flipped, the way GL backends do.
                let mut updated = Message::new("media", "updated");
                updated.set_value_s32("left", 0);
                updated.set_value_s32("top", 0);
                updated.set_value_s32("right", width);
                updated.set_value_s32("bottom", height);
                self.reply(&updated);
            }
            ("media", "load_uri") => {
                let mut status = Message::new("media", "media_status");
                status.set_value("status", "loading");
                self.reply(&status);

                let mut location = Message::new("media_browser", "location_changed");
                location.set_value("uri", message.get_value("uri"));
                self.reply(&location);
            }
            ("media", "pick_file_response") => {
                let mut picked = Message::new("test", "picked");
                picked.set_value("file", message.get_value("file"));
                self.reply(&picked);
            }
            ("test", "echo") => {
                let mut response = Message::new("test", "echo_response");
                response.set_value_s32("seq", message.get_value_s32("seq"));
                self.reply(&response);
            }
            ("test", "request_pick") => {
                let mut request = Message::new("media", "pick_file");
                request.set_value_boolean("blocking_request", true);
                self.reply(&request);
            }
            ("test", "exit") => self.reply(&Message::new("base", "force_exit")),
            ("test", "hold_removals") => self.hold_removals = true,
            ("test", "release_removals") => {
                self.hold_removals = false;
                for name in std::mem::take(&mut self.held) {
                    self.confirm_removal(&name);
                }
            }
            _ => {}
        }
    }
}

unsafe extern "C" fn stub_send(message: *const c_char, user_data: *mut *mut c_void) {
    let backend = *user_data as *mut StubBackend;
    if backend.is_null() {
        return;
    }
    let text = CStr::from_ptr(message).to_str().unwrap();
    let message = Message::parse(text).unwrap();
    if !message.is("base", "idle") {
        STUB_LOG.with(|log| {
            log.borrow_mut()
                .received
                .push(format!("{}.{}", message.class(), message.name()))
        });
    }

    if message.is("base", "cleanup") {
        drop(Box::from_raw(backend));
        *user_data = ptr::null_mut();
        return;
    }
    (*backend).handle(&message);
}

unsafe extern "C" fn stub_idle(_user_data: *mut c_void) {
    STUB_LOG.with(|log| log.borrow_mut().idles += 1);
}

unsafe extern "C" fn stub_init(
    host_send: SendMessageFn,
    host_user_data: *mut c_void,
    plugin_send: *mut Option<SendMessageFn>,
    plugin_user_data: *mut *mut c_void,
) -> c_int {
    let backend = Box::new(StubBackend {
        host_send,
        host_user_data,
        hold_removals: false,
        held: Vec::new(),
    });
    *plugin_send = Some(stub_send);
    *plugin_user_data = Box::into_raw(backend) as *mut c_void;
    0
}

/// Loads the stub for any file except one named `missing`.
pub struct StubLoader;

impl PluginLoader for StubLoader {
    fn load(&mut self, path: &Path) -> PluginResult<PluginInstance> {
        if path.file_name().is_some_and(|name| name == "missing") {
            return Err(PluginLoadError::Load {
                path: path.to_path_buf(),
                reason: "no such module".to_string(),
            });
        }
        PluginInstance::from_entry_point(stub_init, Some(stub_idle))
    }
}

// ---------------------------------------------------------------------------
// In-process child
// ---------------------------------------------------------------------------

/// Shared between the launcher the host owns and the test driving the child.
#[derive(Clone, Default)]
pub struct LaunchHandle {
    port: Rc<Cell<Option<u16>>>,
    exited: Rc<Cell<bool>>,
    terminated: Rc<Cell<bool>>,
}

pub struct InProcessLauncher {
    handle: LaunchHandle,
    fail: bool,
}

impl ChildLauncher for InProcessLauncher {
    fn launch(&mut self, port: u16) -> ProcessResult<()> {
        if self.fail {
            return Err(ProcessError::Launch("refused by test".to_string()));
        }
        self.handle.port.set(Some(port));
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        self.handle.exited.get()
    }

    fn terminate(&mut self) {
        self.handle.terminated.set(true);
    }
}

/// The child half of a pair.
pub struct ChildSide {
    handle: LaunchHandle,
    options: ChildOptions,
    child: Option<ProcessChild<StubLoader>>,
    /// Start a child once the host has launched one.
    pub spawn: bool,
    /// Stop stepping the child, as if it hung.
    pub frozen: bool,
}

impl ChildSide {
    fn new(handle: LaunchHandle, options: ChildOptions) -> Self {
        Self {
            handle,
            options,
            child: None,
            spawn: true,
            frozen: false,
        }
    }

    pub fn get(&self) -> Option<&ProcessChild<StubLoader>> {
        self.child.as_ref()
    }

    /// Drop the child without any goodbye, like a crash.
    pub fn kill(&mut self) {
        self.spawn = false;
        self.child = None;
        self.handle.exited.set(true);
    }

    async fn step(&mut self) {
        if self.frozen {
            return;
        }
        if self.handle.terminated.get() {
            if self.child.take().is_some() {
                self.handle.exited.set(true);
            }
            return;
        }
        if self.child.is_none() && self.spawn {
            if let Some(port) = self.handle.port.get() {
                let mut child = ProcessChild::new(StubLoader, self.options.clone());
                child.init(port);
                self.child = Some(child);
            }
        }
        if let Some(child) = self.child.as_mut() {
            if child.is_done() {
                self.handle.exited.set(true);
                return;
            }
            child.idle().await;
            child.pump(Duration::from_millis(1)).await;
        }
    }
}

pub fn test_child_options() -> ChildOptions {
    ChildOptions {
        sleep_time: Duration::from_millis(1),
        heartbeat_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn test_parent_options() -> ParentOptions {
    ParentOptions {
        launch_timeout: SCENARIO_TIMEOUT,
        load_timeout: SCENARIO_TIMEOUT,
        lockup_timeout: SCENARIO_TIMEOUT,
        exit_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// A host and child stepped together on the test thread.
pub struct PluginPair {
    pub parent: ProcessParent<InProcessLauncher>,
    pub child: ChildSide,
    pub events: Vec<ParentEvent>,
}

impl PluginPair {
    pub fn new() -> Self {
        Self::with_options(test_parent_options(), test_child_options())
    }

    pub fn with_options(parent_options: ParentOptions, child_options: ChildOptions) -> Self {
        stub_reset();
        let handle = LaunchHandle::default();
        let launcher = InProcessLauncher {
            handle: handle.clone(),
            fail: false,
        };
        Self {
            parent: ProcessParent::new(launcher, parent_options),
            child: ChildSide::new(handle, child_options),
            events: Vec::new(),
        }
    }

    /// Make the next launch fail outright.
    pub fn refuse_launch(&mut self) {
        self.parent.launcher_mut().fail = true;
    }

    pub async fn step(&mut self) {
        let events = self.parent.idle().await;
        self.events.extend(events);
        self.child.step().await;
    }

    /// Step until `done` holds or the scenario times out.
    pub async fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + SCENARIO_TIMEOUT;
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            self.step().await;
        }
        done(self)
    }

    pub async fn run_for(&mut self, duration: Duration) {
        let until = Instant::now() + duration;
        while Instant::now() < until {
            self.step().await;
        }
    }

    /// Init against the stub and run until the backend is running.
    pub async fn start(&mut self) -> bool {
        self.parent.init("", "stub");
        self.run_until(|pair| pair.parent.is_running()).await
    }

    /// Backend messages the host has surfaced with this class and name.
    pub fn messages(&self, class: &str, name: &str) -> Vec<&Message> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ParentEvent::Message(message) if message.is(class, name) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn died(&self) -> bool {
        self.events.contains(&ParentEvent::Died)
    }

    pub fn send(&mut self, message: Message) {
        self.parent.send_message(&message);
    }
}

/// A media session and its child.
pub struct MediaPair {
    pub media: MediaSession<InProcessLauncher>,
    pub child: ChildSide,
    pub events: Vec<MediaEvent>,
}

impl MediaPair {
    pub fn new() -> Self {
        stub_reset();
        let handle = LaunchHandle::default();
        let launcher = InProcessLauncher {
            handle: handle.clone(),
            fail: false,
        };
        let options = MediaOptions {
            parent: test_parent_options(),
            target: "test-target".to_string(),
            ..Default::default()
        };
        Self {
            media: MediaSession::new(launcher, options),
            child: ChildSide::new(handle, test_child_options()),
            events: Vec::new(),
        }
    }

    pub async fn step(&mut self) {
        let events = self.media.idle().await;
        self.events.extend(events);
        self.child.step().await;
    }

    /// Step until `done` holds or the scenario times out.
    pub async fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + SCENARIO_TIMEOUT;
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            self.step().await;
        }
        done(self)
    }
}
