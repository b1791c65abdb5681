//! Loaded backend and the message queue it writes into.

use std::collections::VecDeque;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PluginLoadError, PluginResult};
use crate::ffi::{
    symbol_name, PluginIdleFn, PluginInitFn, SendMessageFn, PLUGIN_IDLE_ENTRY_POINT,
    PLUGIN_INIT_ENTRY_POINT,
};

/// Messages the backend has sent to the host and nobody has drained yet.
#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<String>>,
}

/// Host-side receive function handed to the backend.
///
/// Only enqueues. The child drains the queue after each call into the
/// backend, so a message sent from inside `send_message` never re-enters
/// child logic.
unsafe extern "C" fn receive_from_plugin(message: *const c_char, user_data: *mut *mut c_void) {
    if message.is_null() || user_data.is_null() {
        return;
    }
    let inbox = *user_data as *const Inbox;
    if inbox.is_null() {
        return;
    }
    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
    (*inbox).queue.lock().push_back(text);
}

/// One loaded backend.
///
/// Holds the backend's send function and context, plus the module itself
/// so the code stays mapped for as long as the pointers are reachable.
pub struct PluginInstance {
    plugin_send: SendMessageFn,
    plugin_user_data: *mut c_void,
    idle_fn: Option<PluginIdleFn>,
    inbox: Arc<Inbox>,
    cpu_time: Duration,
    // Dropped last: every pointer above may point into this module.
    _library: Option<Library>,
}

impl PluginInstance {
    /// Load the module at `path` and run its init entry point.
    pub fn load(path: &Path) -> PluginResult<Self> {
        info!(path = %path.display(), "Loading plugin");

        // SAFETY: loading runs the module's initializers; the module is
        // trusted to the same degree as the child process itself.
        let library = unsafe { Library::new(path) }.map_err(|e| PluginLoadError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // SAFETY: the exported symbol is declared with the PluginInitFn ABI.
        let init: PluginInitFn = unsafe {
            *library
                .get::<PluginInitFn>(PLUGIN_INIT_ENTRY_POINT)
                .map_err(|e| PluginLoadError::EntryPoint {
                    symbol: symbol_name(PLUGIN_INIT_ENTRY_POINT),
                    reason: e.to_string(),
                })?
        };
        // SAFETY: as above, for the optional idle hook.
        let idle: Option<PluginIdleFn> =
            unsafe { library.get::<PluginIdleFn>(PLUGIN_IDLE_ENTRY_POINT) }
                .ok()
                .map(|symbol| *symbol);

        Self::init(init, idle, Some(library))
    }

    /// Initialise a backend linked into this binary.
    pub fn from_entry_point(init: PluginInitFn, idle: Option<PluginIdleFn>) -> PluginResult<Self> {
        Self::init(init, idle, None)
    }

    fn init(
        init: PluginInitFn,
        idle_fn: Option<PluginIdleFn>,
        library: Option<Library>,
    ) -> PluginResult<Self> {
        let inbox = Arc::new(Inbox::default());
        let host_user_data = Arc::as_ptr(&inbox) as *mut c_void;
        let mut plugin_send: Option<SendMessageFn> = None;
        let mut plugin_user_data: *mut c_void = ptr::null_mut();

        // SAFETY: the out-pointers are valid locals and the inbox outlives
        // the instance that hands its address out.
        let code = unsafe {
            init(
                receive_from_plugin,
                host_user_data,
                &mut plugin_send,
                &mut plugin_user_data,
            )
        };
        if code != 0 {
            warn!(code, "Plugin init entry point failed");
            return Err(PluginLoadError::InitFailed(code));
        }
        let Some(plugin_send) = plugin_send else {
            return Err(PluginLoadError::EntryPoint {
                symbol: symbol_name(PLUGIN_INIT_ENTRY_POINT),
                reason: "init did not provide a send function".to_string(),
            });
        };

        debug!(has_idle = idle_fn.is_some(), "Plugin initialised");
        Ok(Self {
            plugin_send,
            plugin_user_data,
            idle_fn,
            inbox,
            cpu_time: Duration::ZERO,
            _library: library,
        })
    }

    /// Hand one message to the backend.
    ///
    /// Replies the backend sends while handling it are queued, not
    /// delivered; collect them with [`drain_messages`](Self::drain_messages).
    pub fn send_message(&mut self, message: &str) -> PluginResult<()> {
        let text =
            CString::new(message).map_err(|e| PluginLoadError::InvalidMessage(e.to_string()))?;
        let start = Instant::now();
        // SAFETY: the send function came from init and the module is still
        // loaded; the context pointer is the one the backend gave us.
        unsafe { (self.plugin_send)(text.as_ptr(), &mut self.plugin_user_data) };
        self.cpu_time += start.elapsed();
        Ok(())
    }

    /// Tick the backend's idle hook, if it exported one.
    pub fn idle(&mut self) {
        let Some(idle) = self.idle_fn else {
            return;
        };
        if self.plugin_user_data.is_null() {
            return;
        }
        let start = Instant::now();
        // SAFETY: same provenance as in send_message.
        unsafe { idle(self.plugin_user_data) };
        self.cpu_time += start.elapsed();
    }

    /// Take every message the backend has sent since the last drain.
    pub fn drain_messages(&self) -> Vec<String> {
        self.inbox.queue.lock().drain(..).collect()
    }

    /// Time spent inside the backend since the last call.
    pub fn take_cpu_time(&mut self) -> Duration {
        std::mem::take(&mut self.cpu_time)
    }

    pub fn has_idle_hook(&self) -> bool {
        self.idle_fn.is_some()
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("dynamic", &self._library.is_some())
            .field("has_idle_hook", &self.idle_fn.is_some())
            .field("queued", &self.inbox.queue.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_int;
    use std::path::PathBuf;

    /// Minimal backend: echoes every message and counts idle ticks.
    struct EchoBackend {
        host_send: SendMessageFn,
        host_user_data: *mut c_void,
        idles: u32,
    }

    impl EchoBackend {
        unsafe fn reply(&mut self, text: &str) {
            let text = CString::new(text).unwrap();
            (self.host_send)(text.as_ptr(), &mut self.host_user_data);
        }
    }

    unsafe extern "C" fn echo_send(message: *const c_char, user_data: *mut *mut c_void) {
        let backend = &mut *(*user_data as *mut EchoBackend);
        let text = CStr::from_ptr(message).to_str().unwrap().to_string();
        if text == "idles" {
            let count = backend.idles.to_string();
            backend.reply(&count);
            return;
        }
        backend.reply(&format!("echo:{text}"));
        if text == "twice" {
            backend.reply("echo:again");
        }
        if text == "cleanup" {
            drop(Box::from_raw(backend as *mut EchoBackend));
            *user_data = ptr::null_mut();
        }
    }

    unsafe extern "C" fn echo_idle(user_data: *mut c_void) {
        let backend = &mut *(user_data as *mut EchoBackend);
        backend.idles += 1;
    }

    unsafe extern "C" fn echo_init(
        host_send: SendMessageFn,
        host_user_data: *mut c_void,
        plugin_send: *mut Option<SendMessageFn>,
        plugin_user_data: *mut *mut c_void,
    ) -> c_int {
        let mut backend = Box::new(EchoBackend {
            host_send,
            host_user_data,
            idles: 0,
        });
        backend.reply("ready");
        *plugin_send = Some(echo_send);
        *plugin_user_data = Box::into_raw(backend) as *mut c_void;
        0
    }

    unsafe extern "C" fn failing_init(
        _host_send: SendMessageFn,
        _host_user_data: *mut c_void,
        _plugin_send: *mut Option<SendMessageFn>,
        _plugin_user_data: *mut *mut c_void,
    ) -> c_int {
        3
    }

    unsafe extern "C" fn silent_init(
        _host_send: SendMessageFn,
        _host_user_data: *mut c_void,
        _plugin_send: *mut Option<SendMessageFn>,
        _plugin_user_data: *mut *mut c_void,
    ) -> c_int {
        0
    }

    #[test]
    fn test_init_exchanges_send_functions() {
        let mut instance = PluginInstance::from_entry_point(echo_init, None).unwrap();
        assert_eq!(instance.drain_messages(), vec!["ready".to_string()]);

        instance.send_message("hello").unwrap();
        assert_eq!(instance.drain_messages(), vec!["echo:hello".to_string()]);
        assert!(instance.drain_messages().is_empty());

        instance.send_message("cleanup").unwrap();
    }

    #[test]
    fn test_replies_are_queued_in_order() {
        let mut instance = PluginInstance::from_entry_point(echo_init, None).unwrap();
        instance.drain_messages();

        instance.send_message("one").unwrap();
        instance.send_message("twice").unwrap();
        assert_eq!(
            instance.drain_messages(),
            vec!["echo:one", "echo:twice", "echo:again"]
        );
        instance.send_message("cleanup").unwrap();
    }

    #[test]
    fn test_idle_hook_runs_until_context_cleared() {
        let mut instance = PluginInstance::from_entry_point(echo_init, Some(echo_idle)).unwrap();
        assert!(instance.has_idle_hook());
        instance.idle();
        instance.idle();
        instance.drain_messages();

        instance.send_message("idles").unwrap();
        assert_eq!(instance.drain_messages(), vec!["2"]);

        instance.send_message("cleanup").unwrap();
        // Context is gone; idle must not touch it.
        instance.idle();
    }

    #[test]
    fn test_init_failure_reports_code() {
        let err = PluginInstance::from_entry_point(failing_init, None).unwrap_err();
        assert!(matches!(err, PluginLoadError::InitFailed(3)));
    }

    #[test]
    fn test_init_without_send_function() {
        let err = PluginInstance::from_entry_point(silent_init, None).unwrap_err();
        assert!(matches!(err, PluginLoadError::EntryPoint { .. }));
    }

    #[test]
    fn test_message_with_nul_is_rejected() {
        let mut instance = PluginInstance::from_entry_point(echo_init, None).unwrap();
        let err = instance.send_message("bad\0text").unwrap_err();
        assert!(matches!(err, PluginLoadError::InvalidMessage(_)));
        instance.send_message("cleanup").unwrap();
    }

    #[test]
    fn test_cpu_time_is_taken_once() {
        let mut instance = PluginInstance::from_entry_point(echo_init, None).unwrap();
        instance.send_message("x").unwrap();
        let _ = instance.take_cpu_time();
        assert_eq!(instance.take_cpu_time(), Duration::ZERO);
        instance.send_message("cleanup").unwrap();
    }

    #[test]
    fn test_load_missing_module() {
        let path = PathBuf::from("/nonexistent/slplugin/libmissing_backend.so");
        let err = PluginInstance::load(&path).unwrap_err();
        match err {
            PluginLoadError::Load { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
