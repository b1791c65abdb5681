//! Host-side media session on top of [`ProcessParent`].
//!
//! Owns the texture region the backend renders into, negotiates its size,
//! queues commands until the child is running and turns backend messages
//! into [`MediaEvent`]s.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use plugin_message::{
    Message, Value, MESSAGE_CLASS_INTERNAL, MESSAGE_CLASS_MEDIA, MESSAGE_CLASS_MEDIA_BROWSER,
    MESSAGE_CLASS_MEDIA_TIME,
};
use plugin_shm::SharedMemoryRegion;
use tracing::{debug, trace, warn};

use crate::launcher::ChildLauncher;
use crate::parent::{ParentEvent, ParentOptions, ProcessParent};

/// Largest media dimension ever requested from a backend.
pub const MAX_MEDIA_DIMENSION: i32 = 2048;

/// Default size cap for low-priority media when downsampling is allowed.
pub const LOW_PRIORITY_TEXTURE_SIZE_DEFAULT: i32 = 256;

/// Bytes per pixel accepted from a backend's texture params.
pub const MAX_TEXTURE_DEPTH: i32 = 16;

/// Smallest power of two not below `value` (1 for anything below 2).
pub fn next_power_of_2(value: i32) -> i32 {
    let mut next = 1i32;
    while next < value && next < (1 << 30) {
        next <<= 1;
    }
    next
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Unloaded,
    Stopped,
    Hidden,
    Slideshow,
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Unloaded => "unloaded",
            Priority::Stopped => "stopped",
            Priority::Hidden => "hidden",
            Priority::Slideshow => "slideshow",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    /// Child tick period for media at this priority.
    pub fn sleep_time(&self) -> Duration {
        match self {
            Priority::Unloaded | Priority::Stopped | Priority::Hidden | Priority::Slideshow => {
                Duration::from_secs(1)
            }
            Priority::Low => Duration::from_secs_f64(1.0 / 25.0),
            Priority::Normal => Duration::from_secs_f64(1.0 / 50.0),
            Priority::High => Duration::from_secs_f64(1.0 / 100.0),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaStatus {
    #[default]
    None,
    Loading,
    Loaded,
    Error,
    Playing,
    Paused,
    Done,
}

impl MediaStatus {
    /// Unknown and empty strings map to [`MediaStatus::None`].
    pub fn from_wire(status: &str) -> Self {
        match status {
            "loading" => MediaStatus::Loading,
            "loaded" => MediaStatus::Loaded,
            "error" => MediaStatus::Error,
            "playing" => MediaStatus::Playing,
            "paused" => MediaStatus::Paused,
            "done" => MediaStatus::Done,
            _ => MediaStatus::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEventType {
    Down,
    Up,
    Move,
    DoubleClick,
}

impl MouseEventType {
    fn as_str(&self) -> &'static str {
        match self {
            MouseEventType::Down => "down",
            MouseEventType::Up => "up",
            MouseEventType::Move => "move",
            MouseEventType::DoubleClick => "double_click",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventType {
    Down,
    Up,
    Repeat,
}

impl KeyEventType {
    fn as_str(&self) -> &'static str {
        match self {
            KeyEventType::Down => "down",
            KeyEventType::Up => "up",
            KeyEventType::Repeat => "repeat",
        }
    }
}

/// Keyboard modifiers held during an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub control: bool,
    pub alt: bool,
    pub shift: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        control: false,
        alt: false,
        shift: false,
    };

    /// Wire form, e.g. `"control|shift|"`.
    pub fn to_wire(&self) -> String {
        let mut result = String::new();
        if self.control {
            result.push_str("control|");
        }
        if self.alt {
            result.push_str("alt|");
        }
        if self.shift {
            result.push_str("shift|");
        }
        result
    }
}

/// Area of the texture changed since the owner last reset it.
///
/// Uses bottom-left origin: `top >= bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DirtyRect {
    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.bottom >= self.top
    }

    pub fn union_with(&mut self, other: &DirtyRect) {
        self.left = self.left.min(other.left);
        self.top = self.top.max(other.top);
        self.right = self.right.max(other.right);
        self.bottom = self.bottom.min(other.bottom);
    }
}

/// Notifications for the owner of a [`MediaSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    ContentUpdated,
    TimeDurationUpdated,
    ProgressUpdated,
    SizeChanged,
    StatusChanged(MediaStatus),
    CursorChanged,
    NameChanged,
    StatusTextChanged,
    PickFileRequest,
    AuthRequest,
    NavigateBegin,
    NavigateComplete,
    LocationChanged,
    ClickLinkHref,
    ClickLinkNoFollow,
    CloseRequest,
    PluginFailedLaunch,
    PluginFailed,
}

#[derive(Debug, Clone)]
pub struct MediaOptions {
    pub parent: ParentOptions,
    /// Opaque target name passed to the backend in `media.init`.
    pub target: String,
    pub background: [f64; 4],
    pub low_priority_size_limit: i32,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            parent: ParentOptions::default(),
            target: String::new(),
            background: [1.0, 1.0, 1.0, 1.0],
            low_priority_size_limit: LOW_PRIORITY_TEXTURE_SIZE_DEFAULT,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct TextureParams {
    received: bool,
    depth: i32,
    internal_format: u32,
    format: u32,
    kind: u32,
    swap_bytes: bool,
    coords_opengl: bool,
    allow_downsample: bool,
    padding: i32,
}

#[derive(Debug, Default, Clone)]
struct BrowserState {
    navigate_uri: String,
    navigate_result_code: i32,
    navigate_result_string: String,
    history_back_available: bool,
    history_forward_available: bool,
    status_text: String,
    location: String,
    click_url: String,
    click_target: String,
    click_nav_type: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct TimeState {
    current_time: f64,
    duration: f64,
    current_rate: f64,
    loaded_duration: f64,
}

/// Texture row width in pixels after applying the backend's padding rule.
///
/// A negative padding asks for a power of two, a padding above 1 rounds
/// each row up to a multiple of that many bytes.
fn padded_texture_width(width: i32, depth: i32, padding: i32) -> i32 {
    if padding < 0 {
        return next_power_of_2(width);
    }
    if padding <= 1 || depth <= 0 {
        return width;
    }
    let padded = width.checked_mul(depth).and_then(|row_bytes| {
        let pad = row_bytes % padding;
        if pad == 0 {
            Some(row_bytes)
        } else {
            row_bytes.checked_add(padding - pad)
        }
    });
    let Some(row_bytes) = padded else {
        warn!(width, padding, depth, "Padded texture row does not fit");
        return width;
    };
    if row_bytes % depth == 0 {
        row_bytes / depth
    } else {
        warn!(padding, depth, "Padding is not a multiple of the pixel size");
        width
    }
}

/// Host-side controller for one media backend.
pub struct MediaSession<Ln> {
    parent: ProcessParent<Ln>,
    options: MediaOptions,
    send_queue: VecDeque<Message>,
    events: Vec<MediaEvent>,

    texture: TextureParams,
    texture_region: Option<String>,
    texture_region_size: usize,

    default_media_width: i32,
    default_media_height: i32,
    natural_media_width: i32,
    natural_media_height: i32,
    set_media_width: i32,
    set_media_height: i32,
    requested_media_width: i32,
    requested_media_height: i32,
    requested_texture_width: i32,
    requested_texture_height: i32,
    full_media_width: i32,
    full_media_height: i32,
    texture_width: i32,
    texture_height: i32,
    media_width: i32,
    media_height: i32,
    auto_scale: bool,
    dirty: DirtyRect,

    priority: Priority,
    sleep_time: Duration,
    requested_volume: f64,
    last_mouse: (i32, i32),

    status: MediaStatus,
    cursor_name: String,
    media_name: String,
    can_cut: bool,
    can_copy: bool,
    can_paste: bool,
    auth_url: String,
    auth_realm: String,
    progress_percent: i32,
    browser: BrowserState,
    time: TimeState,
}

impl<Ln: ChildLauncher> MediaSession<Ln> {
    pub fn new(launcher: Ln, options: MediaOptions) -> Self {
        let parent = ProcessParent::new(launcher, options.parent.clone());
        Self {
            parent,
            options,
            send_queue: VecDeque::new(),
            events: Vec::new(),
            texture: TextureParams::default(),
            texture_region: None,
            texture_region_size: 0,
            default_media_width: 0,
            default_media_height: 0,
            natural_media_width: 0,
            natural_media_height: 0,
            set_media_width: -1,
            set_media_height: -1,
            requested_media_width: 0,
            requested_media_height: 0,
            requested_texture_width: 0,
            requested_texture_height: 0,
            full_media_width: 0,
            full_media_height: 0,
            texture_width: 0,
            texture_height: 0,
            media_width: 0,
            media_height: 0,
            auto_scale: false,
            dirty: DirtyRect::default(),
            priority: Priority::Normal,
            sleep_time: Priority::High.sleep_time(),
            requested_volume: 1.0,
            last_mouse: (0, 0),
            status: MediaStatus::None,
            cursor_name: String::new(),
            media_name: String::new(),
            can_cut: false,
            can_copy: false,
            can_paste: false,
            auth_url: String::new(),
            auth_realm: String::new(),
            progress_percent: 0,
            browser: BrowserState {
                navigate_result_code: -1,
                ..Default::default()
            },
            time: TimeState::default(),
        }
    }

    /// Queue `media.init` and start launching the child.
    pub fn init(&mut self, plugin_dir: impl Into<String>, plugin_file: impl Into<String>) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "init");
        message.set_value("target", self.options.target.clone());
        self.send_message(message);

        self.parent.set_sleep_time(self.sleep_time);
        self.parent.init(plugin_dir, plugin_file);
    }

    pub fn parent(&self) -> &ProcessParent<Ln> {
        &self.parent
    }

    pub fn parent_mut(&mut self) -> &mut ProcessParent<Ln> {
        &mut self.parent
    }

    /// Drive the child, negotiate texture size and flush queued commands.
    pub async fn idle(&mut self) -> Vec<MediaEvent> {
        for event in self.parent.idle().await {
            match event {
                ParentEvent::Message(message) => self.receive_plugin_message(message),
                ParentEvent::LaunchFailed => self.events.push(MediaEvent::PluginFailedLaunch),
                ParentEvent::Died => self.events.push(MediaEvent::PluginFailed),
            }
        }

        if self.media_width != -1
            && self.texture.received
            && !self.parent.is_blocked()
            && (self.requested_media_width != self.media_width
                || self.requested_media_height != self.media_height)
        {
            self.start_size_change();
        }

        if self.parent.is_running() {
            while let Some(message) = self.send_queue.pop_front() {
                self.parent.send_message(&message);
            }
        }

        std::mem::take(&mut self.events)
    }

    fn start_size_change(&mut self) {
        let depth = self.texture.depth.max(0);
        self.requested_texture_height = self.requested_media_height;
        self.requested_texture_width =
            padded_texture_width(self.requested_media_width, depth, self.texture.padding);

        let width = usize::try_from(self.requested_texture_width).unwrap_or(0);
        let height = usize::try_from(self.requested_texture_height).unwrap_or(0);
        let depth = usize::try_from(depth).unwrap_or(0);
        // One spare row past the end.
        let new_size = width
            .checked_mul(depth)
            .and_then(|row| row.checked_mul(height + 1))
            .unwrap_or_else(|| {
                warn!(width, height, depth, "Texture size overflows");
                0
            });

        if new_size != self.texture_region_size {
            if let Some(old) = self.texture_region.take() {
                self.parent.remove_shared_memory(&old);
            }
            self.texture_region_size = 0;
            if new_size > 0 {
                match self.parent.add_shared_memory(new_size) {
                    Ok(name) => {
                        if let Some(region) = self.parent.shared_memory_mut(&name) {
                            region.fill(0);
                        }
                        self.texture_region_size = new_size;
                        self.texture_region = Some(name);
                    }
                    Err(err) => warn!(size = new_size, error = %err, "Failed to allocate texture memory"),
                }
            }
        }

        self.texture_width = -1;
        self.texture_height = -1;
        self.media_width = -1;
        self.media_height = -1;
        self.reset_dirty();

        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "size_change");
        message.set_value("name", self.texture_region.clone().unwrap_or_default());
        message.set_value_s32("width", self.requested_media_width);
        message.set_value_s32("height", self.requested_media_height);
        message.set_value_s32("texture_width", self.requested_texture_width);
        message.set_value_s32("texture_height", self.requested_texture_height);
        let [r, g, b, a] = self.options.background;
        message.set_value_real("background_r", r);
        message.set_value_real("background_g", g);
        message.set_value_real("background_b", b);
        message.set_value_real("background_a", a);
        // Goes straight to the parent, ahead of anything queued.
        self.parent.send_message(&message);
        debug!(
            width = self.requested_media_width,
            height = self.requested_media_height,
            texture_width = self.requested_texture_width,
            "Sent size_change"
        );
    }

    /// Pick the requested media size from the explicit, natural and default
    /// sizes, then apply downsampling, auto-scale and the size cap.
    fn set_size_internal(&mut self) {
        (self.requested_media_width, self.requested_media_height) =
            if self.set_media_width > 0 && self.set_media_height > 0 {
                (self.set_media_width, self.set_media_height)
            } else if self.natural_media_width > 0 && self.natural_media_height > 0 {
                (self.natural_media_width, self.natural_media_height)
            } else {
                (self.default_media_width, self.default_media_height)
            };

        self.full_media_width = self.requested_media_width;
        self.full_media_height = self.requested_media_height;

        if self.texture.allow_downsample
            && matches!(self.priority, Priority::Slideshow | Priority::Low)
        {
            let limit = self.options.low_priority_size_limit.max(1);
            while self.requested_media_width > limit || self.requested_media_height > limit {
                self.requested_media_width /= 2;
                self.requested_media_height /= 2;
            }
        }

        if self.auto_scale {
            self.requested_media_width = next_power_of_2(self.requested_media_width);
            self.requested_media_height = next_power_of_2(self.requested_media_height);
        }

        self.requested_media_width = self.requested_media_width.min(MAX_MEDIA_DIMENSION);
        self.requested_media_height = self.requested_media_height.min(MAX_MEDIA_DIMENSION);
    }

    /// Request an explicit media size. Non-positive sizes fall back to the
    /// backend's natural or default size.
    pub fn set_size(&mut self, width: i32, height: i32) {
        if width > 0 && height > 0 {
            self.set_media_width = width;
            self.set_media_height = height;
        } else {
            self.set_media_width = -1;
            self.set_media_height = -1;
        }
        self.set_size_internal();
    }

    pub fn set_auto_scale(&mut self, auto_scale: bool) {
        if self.auto_scale != auto_scale {
            self.auto_scale = auto_scale;
            self.set_size_internal();
        }
    }

    pub fn set_low_priority_size_limit(&mut self, size: i32) {
        let limit = next_power_of_2(size);
        if self.options.low_priority_size_limit != limit {
            self.options.low_priority_size_limit = limit;
            self.set_size_internal();
        }
    }

    pub fn set_priority(&mut self, priority: Priority) {
        if self.priority == priority {
            return;
        }
        self.priority = priority;
        self.sleep_time = priority.sleep_time();

        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "set_priority");
        message.set_value("priority", priority.as_str());
        self.send_message(message);
        self.parent.set_sleep_time(self.sleep_time);
        debug!(priority = %priority, "Media priority changed");

        self.set_size_internal();
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }

    /// Size the owner should expect once the current negotiation finishes.
    pub fn requested_media_size(&self) -> (i32, i32) {
        (self.requested_media_width, self.requested_media_height)
    }

    /// Size before downsampling and scaling.
    pub fn full_media_size(&self) -> (i32, i32) {
        (self.full_media_width, self.full_media_height)
    }

    /// Size the backend last confirmed, -1 while a change is in flight.
    pub fn media_size(&self) -> (i32, i32) {
        (self.media_width, self.media_height)
    }

    pub fn natural_media_size(&self) -> (i32, i32) {
        (self.natural_media_width, self.natural_media_height)
    }

    pub fn texture_width(&self) -> i32 {
        next_power_of_2(self.texture_width)
    }

    pub fn texture_height(&self) -> i32 {
        next_power_of_2(self.texture_height)
    }

    pub fn texture_depth(&self) -> i32 {
        self.texture.depth
    }

    pub fn texture_format(&self) -> (u32, u32, u32) {
        (self.texture.internal_format, self.texture.format, self.texture.kind)
    }

    pub fn texture_swap_bytes(&self) -> bool {
        self.texture.swap_bytes
    }

    pub fn texture_coords_opengl(&self) -> bool {
        self.texture.coords_opengl
    }

    pub fn texture_region_name(&self) -> Option<&str> {
        self.texture_region.as_deref()
    }

    /// The region the backend renders into.
    pub fn texture_region(&self) -> Option<&SharedMemoryRegion> {
        self.texture_region
            .as_deref()
            .and_then(|name| self.parent.shared_memory(name))
    }

    /// Whether the texture region holds a frame of the requested size.
    pub fn texture_valid(&self) -> bool {
        self.texture.received
            && self.texture_width > 0
            && self.texture_height > 0
            && self.media_width > 0
            && self.media_height > 0
            && self.requested_media_width == self.media_width
            && self.requested_media_height == self.media_height
            && self.texture_region().is_some()
    }

    pub fn dirty(&self) -> Option<DirtyRect> {
        (!self.dirty.is_empty()).then_some(self.dirty)
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = DirtyRect::default();
    }

    pub fn status(&self) -> MediaStatus {
        self.status
    }

    pub fn cursor_name(&self) -> &str {
        &self.cursor_name
    }

    pub fn media_name(&self) -> &str {
        &self.media_name
    }

    pub fn can_cut(&self) -> bool {
        self.can_cut
    }

    pub fn can_copy(&self) -> bool {
        self.can_copy
    }

    pub fn can_paste(&self) -> bool {
        self.can_paste
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    pub fn auth_realm(&self) -> &str {
        &self.auth_realm
    }

    pub fn progress_percent(&self) -> i32 {
        self.progress_percent
    }

    pub fn navigate_uri(&self) -> &str {
        &self.browser.navigate_uri
    }

    pub fn navigate_result(&self) -> (i32, &str) {
        (
            self.browser.navigate_result_code,
            &self.browser.navigate_result_string,
        )
    }

    pub fn history_available(&self) -> (bool, bool) {
        (
            self.browser.history_back_available,
            self.browser.history_forward_available,
        )
    }

    pub fn status_text(&self) -> &str {
        &self.browser.status_text
    }

    pub fn location(&self) -> &str {
        &self.browser.location
    }

    pub fn click_url(&self) -> &str {
        &self.browser.click_url
    }

    pub fn click_target(&self) -> &str {
        &self.browser.click_target
    }

    pub fn click_nav_type(&self) -> &str {
        &self.browser.click_nav_type
    }

    pub fn current_time(&self) -> f64 {
        self.time.current_time
    }

    pub fn duration(&self) -> f64 {
        self.time.duration
    }

    pub fn current_rate(&self) -> f64 {
        self.time.current_rate
    }

    pub fn loaded_duration(&self) -> f64 {
        self.time.loaded_duration
    }

    pub fn volume(&self) -> f64 {
        self.requested_volume
    }

    pub fn cpu_usage(&self) -> f64 {
        self.parent.cpu_usage()
    }

    pub fn supports_media_browser(&self) -> bool {
        !self
            .parent
            .message_class_version(MESSAGE_CLASS_MEDIA_BROWSER)
            .is_empty()
    }

    pub fn supports_media_time(&self) -> bool {
        !self
            .parent
            .message_class_version(MESSAGE_CLASS_MEDIA_TIME)
            .is_empty()
    }

    /// Commands waiting for the child to reach running.
    pub fn queued_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Send now if the child is running, otherwise queue.
    pub fn send_message(&mut self, message: Message) {
        if self.parent.is_running() {
            self.parent.send_message(&message);
        } else {
            self.send_queue.push_back(message);
        }
    }

    fn receive_plugin_message(&mut self, message: Message) {
        match message.class() {
            MESSAGE_CLASS_MEDIA => self.receive_media(&message),
            MESSAGE_CLASS_MEDIA_BROWSER => self.receive_media_browser(&message),
            class => warn!(class, name = message.name(), "Unhandled plugin message"),
        }
    }

    fn receive_media(&mut self, message: &Message) {
        match message.name() {
            "texture_params" => {
                let depth = message.get_value_s32("depth");
                if !(1..=MAX_TEXTURE_DEPTH).contains(&depth) {
                    warn!(depth, "Ignoring texture params with unusable depth");
                    return;
                }
                self.texture.depth = depth;
                self.texture.internal_format = message.get_value_u32("internalformat");
                self.texture.format = message.get_value_u32("format");
                self.texture.kind = message.get_value_u32("type");
                self.texture.swap_bytes = message.get_value_boolean("swap_bytes");
                self.texture.coords_opengl = message.get_value_boolean("coords_opengl");
                self.default_media_width = message.get_value_s32("default_width");
                self.default_media_height = message.get_value_s32("default_height");
                self.texture.allow_downsample = message.get_value_boolean("allow_downsample");
                self.texture.padding = message.get_value_s32("padding");

                self.set_size_internal();
                self.texture.received = true;
            }
            "updated" => self.receive_updated(message),
            "media_status" => {
                self.status = MediaStatus::from_wire(&message.get_value("status"));
                debug!(status = ?self.status, "Media status changed");
                self.events.push(MediaEvent::StatusChanged(self.status));
            }
            "size_change_request" => {
                self.natural_media_width = message.get_value_s32("width");
                self.natural_media_height = message.get_value_s32("height");
                self.set_size_internal();
            }
            "size_change_response" => {
                self.texture_width = message.get_value_s32("texture_width");
                self.texture_height = message.get_value_s32("texture_height");
                self.media_width = message.get_value_s32("width");
                self.media_height = message.get_value_s32("height");
                self.reset_dirty();
                self.events.push(MediaEvent::SizeChanged);
            }
            "cursor_changed" => {
                self.cursor_name = message.get_value("name");
                self.events.push(MediaEvent::CursorChanged);
            }
            "edit_state" => {
                if message.has_value("cut") {
                    self.can_cut = message.get_value_boolean("cut");
                }
                if message.has_value("copy") {
                    self.can_copy = message.get_value_boolean("copy");
                }
                if message.has_value("paste") {
                    self.can_paste = message.get_value_boolean("paste");
                }
            }
            "name_text" => {
                self.media_name = message.get_value("name");
                self.events.push(MediaEvent::NameChanged);
            }
            "pick_file" => self.events.push(MediaEvent::PickFileRequest),
            "auth_request" => {
                self.auth_url = message.get_value("url");
                self.auth_realm = message.get_value("realm");
                self.events.push(MediaEvent::AuthRequest);
            }
            name => warn!(name, "Unknown media message"),
        }
    }

    fn receive_updated(&mut self, message: &Message) {
        if message.has_value("left") {
            let mut rect = DirtyRect {
                left: message.get_value_s32("left"),
                top: message.get_value_s32("top"),
                right: message.get_value_s32("right"),
                bottom: message.get_value_s32("bottom"),
            };
            // Backends often report flipped rows.
            if rect.top < rect.bottom {
                std::mem::swap(&mut rect.top, &mut rect.bottom);
            }
            if self.dirty.is_empty() {
                self.dirty = rect;
            } else {
                self.dirty.union_with(&rect);
            }
            trace!(dirty = ?self.dirty, "Content updated");
            self.events.push(MediaEvent::ContentUpdated);
        }

        let mut time_updated = false;
        let previous_percent = self.progress_percent;

        if message.has_value("current_time") {
            self.time.current_time = message.get_value_real("current_time");
            time_updated = true;
        }
        if message.has_value("duration") {
            self.time.duration = message.get_value_real("duration");
            time_updated = true;
        }
        if message.has_value("current_rate") {
            self.time.current_rate = message.get_value_real("current_rate");
        }
        if message.has_value("loaded_duration") {
            self.time.loaded_duration = message.get_value_real("loaded_duration");
            time_updated = true;
        } else {
            self.time.loaded_duration = self.time.duration;
        }

        if self.time.duration != 0.0 {
            self.progress_percent = (self.time.loaded_duration * 100.0 / self.time.duration) as i32;
        }

        if time_updated {
            self.events.push(MediaEvent::TimeDurationUpdated);
        }
        if previous_percent != self.progress_percent {
            self.events.push(MediaEvent::ProgressUpdated);
        }
    }

    fn receive_media_browser(&mut self, message: &Message) {
        match message.name() {
            "navigate_begin" => {
                self.browser.navigate_uri = message.get_value("uri");
                self.events.push(MediaEvent::NavigateBegin);
            }
            "navigate_complete" => {
                self.browser.navigate_uri = message.get_value("uri");
                self.browser.navigate_result_code = message.get_value_s32("result_code");
                self.browser.navigate_result_string = message.get_value("result_string");
                self.browser.history_back_available =
                    message.get_value_boolean("history_back_available");
                self.browser.history_forward_available =
                    message.get_value_boolean("history_forward_available");
                self.events.push(MediaEvent::NavigateComplete);
            }
            "progress" => {
                self.progress_percent = message.get_value_s32("percent");
                self.events.push(MediaEvent::ProgressUpdated);
            }
            "status_text" => {
                self.browser.status_text = message.get_value("status");
                self.events.push(MediaEvent::StatusTextChanged);
            }
            "location_changed" => {
                self.browser.location = message.get_value("uri");
                self.events.push(MediaEvent::LocationChanged);
            }
            "click_href" => {
                self.browser.click_url = message.get_value("uri");
                self.browser.click_target = message.get_value("target");
                self.events.push(MediaEvent::ClickLinkHref);
            }
            "click_nofollow" => {
                self.browser.click_url = message.get_value("uri");
                self.browser.click_nav_type = message.get_value("nav_type");
                self.browser.click_target.clear();
                self.events.push(MediaEvent::ClickLinkNoFollow);
            }
            "close_request" => self.events.push(MediaEvent::CloseRequest),
            name => warn!(name, "Unknown media_browser message"),
        }
    }

    /// Mark a reply as the answer to a pending blocking request.
    fn answer(&self, mut message: Message) -> Message {
        if self.parent.is_blocked() {
            message.set_value_boolean("blocking_response", true);
        }
        message
    }

    pub fn send_pick_file_response(&mut self, file: &str) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "pick_file_response");
        message.set_value("file", file);
        let message = self.answer(message);
        self.send_message(message);
    }

    pub fn send_auth_response(&mut self, ok: bool, username: &str, password: &str) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "auth_response");
        message.set_value_boolean("ok", ok);
        message.set_value("username", username);
        message.set_value("password", password);
        let message = self.answer(message);
        self.send_message(message);
    }

    /// Mouse input in bottom-left-origin coordinates.
    pub fn mouse_event(&mut self, kind: MouseEventType, button: i32, x: i32, y: i32, modifiers: Modifiers) {
        if kind == MouseEventType::Move {
            if !self.parent.is_running() || self.parent.is_blocked() {
                return;
            }
            if (x, y) == self.last_mouse {
                return;
            }
            self.last_mouse = (x, y);
        }

        let y = if self.texture.coords_opengl {
            y
        } else {
            self.media_height.saturating_sub(y)
        };

        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "mouse_event");
        message.set_value("event", kind.as_str());
        message.set_value_s32("button", button);
        message.set_value_s32("x", x);
        message.set_value_s32("y", y);
        message.set_value("modifiers", modifiers.to_wire());
        self.send_message(message);
    }

    pub fn key_event(&mut self, kind: KeyEventType, key_code: i32, modifiers: Modifiers, native_key_data: Value) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "key_event");
        message.set_value("event", kind.as_str());
        message.set_value_s32("key", key_code);
        message.set_value("modifiers", modifiers.to_wire());
        message.set_value_structured("native_key_data", native_key_data);
        self.send_message(message);
    }

    pub fn scroll_event(&mut self, x: i32, y: i32, modifiers: Modifiers) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "scroll_event");
        message.set_value_s32("x", x);
        message.set_value_s32("y", y);
        message.set_value("modifiers", modifiers.to_wire());
        self.send_message(message);
    }

    pub fn text_event(&mut self, text: &str, modifiers: Modifiers, native_key_data: Value) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "text_event");
        message.set_value("text", text);
        message.set_value("modifiers", modifiers.to_wire());
        message.set_value_structured("native_key_data", native_key_data);
        self.send_message(message);
    }

    pub fn load_uri(&mut self, uri: &str) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "load_uri");
        message.set_value("uri", uri);
        self.send_message(message);
    }

    pub fn focus(&mut self, focused: bool) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA, "focus");
        message.set_value_boolean("focused", focused);
        self.send_message(message);
    }

    pub fn browse_stop(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_MEDIA_BROWSER, "browse_stop"));
    }

    pub fn browse_reload(&mut self, ignore_cache: bool) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA_BROWSER, "browse_reload");
        message.set_value_boolean("ignore_cache", ignore_cache);
        self.send_message(message);
    }

    pub fn browse_forward(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_MEDIA_BROWSER, "browse_forward"));
    }

    pub fn browse_back(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_MEDIA_BROWSER, "browse_back"));
    }

    pub fn start(&mut self, rate: f64) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA_TIME, "start");
        message.set_value_real("rate", rate);
        self.send_message(message);
    }

    pub fn stop(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_MEDIA_TIME, "stop"));
    }

    pub fn pause(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_MEDIA_TIME, "pause"));
    }

    pub fn seek(&mut self, time: f64) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA_TIME, "seek");
        message.set_value_real("time", time);
        self.send_message(message);
    }

    pub fn set_loop(&mut self, looping: bool) {
        let mut message = Message::new(MESSAGE_CLASS_MEDIA_TIME, "set_loop");
        message.set_value_boolean("loop", looping);
        self.send_message(message);
    }

    /// Only sent when the volume actually changes.
    pub fn set_volume(&mut self, volume: f64) {
        if volume == self.requested_volume {
            return;
        }
        self.requested_volume = volume;
        let mut message = Message::new(MESSAGE_CLASS_MEDIA_TIME, "set_volume");
        message.set_value_real("volume", volume);
        self.send_message(message);
    }

    /// Make the child abort. For testing crash handling.
    pub fn crash_plugin(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_INTERNAL, "crash"));
    }

    /// Make the child stop servicing its loop. For testing lock-up handling.
    pub fn hang_plugin(&mut self) {
        self.send_message(Message::new(MESSAGE_CLASS_INTERNAL, "hang"));
    }

    /// Ask the child to shut down gracefully.
    pub fn shutdown(&mut self) {
        self.parent.shutdown();
    }
}
