//! Window and application registry state: the metadata the window manager
//! pushes through `set_input_windows`, and the touch-ownership bookkeeping
//! built on top of it.

use crate::dispatcher::targets::TargetFlags;
use dispatch_event::{DeviceId, DisplayId, Nanos, PointerIdSet, Source};
use dispatch_proto::InputChannel;
use std::{
    cell::RefCell,
    fmt::{self, Display},
    rc::Rc,
};

/// Default dispatching timeout when neither the window nor the application
/// provides one.
pub const DEFAULT_DISPATCHING_TIMEOUT: Nanos = 5_000_000_000;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayoutFlags: u32 {
        const NOT_TOUCHABLE         = 0x0001;
        const NOT_FOCUSABLE         = 0x0002;
        const NOT_TOUCH_MODAL       = 0x0004;
        const WATCH_OUTSIDE_TOUCH   = 0x0008;
        const SPLIT_TOUCH           = 0x0010;
        const SLIPPERY              = 0x0020;
        const SYSTEM_ERROR          = 0x0040;
        // Carried for completeness; no dispatch path consults it because the
        // policy never reports the screen-off state that would arm it.
        const TOUCHABLE_WHEN_WAKING = 0x0080;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InputFeatures: u32 {
        const DISABLE_USER_ACTIVITY = 0x0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowType {
    #[default]
    Application,
    Wallpaper,
    SystemOverlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{}][{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// Snapshot of one window's input-relevant metadata.
#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub input_channel: Option<InputChannel>,
    pub name: String,
    pub layout_flags: LayoutFlags,
    pub window_type: WindowType,
    pub dispatching_timeout: Nanos,
    pub frame: Rect,
    pub scale_factor: f32,
    pub touchable_region: Vec<Rect>,
    pub visible: bool,
    pub can_receive_keys: bool,
    pub has_focus: bool,
    pub has_wallpaper: bool,
    pub paused: bool,
    pub layer: i32,
    pub owner_pid: i32,
    pub owner_uid: i32,
    pub input_features: InputFeatures,
    pub display_id: DisplayId,
    pub application: Option<Rc<ApplicationHandle>>,
}

impl WindowInfo {
    pub fn touchable_region_contains(&self, x: i32, y: i32) -> bool {
        self.touchable_region.iter().any(|r| r.contains(x, y))
    }

    pub fn frame_contains(&self, x: i32, y: i32) -> bool {
        self.frame.contains(x, y)
    }

    pub fn supports_split_touch(&self) -> bool {
        self.layout_flags.contains(LayoutFlags::SPLIT_TOUCH)
    }

    pub fn is_trusted_overlay(&self) -> bool {
        self.window_type == WindowType::SystemOverlay
    }
}

impl Default for WindowInfo {
    fn default() -> Self {
        WindowInfo {
            input_channel: None,
            name: String::new(),
            layout_flags: LayoutFlags::empty(),
            window_type: WindowType::Application,
            dispatching_timeout: DEFAULT_DISPATCHING_TIMEOUT,
            frame: Rect::default(),
            scale_factor: 1.0,
            touchable_region: Vec::new(),
            visible: true,
            can_receive_keys: true,
            has_focus: false,
            has_wallpaper: false,
            paused: false,
            layer: 0,
            owner_pid: 0,
            owner_uid: 0,
            input_features: InputFeatures::empty(),
            display_id: dispatch_event::MAIN_DISPLAY,
            application: None,
        }
    }
}

/// Shared handle to a window. The info snapshot is released when the window
/// leaves the registered set so stale channels are reclaimed promptly, but
/// the handle itself stays valid for anyone still holding it.
pub struct WindowHandle {
    name: Rc<str>,
    info: RefCell<Option<Rc<WindowInfo>>>,
}

impl WindowHandle {
    pub fn new(info: WindowInfo) -> Rc<Self> {
        Rc::new(WindowHandle {
            name: Rc::from(info.name.as_str()),
            info: RefCell::new(Some(Rc::new(info))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-queries the window's metadata. Returns false when the handle no
    /// longer describes a live window.
    pub fn update_info(&self) -> bool {
        self.info.borrow().is_some()
    }

    pub fn info(&self) -> Option<Rc<WindowInfo>> {
        self.info.borrow().clone()
    }

    pub fn set_info(&self, info: WindowInfo) {
        *self.info.borrow_mut() = Some(Rc::new(info));
    }

    pub fn release_info(&self) {
        *self.info.borrow_mut() = None;
    }

    pub fn input_channel(&self) -> Option<InputChannel> {
        self.info.borrow().as_ref().and_then(|i| i.input_channel.clone())
    }

    pub fn application(&self) -> Option<Rc<ApplicationHandle>> {
        self.info.borrow().as_ref().and_then(|i| i.application.clone())
    }

    pub fn dispatching_timeout(&self, default: Nanos) -> Nanos {
        self.info
            .borrow()
            .as_ref()
            .map_or(default, |i| i.dispatching_timeout)
    }
}

impl fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WindowHandle('{}')", self.name)
    }
}

/// An application known to the dispatcher, used for ANR attribution while
/// the application has no window yet.
#[derive(Debug)]
pub struct ApplicationHandle {
    name: String,
    dispatching_timeout: Nanos,
}

impl ApplicationHandle {
    pub fn new(name: impl Into<String>, dispatching_timeout: Nanos) -> Rc<Self> {
        Rc::new(ApplicationHandle {
            name: name.into(),
            dispatching_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatching_timeout(&self, default: Nanos) -> Nanos {
        if self.dispatching_timeout == 0 {
            default
        } else {
            self.dispatching_timeout
        }
    }
}

#[derive(Clone)]
pub struct TouchedWindow {
    pub window: Rc<WindowHandle>,
    pub target_flags: TargetFlags,
    /// empty unless the SPLIT target flag is set
    pub pointer_ids: PointerIdSet,
}

/// Which windows currently own the active gesture.
#[derive(Clone, Default)]
pub struct TouchState {
    pub down: bool,
    pub split: bool,
    /// device that owns the gesture; events from other devices are rejected
    pub device_id: Option<DeviceId>,
    pub source: Source,
    pub display_id: Option<DisplayId>,
    pub windows: Vec<TouchedWindow>,
}

impl TouchState {
    pub fn reset(&mut self) {
        *self = TouchState::default();
    }

    pub fn add_or_update_window(
        &mut self,
        window: &Rc<WindowHandle>,
        target_flags: TargetFlags,
        pointer_ids: PointerIdSet,
    ) {
        if target_flags.contains(TargetFlags::SPLIT) {
            self.split = true;
        }

        for touched in &mut self.windows {
            if Rc::ptr_eq(&touched.window, window) {
                touched.target_flags |= target_flags;
                if target_flags.contains(TargetFlags::DISPATCH_AS_SLIPPERY_EXIT) {
                    touched.target_flags.remove(TargetFlags::DISPATCH_AS_IS);
                }
                touched.pointer_ids = touched.pointer_ids.union(pointer_ids);
                return;
            }
        }

        self.windows.push(TouchedWindow {
            window: window.clone(),
            target_flags,
            pointer_ids,
        });
    }

    pub fn remove_window(&mut self, window: &Rc<WindowHandle>) {
        self.windows.retain(|t| !Rc::ptr_eq(&t.window, window));
    }

    /// Keeps only the windows that remain interesting for the rest of the
    /// gesture, reducing their dispatch mode back to as-is.
    pub fn filter_non_as_is_touch_windows(&mut self) {
        self.windows.retain_mut(|touched| {
            if touched.target_flags.intersects(
                TargetFlags::DISPATCH_AS_IS | TargetFlags::DISPATCH_AS_SLIPPERY_ENTER,
            ) {
                touched.target_flags.remove(TargetFlags::DISPATCH_MASK);
                touched.target_flags |= TargetFlags::DISPATCH_AS_IS;
                true
            } else {
                false
            }
        });
    }

    pub fn first_foreground_window(&self) -> Option<Rc<WindowHandle>> {
        self.windows
            .iter()
            .find(|t| t.target_flags.contains(TargetFlags::FOREGROUND))
            .map(|t| t.window.clone())
    }

    /// A gesture may slip between windows only while exactly one slippery
    /// foreground window owns it.
    pub fn is_slippery(&self) -> bool {
        let mut found = false;
        for touched in &self.windows {
            if touched.target_flags.contains(TargetFlags::FOREGROUND) {
                let slippery = touched
                    .window
                    .info()
                    .map_or(false, |i| i.layout_flags.contains(LayoutFlags::SLIPPERY));
                if found || !slippery {
                    return false;
                }
                found = true;
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(name: &str, flags: LayoutFlags) -> Rc<WindowHandle> {
        WindowHandle::new(WindowInfo {
            name: name.into(),
            layout_flags: flags,
            ..WindowInfo::default()
        })
    }

    #[test]
    fn add_or_update_merges_pointer_ids() {
        let mut state = TouchState::default();
        let w = window("a", LayoutFlags::empty());
        state.add_or_update_window(&w, TargetFlags::FOREGROUND, PointerIdSet::single(1));
        state.add_or_update_window(&w, TargetFlags::SPLIT, PointerIdSet::single(3));
        assert_eq!(state.windows.len(), 1);
        assert!(state.split);
        assert!(state.windows[0].pointer_ids.contains(1));
        assert!(state.windows[0].pointer_ids.contains(3));
    }

    #[test]
    fn slippery_exit_clears_as_is() {
        let mut state = TouchState::default();
        let w = window("a", LayoutFlags::empty());
        state.add_or_update_window(
            &w,
            TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS,
            PointerIdSet::empty(),
        );
        state.add_or_update_window(
            &w,
            TargetFlags::DISPATCH_AS_SLIPPERY_EXIT,
            PointerIdSet::empty(),
        );
        let flags = state.windows[0].target_flags;
        assert!(!flags.contains(TargetFlags::DISPATCH_AS_IS));
        assert!(flags.contains(TargetFlags::DISPATCH_AS_SLIPPERY_EXIT));
    }

    #[test]
    fn filter_keeps_only_as_is_and_slippery_enter() {
        let mut state = TouchState::default();
        let a = window("a", LayoutFlags::empty());
        let b = window("b", LayoutFlags::empty());
        state.add_or_update_window(
            &a,
            TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS,
            PointerIdSet::empty(),
        );
        state.add_or_update_window(&b, TargetFlags::DISPATCH_AS_OUTSIDE, PointerIdSet::empty());
        state.filter_non_as_is_touch_windows();
        assert_eq!(state.windows.len(), 1);
        assert!(Rc::ptr_eq(&state.windows[0].window, &a));
    }

    #[test]
    fn slippery_requires_single_slippery_foreground() {
        let mut state = TouchState::default();
        let a = window("a", LayoutFlags::SLIPPERY);
        state.add_or_update_window(&a, TargetFlags::FOREGROUND, PointerIdSet::empty());
        assert!(state.is_slippery());

        let b = window("b", LayoutFlags::SLIPPERY);
        state.add_or_update_window(&b, TargetFlags::FOREGROUND, PointerIdSet::empty());
        assert!(!state.is_slippery());
    }
}
