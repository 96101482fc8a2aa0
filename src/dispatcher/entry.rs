//! Event entries and the state attached to their delivery.
//!
//! Entries are reference counted (`Rc`): the inbound queue, the key-repeat
//! slot, and every per-connection dispatch entry hold their own reference,
//! and the event disappears when the last one drops. Fields the dispatcher
//! rewrites in place (repeat counts, fallback rewrites, interception state)
//! live in `Cell`s; everything else is immutable after construction.

use crate::dispatcher::targets::TargetFlags;
use dispatch_event::{
    DeviceId, DisplayId, KeyAction, KeyCode, KeyFlags, MetaState, MotionAction, MotionFlags, Nanos,
    PointerCoords, PointerProperties, PolicyFlags, ScanCode, Source,
};
use std::{
    cell::{Cell, RefCell},
    fmt::Write as _,
    rc::Rc,
};
use tokio::sync::Notify;

pub type EventRef = Rc<EventEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionResult {
    Pending,
    Succeeded,
    Failed,
    PermissionDenied,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionSyncMode {
    /// fire and forget; the injection is assumed successful
    None,
    /// wait until the dispatcher has resolved targets for the event
    WaitForResult,
    /// additionally wait until every foreground delivery has been released
    WaitForFinished,
}

/// Shared bookkeeping for one `inject` call. A motion chain shares a single
/// state, attached to its final entry.
pub struct InjectionState {
    pub injector_pid: i32,
    pub injector_uid: i32,
    result: Cell<InjectionResult>,
    is_async: Cell<bool>,
    pending_foreground: Cell<u32>,
    notify: Notify,
}

impl InjectionState {
    pub fn new(injector_pid: i32, injector_uid: i32) -> Rc<Self> {
        Rc::new(InjectionState {
            injector_pid,
            injector_uid,
            result: Cell::new(InjectionResult::Pending),
            is_async: Cell::new(false),
            pending_foreground: Cell::new(0),
            notify: Notify::new(),
        })
    }

    pub fn result(&self) -> InjectionResult {
        self.result.get()
    }

    pub(crate) fn set_result(&self, result: InjectionResult) {
        self.result.set(result);
        self.notify.notify_waiters();
    }

    pub fn mark_async(&self) {
        self.is_async.set(true);
    }

    pub fn is_async(&self) -> bool {
        self.is_async.get()
    }

    pub fn pending_foreground_dispatches(&self) -> u32 {
        self.pending_foreground.get()
    }

    pub(crate) fn increment_pending_foreground(&self) {
        self.pending_foreground.set(self.pending_foreground.get() + 1);
    }

    pub(crate) fn decrement_pending_foreground(&self) {
        let remaining = self.pending_foreground.get().saturating_sub(1);
        self.pending_foreground.set(remaining);
        if remaining == 0 {
            self.notify.notify_waiters();
        }
    }

    /// Resolves when the result or the pending-foreground count changes.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// Interception verdict for a key, decided by the policy between loop
/// iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptResult {
    Unknown,
    Continue,
    Skip,
    TryAgainLater { wakeup_time: Nanos },
}

pub struct KeyEntry {
    pub device_id: DeviceId,
    pub source: Source,
    pub action: KeyAction,
    pub flags: Cell<KeyFlags>,
    pub key_code: Cell<KeyCode>,
    pub scan_code: Cell<ScanCode>,
    pub meta_state: Cell<MetaState>,
    pub repeat_count: Cell<u32>,
    pub down_time: Cell<Nanos>,
    pub synthetic_repeat: Cell<bool>,
    pub intercept: Cell<InterceptResult>,
}

pub struct MotionEntry {
    pub device_id: DeviceId,
    pub source: Source,
    pub display_id: DisplayId,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub meta_state: MetaState,
    pub button_state: u32,
    pub edge_flags: u32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nanos,
    pub pointer_properties: Vec<PointerProperties>,
    pub pointer_coords: Vec<PointerCoords>,
}

impl MotionEntry {
    pub fn pointer_count(&self) -> usize {
        self.pointer_properties.len()
    }

    pub fn is_pointer_event(&self) -> bool {
        self.source.is_pointer()
    }
}

pub enum EventKind {
    ConfigurationChanged,
    DeviceReset { device_id: DeviceId },
    Key(KeyEntry),
    Motion(MotionEntry),
}

pub struct EventEntry {
    pub event_time: Cell<Nanos>,
    pub policy_flags: Cell<PolicyFlags>,
    pub injection: RefCell<Option<Rc<InjectionState>>>,
    pub dispatch_in_progress: Cell<bool>,
    pub kind: EventKind,
}

impl EventEntry {
    fn new(event_time: Nanos, policy_flags: PolicyFlags, kind: EventKind) -> EventRef {
        Rc::new(EventEntry {
            event_time: Cell::new(event_time),
            policy_flags: Cell::new(policy_flags),
            injection: RefCell::new(None),
            dispatch_in_progress: Cell::new(false),
            kind,
        })
    }

    pub fn new_configuration_changed(event_time: Nanos) -> EventRef {
        Self::new(event_time, PolicyFlags::empty(), EventKind::ConfigurationChanged)
    }

    pub fn new_device_reset(event_time: Nanos, device_id: DeviceId) -> EventRef {
        Self::new(
            event_time,
            PolicyFlags::empty(),
            EventKind::DeviceReset { device_id },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_key(
        event_time: Nanos,
        policy_flags: PolicyFlags,
        device_id: DeviceId,
        source: Source,
        action: KeyAction,
        flags: KeyFlags,
        key_code: KeyCode,
        scan_code: ScanCode,
        meta_state: MetaState,
        repeat_count: u32,
        down_time: Nanos,
    ) -> EventRef {
        Self::new(
            event_time,
            policy_flags,
            EventKind::Key(KeyEntry {
                device_id,
                source,
                action,
                flags: Cell::new(flags),
                key_code: Cell::new(key_code),
                scan_code: Cell::new(scan_code),
                meta_state: Cell::new(meta_state),
                repeat_count: Cell::new(repeat_count),
                down_time: Cell::new(down_time),
                synthetic_repeat: Cell::new(false),
                intercept: Cell::new(InterceptResult::Unknown),
            }),
        )
    }

    pub fn new_motion(event_time: Nanos, policy_flags: PolicyFlags, motion: MotionEntry) -> EventRef {
        Self::new(event_time, policy_flags, EventKind::Motion(motion))
    }

    pub fn key(&self) -> Option<&KeyEntry> {
        match &self.kind {
            EventKind::Key(key) => Some(key),
            _ => None,
        }
    }

    pub fn motion(&self) -> Option<&MotionEntry> {
        match &self.kind {
            EventKind::Motion(motion) => Some(motion),
            _ => None,
        }
    }

    /// View of a key entry in the shape the policy interfaces expect.
    pub fn key_args(&self) -> Option<dispatch_event::KeyEventArgs> {
        let key = self.key()?;
        Some(dispatch_event::KeyEventArgs {
            event_time: self.event_time.get(),
            device_id: key.device_id,
            source: key.source,
            policy_flags: self.policy_flags.get(),
            action: key.action,
            flags: key.flags.get(),
            key_code: key.key_code.get(),
            scan_code: key.scan_code.get(),
            meta_state: key.meta_state.get(),
            repeat_count: key.repeat_count.get(),
            down_time: key.down_time.get(),
        })
    }

    pub fn is_injected(&self) -> bool {
        self.injection.borrow().is_some()
    }

    pub fn injection(&self) -> Option<Rc<InjectionState>> {
        self.injection.borrow().clone()
    }

    pub fn set_injection(&self, state: Rc<InjectionState>) {
        *self.injection.borrow_mut() = Some(state);
    }

    pub fn clear_injection(&self) {
        *self.injection.borrow_mut() = None;
    }

    pub fn describe(&self) -> String {
        let mut out = String::new();
        match &self.kind {
            EventKind::ConfigurationChanged => {
                let _ = write!(out, "ConfigurationChangedEvent()");
            }
            EventKind::DeviceReset { device_id } => {
                let _ = write!(out, "DeviceResetEvent(device={device_id})");
            }
            EventKind::Key(key) => {
                let _ = write!(
                    out,
                    "KeyEvent({}, code={}, device={}, source={:?})",
                    key.action,
                    key.key_code.get(),
                    key.device_id,
                    key.source
                );
            }
            EventKind::Motion(motion) => {
                let _ = write!(
                    out,
                    "MotionEvent({}, device={}, source={:?}, display={})",
                    motion.action, motion.device_id, motion.source, motion.display_id
                );
            }
        }
        out
    }
}

/// Action and flags as they will appear on the wire, after transmutation by
/// the target's dispatch mode.
#[derive(Debug, Clone, Copy)]
pub enum Resolved {
    Key { action: KeyAction, flags: KeyFlags },
    Motion { action: MotionAction, flags: MotionFlags },
}

/// One scheduled delivery of an event to one connection.
pub struct DispatchEntry {
    pub seq: u32,
    pub event: EventRef,
    pub target_flags: TargetFlags,
    pub x_offset: f32,
    pub y_offset: f32,
    pub scale_factor: f32,
    pub delivery_time: Cell<Nanos>,
    pub resolved: Resolved,
}

impl DispatchEntry {
    pub fn new(
        seq: u32,
        event: EventRef,
        target_flags: TargetFlags,
        x_offset: f32,
        y_offset: f32,
        scale_factor: f32,
        resolved: Resolved,
    ) -> Self {
        let entry = DispatchEntry {
            seq,
            event,
            target_flags,
            x_offset,
            y_offset,
            scale_factor,
            delivery_time: Cell::new(0),
            resolved,
        };
        if entry.has_foreground_target() {
            if let Some(injection) = entry.event.injection() {
                injection.increment_pending_foreground();
            }
        }
        entry
    }

    pub fn has_foreground_target(&self) -> bool {
        self.target_flags.contains(TargetFlags::FOREGROUND)
    }

    pub fn is_split(&self) -> bool {
        self.target_flags.contains(TargetFlags::SPLIT)
    }
}

impl Drop for DispatchEntry {
    fn drop(&mut self) {
        // Foreground-dispatch accounting must survive every release path:
        // finished acks, queue drains on abort, and unregistration.
        if self.has_foreground_target() {
            if let Some(injection) = self.event.injection() {
                injection.decrement_pending_foreground();
            }
        }
    }
}
