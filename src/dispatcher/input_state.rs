//! Per-connection memory of what a consumer has been told.
//!
//! Every published key and motion is tracked here first; when reality
//! diverges from what the consumer last saw (windows removed, devices reset,
//! gestures preempted), `synthesize_cancelation_events` produces exactly the
//! key-ups, cancels and hover-exits needed to close the consumer's view.
//! Synthesis is a pure function of this state so it can be tested in
//! isolation; the mementos themselves are cleared as the synthesized events
//! are tracked on their way out.

use crate::dispatcher::entry::{EventEntry, EventRef, KeyEntry, MotionEntry};
use dispatch_event::{
    DeviceId, DisplayId, KeyAction, KeyCode, KeyFlags, MetaState, MotionAction, MotionFlags, Nanos,
    PointerCoords, PointerProperties, PolicyFlags, ScanCode, Source,
};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelationMode {
    All,
    PointerEvents,
    NonPointerEvents,
    FallbackEvents,
}

/// Which tracked state to cancel, and why.
#[derive(Debug, Clone, Copy)]
pub struct CancelationOptions {
    pub mode: CancelationMode,
    pub reason: &'static str,
    pub key_code: Option<KeyCode>,
    pub device_id: Option<DeviceId>,
}

impl CancelationOptions {
    pub fn new(mode: CancelationMode, reason: &'static str) -> Self {
        CancelationOptions {
            mode,
            reason,
            key_code: None,
            device_id: None,
        }
    }
}

struct KeyMemento {
    device_id: DeviceId,
    source: Source,
    key_code: KeyCode,
    scan_code: ScanCode,
    meta_state: MetaState,
    flags: KeyFlags,
    down_time: Nanos,
    policy_flags: PolicyFlags,
}

struct MotionMemento {
    device_id: DeviceId,
    source: Source,
    display_id: DisplayId,
    flags: MotionFlags,
    x_precision: f32,
    y_precision: f32,
    down_time: Nanos,
    hovering: bool,
    policy_flags: PolicyFlags,
    pointer_properties: Vec<PointerProperties>,
    pointer_coords: Vec<PointerCoords>,
}

impl MotionMemento {
    fn set_pointers(&mut self, motion: &MotionEntry) {
        self.pointer_properties = motion.pointer_properties.clone();
        self.pointer_coords = motion.pointer_coords.clone();
    }
}

#[derive(Default)]
pub struct InputState {
    key_mementos: Vec<KeyMemento>,
    motion_mementos: Vec<MotionMemento>,
    fallback_keys: HashMap<KeyCode, KeyCode>,
}

impl InputState {
    pub fn new() -> Self {
        InputState::default()
    }

    /// True when there is nothing to cancel.
    pub fn is_neutral(&self) -> bool {
        self.key_mementos.is_empty() && self.motion_mementos.is_empty()
    }

    pub fn is_hovering(&self, device_id: DeviceId, source: Source, display_id: DisplayId) -> bool {
        self.motion_mementos.iter().any(|m| {
            m.device_id == device_id
                && m.source == source
                && m.display_id == display_id
                && m.hovering
        })
    }

    /// Records a key delivery. Returns false when the event would leave the
    /// consumer with an inconsistent view and must not be sent.
    pub fn track_key(&mut self, key: &KeyEntry, policy_flags: PolicyFlags, action: KeyAction, flags: KeyFlags) -> bool {
        match action {
            KeyAction::Up => {
                if key.flags.get().contains(KeyFlags::FALLBACK) {
                    let up_code = key.key_code.get();
                    self.fallback_keys.retain(|_, fallback| *fallback != up_code);
                }
                if let Some(index) = self.find_key_memento(key) {
                    self.key_mementos.remove(index);
                }
                // A spurious up is allowed: a popup that stole focus never
                // saw the down, but still receives the up.
                true
            }
            KeyAction::Down => {
                if let Some(index) = self.find_key_memento(key) {
                    self.key_mementos.remove(index);
                }
                self.key_mementos.push(KeyMemento {
                    device_id: key.device_id,
                    source: key.source,
                    key_code: key.key_code.get(),
                    scan_code: key.scan_code.get(),
                    meta_state: key.meta_state.get(),
                    flags,
                    down_time: key.down_time.get(),
                    policy_flags,
                });
                true
            }
        }
    }

    /// Records a motion delivery. Returns false for deliveries that do not
    /// fit the tracked gesture state.
    pub fn track_motion(
        &mut self,
        motion: &MotionEntry,
        policy_flags: PolicyFlags,
        action: MotionAction,
        flags: MotionFlags,
    ) -> bool {
        match action {
            MotionAction::Up | MotionAction::Cancel => {
                if let Some(index) = self.find_motion_memento(motion, false) {
                    self.motion_mementos.remove(index);
                    true
                } else {
                    false
                }
            }
            MotionAction::Down => {
                if let Some(index) = self.find_motion_memento(motion, false) {
                    self.motion_mementos.remove(index);
                }
                self.add_motion_memento(motion, policy_flags, flags, false);
                true
            }
            MotionAction::PointerUp(_) | MotionAction::PointerDown(_) | MotionAction::Move => {
                if let Some(index) = self.find_motion_memento(motion, false) {
                    self.motion_mementos[index].set_pointers(motion);
                    return true;
                }
                // Joysticks and trackballs stream moves with no gesture.
                motion.source.is_streaming()
            }
            MotionAction::HoverExit => {
                if let Some(index) = self.find_motion_memento(motion, true) {
                    self.motion_mementos.remove(index);
                    true
                } else {
                    false
                }
            }
            MotionAction::HoverEnter | MotionAction::HoverMove => {
                if let Some(index) = self.find_motion_memento(motion, true) {
                    self.motion_mementos.remove(index);
                }
                self.add_motion_memento(motion, policy_flags, flags, true);
                true
            }
            MotionAction::Outside | MotionAction::Scroll => true,
        }
    }

    fn find_key_memento(&self, key: &KeyEntry) -> Option<usize> {
        self.key_mementos.iter().position(|m| {
            m.device_id == key.device_id
                && m.source == key.source
                && m.key_code == key.key_code.get()
                && m.scan_code == key.scan_code.get()
        })
    }

    fn find_motion_memento(&self, motion: &MotionEntry, hovering: bool) -> Option<usize> {
        self.motion_mementos.iter().position(|m| {
            m.device_id == motion.device_id
                && m.source == motion.source
                && m.display_id == motion.display_id
                && m.hovering == hovering
        })
    }

    fn add_motion_memento(
        &mut self,
        motion: &MotionEntry,
        policy_flags: PolicyFlags,
        flags: MotionFlags,
        hovering: bool,
    ) {
        self.motion_mementos.push(MotionMemento {
            device_id: motion.device_id,
            source: motion.source,
            display_id: motion.display_id,
            flags,
            x_precision: motion.x_precision,
            y_precision: motion.y_precision,
            down_time: motion.down_time,
            hovering,
            policy_flags,
            pointer_properties: motion.pointer_properties.clone(),
            pointer_coords: motion.pointer_coords.clone(),
        });
    }

    /// Builds the events that bring the consumer back in sync: one key-up
    /// with the `CANCELED` flag per held key, one cancel (or hover-exit) per
    /// gesture in progress, filtered by `options`.
    pub fn synthesize_cancelation_events(
        &self,
        current_time: Nanos,
        options: &CancelationOptions,
    ) -> Vec<EventRef> {
        let mut events = Vec::new();
        for memento in &self.key_mementos {
            if Self::should_cancel_key(memento, options) {
                events.push(EventEntry::new_key(
                    current_time,
                    memento.policy_flags,
                    memento.device_id,
                    memento.source,
                    KeyAction::Up,
                    memento.flags | KeyFlags::CANCELED,
                    memento.key_code,
                    memento.scan_code,
                    memento.meta_state,
                    0,
                    memento.down_time,
                ));
            }
        }
        for memento in &self.motion_mementos {
            if Self::should_cancel_motion(memento, options) {
                events.push(EventEntry::new_motion(
                    current_time,
                    memento.policy_flags,
                    MotionEntry {
                        device_id: memento.device_id,
                        source: memento.source,
                        display_id: memento.display_id,
                        action: if memento.hovering {
                            MotionAction::HoverExit
                        } else {
                            MotionAction::Cancel
                        },
                        flags: memento.flags,
                        meta_state: 0,
                        button_state: 0,
                        edge_flags: 0,
                        x_precision: memento.x_precision,
                        y_precision: memento.y_precision,
                        down_time: memento.down_time,
                        pointer_properties: memento.pointer_properties.clone(),
                        pointer_coords: memento.pointer_coords.clone(),
                    },
                ));
            }
        }
        events
    }

    pub fn clear(&mut self) {
        self.key_mementos.clear();
        self.motion_mementos.clear();
        self.fallback_keys.clear();
    }

    /// Moves pointer-class gesture memory to another connection, replacing
    /// whatever matching state it had. Used by touch-focus transfer.
    pub fn copy_pointer_state_to(&self, other: &mut InputState) {
        for memento in &self.motion_mementos {
            if memento.source.is_pointer() {
                other.motion_mementos.retain(|m| {
                    !(m.device_id == memento.device_id
                        && m.source == memento.source
                        && m.display_id == memento.display_id)
                });
                other.motion_mementos.push(MotionMemento {
                    device_id: memento.device_id,
                    source: memento.source,
                    display_id: memento.display_id,
                    flags: memento.flags,
                    x_precision: memento.x_precision,
                    y_precision: memento.y_precision,
                    down_time: memento.down_time,
                    hovering: memento.hovering,
                    policy_flags: memento.policy_flags,
                    pointer_properties: memento.pointer_properties.clone(),
                    pointer_coords: memento.pointer_coords.clone(),
                });
            }
        }
    }

    /// `None` when no fallback has been latched for this key;
    /// `Some(KEYCODE_UNKNOWN)` when the policy was consulted and declined.
    pub fn get_fallback_key(&self, original_key_code: KeyCode) -> Option<KeyCode> {
        self.fallback_keys.get(&original_key_code).copied()
    }

    pub fn set_fallback_key(&mut self, original_key_code: KeyCode, fallback_key_code: KeyCode) {
        self.fallback_keys.insert(original_key_code, fallback_key_code);
    }

    pub fn remove_fallback_key(&mut self, original_key_code: KeyCode) {
        self.fallback_keys.remove(&original_key_code);
    }

    fn should_cancel_key(memento: &KeyMemento, options: &CancelationOptions) -> bool {
        if options.key_code.is_some_and(|code| memento.key_code != code) {
            return false;
        }
        if options.device_id.is_some_and(|id| memento.device_id != id) {
            return false;
        }
        match options.mode {
            CancelationMode::All | CancelationMode::NonPointerEvents => true,
            CancelationMode::FallbackEvents => memento.flags.contains(KeyFlags::FALLBACK),
            CancelationMode::PointerEvents => false,
        }
    }

    fn should_cancel_motion(memento: &MotionMemento, options: &CancelationOptions) -> bool {
        if options.device_id.is_some_and(|id| memento.device_id != id) {
            return false;
        }
        match options.mode {
            CancelationMode::All => true,
            CancelationMode::PointerEvents => memento.source.is_pointer(),
            CancelationMode::NonPointerEvents => !memento.source.is_pointer(),
            CancelationMode::FallbackEvents => false,
        }
    }
}
