//! The policy seam between the dispatcher and the window manager.
//!
//! Everything behind this trait may block or re-enter the dispatcher through
//! its public handle, so the dispatcher only ever invokes it from the command
//! stage of the loop, after the state-machine work of the iteration is done.

use crate::dispatcher::window::{ApplicationHandle, WindowHandle};
use dispatch_event::{InputEvent, KeyEventArgs, Nanos, PolicyFlags, SwitchEventArgs};
use std::rc::Rc;

/// Tunables the dispatcher reads once at construction.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// delay before the first synthetic key repeat
    pub key_repeat_timeout: Nanos,
    /// delay between subsequent synthetic key repeats
    pub key_repeat_delay: Nanos,
    /// advisory ceiling on motion delivery rate, surfaced in diagnostics
    pub max_events_per_second: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            key_repeat_timeout: 500_000_000,
            key_repeat_delay: 50_000_000,
            max_events_per_second: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserActivityType {
    Other,
    Button,
    Touch,
}

pub trait DispatchPolicy {
    fn notify_configuration_changed(&self, _when: Nanos) {}

    /// An application failed to respond within its dispatching timeout.
    /// Returns a new timeout in nanoseconds to keep waiting, or a value
    /// `<= 0` to abandon the wait.
    fn notify_anr(
        &self,
        _application: Option<&Rc<ApplicationHandle>>,
        _window: Option<&Rc<WindowHandle>>,
    ) -> i64 {
        0
    }

    fn notify_input_channel_broken(&self, _window: Option<Rc<WindowHandle>>) {}

    /// Switch events bypass the inbound queue entirely.
    fn notify_switch(&self, _args: &SwitchEventArgs) {}

    fn get_dispatcher_configuration(&self) -> DispatcherConfig {
        DispatcherConfig::default()
    }

    fn is_key_repeat_enabled(&self) -> bool {
        true
    }

    /// When input filtering is enabled, every inbound event is offered to
    /// the filter first. Returning `false` consumes the event.
    fn filter_input_event(&self, _event: &InputEvent, _policy_flags: PolicyFlags) -> bool {
        true
    }

    /// Called at enqueue time. Expected to set `PASS_TO_USER` on events
    /// that should reach applications.
    fn intercept_key_before_queueing(&self, _event: &KeyEventArgs, _policy_flags: &mut PolicyFlags) {
    }

    fn intercept_motion_before_queueing(&self, _event_time: Nanos, _policy_flags: &mut PolicyFlags) {
    }

    /// Returns 0 to dispatch normally, a positive delay in nanoseconds to
    /// ask again later, or a negative value to drop the key.
    fn intercept_key_before_dispatching(
        &self,
        _window: Option<&Rc<WindowHandle>>,
        _event: &KeyEventArgs,
        _policy_flags: PolicyFlags,
    ) -> i64 {
        0
    }

    /// Offers an unhandled key back to the policy. Returning an event asks
    /// the dispatcher to redispatch it as a fallback.
    fn dispatch_unhandled_key(
        &self,
        _window: Option<&Rc<WindowHandle>>,
        _event: &KeyEventArgs,
        _policy_flags: PolicyFlags,
    ) -> Option<KeyEventArgs> {
        None
    }

    fn poke_user_activity(&self, _event_time: Nanos, _event_type: UserActivityType) {}

    /// Must be cheap and non-reentrant: this is the one policy method the
    /// dispatcher calls synchronously from resolver code.
    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        false
    }
}
