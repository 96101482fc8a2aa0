//! The input dispatcher core.
//!
//! One cooperative loop owns every piece of dispatch state. External callers
//! talk to it through [`crate::service::DispatcherHandle`], which funnels
//! requests onto the loop's task; tests drive [`Dispatcher::dispatch_once`]
//! directly with a manual clock. The loop never calls into the policy while
//! it is in the middle of mutating state: policy work is queued as commands
//! and runs at the end of the iteration.

pub mod command;
pub mod connection;
pub mod entry;
pub mod input_state;
pub mod targets;
pub mod window;

use crate::policy::{DispatchPolicy, DispatcherConfig, UserActivityType};
use command::Command;
use connection::{Connection, ConnectionStatus};
use dispatch_event::{
    validate_motion_event, EventValidationError, InputEvent, KeyAction, KeyEventArgs, KeyFlags,
};
use entry::{
    EventEntry, EventKind, EventRef, InjectionResult, InjectionState, InjectionSyncMode,
    InterceptResult, MotionEntry,
};
use input_state::{CancelationMode, CancelationOptions};
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    fmt::Write as _,
    rc::Rc,
    time::Instant,
};
use thiserror::Error;
use window::{ApplicationHandle, TouchState, WindowHandle};

use dispatch_event::{
    DeviceResetArgs, MotionAction, MotionEventArgs, Nanos, PolicyFlags, SwitchEventArgs,
    KEYCODE_ENDCALL, KEYCODE_HOME, MAIN_DISPLAY, META_ALT_LEFT_ON, META_ALT_ON,
    META_ALT_RIGHT_ON, META_CAPS_LOCK_ON, META_FUNCTION_ON, META_SHIFT_LEFT_ON, META_SHIFT_ON,
};
use dispatch_proto::{ChannelId, InputChannel};

/// Time to allow pending events to clear once an app switch key is on the
/// way; after this they are dropped wholesale.
pub const APP_SWITCH_TIMEOUT: Nanos = 500_000_000;

/// Events older than this are dropped instead of dispatched.
pub const STALE_EVENT_TIMEOUT: Nanos = 10_000_000_000;

/// How far touch delivery may stream ahead of the oldest unfinished event
/// before the window is considered busy.
pub const STREAM_AHEAD_EVENT_TIMEOUT: Nanos = 500_000_000;

/// Processing above this duration is logged even without an ANR.
pub const SLOW_EVENT_PROCESSING_WARNING_TIMEOUT: Nanos = 2_000_000_000;

/// Time source for the dispatcher. The manual variant drives deterministic
/// tests; everything production uses the monotonic one.
#[derive(Clone)]
pub enum Clock {
    Monotonic { origin: Instant },
    Manual { now: Rc<Cell<Nanos>> },
}

impl Clock {
    pub fn monotonic() -> Self {
        Clock::Monotonic {
            origin: Instant::now(),
        }
    }

    pub fn manual(start: Nanos) -> Self {
        Clock::Manual {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn now(&self) -> Nanos {
        match self {
            Clock::Monotonic { origin } => origin.elapsed().as_nanos() as Nanos,
            Clock::Manual { now } => now.get(),
        }
    }

    /// Advances a manual clock; no effect on the monotonic one.
    pub fn advance(&self, delta: Nanos) {
        if let Clock::Manual { now } = self {
            now.set(now.get() + delta);
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("input channel '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("input channel {0} is not registered")]
    NotRegistered(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetWaitCause {
    None,
    SystemNotReady,
    ApplicationNotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Policy,
    Disabled,
    AppSwitch,
    Blocked,
    Stale,
}

struct KeyRepeatState {
    last_key_entry: EventRef,
    /// `None` when the device generates its own repeats
    next_repeat_time: Option<Nanos>,
}

pub struct Dispatcher {
    pub(crate) policy: Rc<dyn DispatchPolicy>,
    pub(crate) clock: Clock,
    pub(crate) config: DispatcherConfig,

    pending_event: Option<EventRef>,
    inbound_queue: VecDeque<EventRef>,
    pub(crate) command_queue: VecDeque<Command>,

    app_switch_saw_key_down: bool,
    app_switch_due_time: Option<Nanos>,
    next_unblocked_event: Option<EventRef>,

    pub(crate) connections: HashMap<ChannelId, Rc<RefCell<Connection>>>,
    pub(crate) monitoring_channels: Vec<InputChannel>,

    dispatch_enabled: bool,
    dispatch_frozen: bool,
    input_filter_enabled: bool,

    pub(crate) windows: Vec<Rc<WindowHandle>>,
    pub(crate) focused_window: Option<Rc<WindowHandle>>,
    pub(crate) focused_application: Option<Rc<ApplicationHandle>>,
    pub(crate) touch_state: TouchState,
    pub(crate) last_hover_window: Option<Rc<WindowHandle>>,

    key_repeat: Option<KeyRepeatState>,

    pub(crate) target_wait_cause: TargetWaitCause,
    pub(crate) target_wait_start_time: Nanos,
    pub(crate) target_wait_timeout_time: Option<Nanos>,
    pub(crate) target_wait_expired: bool,
    pub(crate) target_wait_application: Option<Rc<ApplicationHandle>>,

    next_seq: u32,
    pub(crate) last_anr_state: Option<String>,
}

impl Dispatcher {
    pub fn new(policy: Rc<dyn DispatchPolicy>, clock: Clock) -> Self {
        let config = policy.get_dispatcher_configuration();
        Dispatcher {
            policy,
            clock,
            config,
            pending_event: None,
            inbound_queue: VecDeque::new(),
            command_queue: VecDeque::new(),
            app_switch_saw_key_down: false,
            app_switch_due_time: None,
            next_unblocked_event: None,
            connections: HashMap::new(),
            monitoring_channels: Vec::new(),
            dispatch_enabled: false,
            dispatch_frozen: false,
            input_filter_enabled: false,
            windows: Vec::new(),
            focused_window: None,
            focused_application: None,
            touch_state: TouchState::default(),
            last_hover_window: None,
            key_repeat: None,
            target_wait_cause: TargetWaitCause::None,
            target_wait_start_time: 0,
            target_wait_timeout_time: None,
            target_wait_expired: false,
            target_wait_application: None,
            next_seq: 0,
            last_anr_state: None,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn next_seq(&mut self) -> u32 {
        // Sequence number 0 is reserved and never handed out.
        loop {
            self.next_seq = self.next_seq.wrapping_add(1);
            if self.next_seq != 0 {
                return self.next_seq;
            }
        }
    }

    pub(crate) fn cap_wakeup(next_wakeup: &mut Option<Nanos>, deadline: Nanos) {
        *next_wakeup = Some(next_wakeup.map_or(deadline, |current| current.min(deadline)));
    }

    /// One iteration of the dispatch loop. Returns the deadline the caller
    /// should sleep until: `Some(0)` to come right back, `None` to wait for
    /// external input.
    pub fn dispatch_once(&mut self) -> Option<Nanos> {
        let mut next_wakeup: Option<Nanos> = None;

        // Skip the inner dispatch when commands are pending; they may mutate
        // the state the dispatch relies on.
        if !self.have_commands() {
            self.dispatch_once_inner(&mut next_wakeup);
        }

        if self.run_commands() {
            next_wakeup = Some(0);
        }
        next_wakeup
    }

    fn dispatch_once_inner(&mut self, next_wakeup: &mut Option<Nanos>) {
        let current_time = self.clock.now();

        // Stop repeating as soon as the policy forbids it, even before the
        // next key arrives.
        if !self.policy.is_key_repeat_enabled() {
            self.reset_key_repeat();
        }

        if self.dispatch_frozen {
            log::debug!("dispatch frozen, waiting some more");
            return;
        }

        let mut is_app_switch_due = self.app_switch_due_time.is_some_and(|t| t <= current_time);
        if let Some(due_time) = self.app_switch_due_time {
            Self::cap_wakeup(next_wakeup, due_time);
        }

        if self.pending_event.is_none() {
            if self.inbound_queue.is_empty() {
                if is_app_switch_due {
                    // The key we were waiting for will never arrive.
                    self.reset_pending_app_switch(false);
                    is_app_switch_due = false;
                }

                let mut repeat_due = false;
                if let Some(state) = &self.key_repeat {
                    if let Some(next_repeat_time) = state.next_repeat_time {
                        if current_time >= next_repeat_time {
                            repeat_due = true;
                        } else {
                            Self::cap_wakeup(next_wakeup, next_repeat_time);
                        }
                    }
                }
                if repeat_due {
                    self.pending_event = self.synthesize_key_repeat(current_time);
                }

                if self.pending_event.is_none() {
                    return;
                }
            } else {
                self.pending_event = self.inbound_queue.pop_front();
                log::trace!("inbound queue length: {}", self.inbound_queue.len());
            }

            if let Some(pending) = self.pending_event.clone() {
                if pending.policy_flags.get().contains(PolicyFlags::PASS_TO_USER) {
                    self.poke_user_activity(&pending);
                }
            }

            self.reset_anr_timeouts();
        }

        let Some(pending) = self.pending_event.clone() else {
            return;
        };

        let mut drop_reason = None;
        if !pending.policy_flags.get().contains(PolicyFlags::PASS_TO_USER) {
            drop_reason = Some(DropReason::Policy);
        } else if !self.dispatch_enabled {
            drop_reason = Some(DropReason::Disabled);
        }

        if self
            .next_unblocked_event
            .as_ref()
            .is_some_and(|e| Rc::ptr_eq(e, &pending))
        {
            self.next_unblocked_event = None;
        }

        let done = match &pending.kind {
            EventKind::ConfigurationChanged => {
                // configuration changes are never dropped
                drop_reason = None;
                self.dispatch_configuration_changed(&pending)
            }
            EventKind::DeviceReset { .. } => {
                drop_reason = None;
                self.dispatch_device_reset(&pending)
            }
            EventKind::Key(_) => {
                if is_app_switch_due {
                    if Self::is_app_switch_key_event(&pending) {
                        self.reset_pending_app_switch(true);
                    } else if drop_reason.is_none() {
                        drop_reason = Some(DropReason::AppSwitch);
                    }
                }
                if drop_reason.is_none() && self.is_stale_event(current_time, &pending) {
                    drop_reason = Some(DropReason::Stale);
                }
                if drop_reason.is_none() && self.next_unblocked_event.is_some() {
                    drop_reason = Some(DropReason::Blocked);
                }
                self.dispatch_key(current_time, &pending, &mut drop_reason, next_wakeup)
            }
            EventKind::Motion(_) => {
                if drop_reason.is_none() && is_app_switch_due {
                    drop_reason = Some(DropReason::AppSwitch);
                }
                if drop_reason.is_none() && self.is_stale_event(current_time, &pending) {
                    drop_reason = Some(DropReason::Stale);
                }
                if drop_reason.is_none() && self.next_unblocked_event.is_some() {
                    drop_reason = Some(DropReason::Blocked);
                }
                self.dispatch_motion(current_time, &pending, &mut drop_reason, next_wakeup)
            }
        };

        if done {
            if let Some(reason) = drop_reason {
                self.drop_inbound_event(&pending, reason);
            }
            self.release_pending_event();
            // Force the next poll to wake up immediately.
            *next_wakeup = Some(0);
        }
    }

    fn dispatch_configuration_changed(&mut self, entry: &EventRef) -> bool {
        // A keyboard may have been added or removed.
        self.reset_key_repeat();
        self.post_command(Command::NotifyConfigurationChanged {
            event_time: entry.event_time.get(),
        });
        true
    }

    fn dispatch_device_reset(&mut self, entry: &EventRef) -> bool {
        let EventKind::DeviceReset { device_id } = entry.kind else {
            return true;
        };
        let mut options = CancelationOptions::new(CancelationMode::All, "device was reset");
        options.device_id = Some(device_id);
        self.synthesize_cancelation_events_for_all_connections(&options);
        true
    }

    fn dispatch_key(
        &mut self,
        current_time: Nanos,
        entry: &EventRef,
        drop_reason: &mut Option<DropReason>,
        next_wakeup: &mut Option<Nanos>,
    ) -> bool {
        let Some(key) = entry.key() else { return true };

        if !entry.dispatch_in_progress.get() {
            let policy_flags = entry.policy_flags.get();
            if key.repeat_count.get() == 0
                && key.action == KeyAction::Down
                && policy_flags.contains(PolicyFlags::TRUSTED)
                && !policy_flags.contains(PolicyFlags::DISABLE_KEY_REPEAT)
            {
                let device_repeat_count = self.key_repeat.as_ref().and_then(|state| {
                    state.last_key_entry.key().and_then(|last| {
                        (last.key_code.get() == key.key_code.get())
                            .then(|| last.repeat_count.get())
                    })
                });
                match device_repeat_count {
                    Some(previous_count) => {
                        // Two identical downs in a row: the driver repeats on
                        // its own, so only count along.
                        key.repeat_count.set(previous_count + 1);
                        self.key_repeat = Some(KeyRepeatState {
                            last_key_entry: entry.clone(),
                            next_repeat_time: None,
                        });
                    }
                    None => {
                        self.key_repeat = Some(KeyRepeatState {
                            last_key_entry: entry.clone(),
                            next_repeat_time: Some(
                                entry.event_time.get() + self.config.key_repeat_timeout,
                            ),
                        });
                    }
                }
            } else if !key.synthetic_repeat.get() {
                self.reset_key_repeat();
            }

            if key.repeat_count.get() == 1 {
                key.flags.set(key.flags.get() | KeyFlags::LONG_PRESS);
            } else {
                key.flags.set(key.flags.get() - KeyFlags::LONG_PRESS);
            }

            entry.dispatch_in_progress.set(true);
            log::trace!("dispatching {}", entry.describe());
        }

        // The policy asked us to come back later for this key.
        if let InterceptResult::TryAgainLater { wakeup_time } = key.intercept.get() {
            if current_time < wakeup_time {
                Self::cap_wakeup(next_wakeup, wakeup_time);
                return false;
            }
            key.intercept.set(InterceptResult::Unknown);
        }

        match key.intercept.get() {
            InterceptResult::Unknown => {
                if entry.policy_flags.get().contains(PolicyFlags::PASS_TO_USER) {
                    self.post_command(Command::InterceptKeyBeforeDispatching {
                        window: self.focused_window.clone(),
                        entry: entry.clone(),
                    });
                    return false; // wait for the command to run
                }
                key.intercept.set(InterceptResult::Continue);
            }
            InterceptResult::Skip => {
                if drop_reason.is_none() {
                    *drop_reason = Some(DropReason::Policy);
                }
            }
            _ => {}
        }

        if let Some(reason) = *drop_reason {
            self.set_injection_result(
                entry,
                if reason == DropReason::Policy {
                    InjectionResult::Succeeded
                } else {
                    InjectionResult::Failed
                },
            );
            return true;
        }

        let mut targets = Vec::new();
        let result = self.find_focused_window_targets(current_time, entry, &mut targets, next_wakeup);
        if result == InjectionResult::Pending {
            return false;
        }
        self.set_injection_result(entry, result);
        if result != InjectionResult::Succeeded {
            return true;
        }

        self.add_monitoring_targets(&mut targets);
        self.dispatch_event_to_targets(current_time, entry, &targets);
        true
    }

    fn dispatch_motion(
        &mut self,
        current_time: Nanos,
        entry: &EventRef,
        drop_reason: &mut Option<DropReason>,
        next_wakeup: &mut Option<Nanos>,
    ) -> bool {
        let Some(motion) = entry.motion() else { return true };

        if !entry.dispatch_in_progress.get() {
            entry.dispatch_in_progress.set(true);
            log::trace!("dispatching {}", entry.describe());
        }

        if let Some(reason) = *drop_reason {
            self.set_injection_result(
                entry,
                if reason == DropReason::Policy {
                    InjectionResult::Succeeded
                } else {
                    InjectionResult::Failed
                },
            );
            return true;
        }

        let is_pointer_event = motion.is_pointer_event();
        let display_id = motion.display_id;

        let mut targets = Vec::new();
        let mut conflicting_pointer_actions = false;
        let result = if is_pointer_event {
            self.find_touched_window_targets(
                current_time,
                entry,
                &mut targets,
                next_wakeup,
                &mut conflicting_pointer_actions,
            )
        } else {
            self.find_focused_window_targets(current_time, entry, &mut targets, next_wakeup)
        };
        if result == InjectionResult::Pending {
            return false;
        }
        self.set_injection_result(entry, result);
        if result != InjectionResult::Succeeded {
            return true;
        }

        // Monitors only observe the main display.
        if display_id == MAIN_DISPLAY {
            self.add_monitoring_targets(&mut targets);
        }

        if conflicting_pointer_actions {
            let options =
                CancelationOptions::new(CancelationMode::PointerEvents, "conflicting pointer actions");
            self.synthesize_cancelation_events_for_all_connections(&options);
        }
        self.dispatch_event_to_targets(current_time, entry, &targets);
        true
    }

    // --- reader interface ---

    pub fn notify_configuration_changed(&mut self, event_time: Nanos) {
        log::trace!("notify configuration changed, event_time={event_time}");
        self.enqueue_inbound_event(EventEntry::new_configuration_changed(event_time));
    }

    pub fn notify_key(&mut self, args: KeyEventArgs) {
        log::trace!("notify {args}");

        let mut policy_flags = args.policy_flags;
        let mut flags = args.flags;
        let mut meta_state = args.meta_state;
        if policy_flags.contains(PolicyFlags::VIRTUAL)
            || flags.contains(KeyFlags::VIRTUAL_HARD_KEY)
        {
            policy_flags |= PolicyFlags::VIRTUAL;
            flags |= KeyFlags::VIRTUAL_HARD_KEY;
        }
        if policy_flags.contains(PolicyFlags::ALT) {
            meta_state |= META_ALT_ON | META_ALT_LEFT_ON;
        }
        if policy_flags.contains(PolicyFlags::ALT_GR) {
            meta_state |= META_ALT_ON | META_ALT_RIGHT_ON;
        }
        if policy_flags.contains(PolicyFlags::SHIFT) {
            meta_state |= META_SHIFT_ON | META_SHIFT_LEFT_ON;
        }
        if policy_flags.contains(PolicyFlags::CAPS_LOCK) {
            meta_state |= META_CAPS_LOCK_ON;
        }
        if policy_flags.contains(PolicyFlags::FUNCTION) {
            meta_state |= META_FUNCTION_ON;
        }
        policy_flags |= PolicyFlags::TRUSTED;

        let massaged = KeyEventArgs {
            policy_flags,
            flags,
            meta_state,
            repeat_count: 0,
            ..args
        };
        self.policy
            .intercept_key_before_queueing(&massaged, &mut policy_flags);

        if self.input_filter_enabled {
            policy_flags |= PolicyFlags::FILTERED;
            if !self
                .policy
                .filter_input_event(&InputEvent::Key(massaged.clone()), policy_flags)
            {
                return; // consumed by the filter
            }
        }

        let entry = EventEntry::new_key(
            massaged.event_time,
            policy_flags,
            massaged.device_id,
            massaged.source,
            massaged.action,
            flags,
            massaged.key_code,
            massaged.scan_code,
            meta_state,
            0,
            massaged.down_time,
        );
        self.enqueue_inbound_event(entry);
    }

    pub fn notify_motion(&mut self, args: MotionEventArgs) {
        log::trace!("notify {args}");
        if let Err(error) =
            validate_motion_event(args.action, &args.pointer_properties, &args.pointer_coords)
        {
            log::error!("dropping malformed motion event: {error}");
            return;
        }

        let mut policy_flags = args.policy_flags | PolicyFlags::TRUSTED;
        self.policy
            .intercept_motion_before_queueing(args.event_time, &mut policy_flags);

        if self.input_filter_enabled && args.display_id == MAIN_DISPLAY {
            policy_flags |= PolicyFlags::FILTERED;
            let filter_event = InputEvent::Motion {
                args: args.clone(),
                history: Vec::new(),
            };
            if !self.policy.filter_input_event(&filter_event, policy_flags) {
                return;
            }
        }

        let entry = EventEntry::new_motion(
            args.event_time,
            policy_flags,
            MotionEntry {
                device_id: args.device_id,
                source: args.source,
                display_id: args.display_id,
                action: args.action,
                flags: args.flags,
                meta_state: args.meta_state,
                button_state: args.button_state,
                edge_flags: args.edge_flags,
                x_precision: args.x_precision,
                y_precision: args.y_precision,
                down_time: args.down_time,
                pointer_properties: args.pointer_properties,
                pointer_coords: args.pointer_coords,
            },
        );
        self.enqueue_inbound_event(entry);
    }

    /// Switches bypass the queue and go straight to the policy.
    pub fn notify_switch(&self, mut args: SwitchEventArgs) {
        args.policy_flags |= PolicyFlags::TRUSTED;
        self.policy.notify_switch(&args);
    }

    pub fn notify_device_reset(&mut self, args: DeviceResetArgs) {
        log::trace!(
            "notify device reset, device={} event_time={}",
            args.device_id,
            args.event_time
        );
        self.enqueue_inbound_event(EventEntry::new_device_reset(args.event_time, args.device_id));
    }

    // --- injection ---

    /// Builds inbound entries for an injected event and returns the shared
    /// injection state the caller can wait on. Validation failures never
    /// reach the queue.
    pub fn inject(
        &mut self,
        event: InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: InjectionSyncMode,
        policy_flags: PolicyFlags,
    ) -> Result<Rc<InjectionState>, EventValidationError> {
        let mut policy_flags = policy_flags | PolicyFlags::INJECTED;
        if self.has_injection_permission(injector_pid, injector_uid) {
            policy_flags |= PolicyFlags::TRUSTED;
        }

        let mut entries: Vec<EventRef> = Vec::new();
        match event {
            InputEvent::Key(args) => {
                if args.flags.contains(KeyFlags::VIRTUAL_HARD_KEY) {
                    policy_flags |= PolicyFlags::VIRTUAL;
                }
                if !policy_flags.contains(PolicyFlags::FILTERED) {
                    self.policy
                        .intercept_key_before_queueing(&args, &mut policy_flags);
                }
                entries.push(EventEntry::new_key(
                    args.event_time,
                    policy_flags,
                    args.device_id,
                    args.source,
                    args.action,
                    args.flags,
                    args.key_code,
                    args.scan_code,
                    args.meta_state,
                    args.repeat_count,
                    args.down_time,
                ));
            }
            InputEvent::Motion { args, history } => {
                validate_motion_event(args.action, &args.pointer_properties, &args.pointer_coords)?;
                for sample in &history {
                    if sample.pointer_coords.len() != args.pointer_properties.len() {
                        return Err(EventValidationError::MismatchedPointerArrays {
                            properties: args.pointer_properties.len(),
                            coords: sample.pointer_coords.len(),
                        });
                    }
                }
                if !policy_flags.contains(PolicyFlags::FILTERED) {
                    self.policy
                        .intercept_motion_before_queueing(args.event_time, &mut policy_flags);
                }

                // Injected motion always targets the main display; older
                // samples in the chain come first.
                for sample in history {
                    entries.push(EventEntry::new_motion(
                        sample.event_time,
                        policy_flags,
                        MotionEntry {
                            device_id: args.device_id,
                            source: args.source,
                            display_id: MAIN_DISPLAY,
                            action: args.action,
                            flags: args.flags,
                            meta_state: args.meta_state,
                            button_state: args.button_state,
                            edge_flags: args.edge_flags,
                            x_precision: args.x_precision,
                            y_precision: args.y_precision,
                            down_time: args.down_time,
                            pointer_properties: args.pointer_properties.clone(),
                            pointer_coords: sample.pointer_coords,
                        },
                    ));
                }
                entries.push(EventEntry::new_motion(
                    args.event_time,
                    policy_flags,
                    MotionEntry {
                        device_id: args.device_id,
                        source: args.source,
                        display_id: MAIN_DISPLAY,
                        action: args.action,
                        flags: args.flags,
                        meta_state: args.meta_state,
                        button_state: args.button_state,
                        edge_flags: args.edge_flags,
                        x_precision: args.x_precision,
                        y_precision: args.y_precision,
                        down_time: args.down_time,
                        pointer_properties: args.pointer_properties,
                        pointer_coords: args.pointer_coords,
                    },
                ));
            }
        }

        let injection = InjectionState::new(injector_pid, injector_uid);
        if sync_mode == InjectionSyncMode::None {
            injection.mark_async();
        }
        if let Some(last) = entries.last() {
            last.set_injection(injection.clone());
        }

        for entry in entries {
            self.enqueue_inbound_event(entry);
        }
        Ok(injection)
    }

    pub(crate) fn set_injection_result(&self, entry: &EventEntry, result: InjectionResult) {
        let Some(injection) = entry.injection() else {
            return;
        };
        if injection.is_async() && !entry.policy_flags.get().contains(PolicyFlags::FILTERED) {
            // The injector is not waiting; log the outcome instead.
            match result {
                InjectionResult::Succeeded => {
                    log::trace!("asynchronous input event injection succeeded")
                }
                other => log::warn!("asynchronous input event injection failed: {other:?}"),
            }
        }
        injection.set_result(result);
    }

    // --- inbound queue admission ---

    fn enqueue_inbound_event(&mut self, entry: EventRef) {
        self.inbound_queue.push_back(entry.clone());
        log::trace!("inbound queue length: {}", self.inbound_queue.len());

        match &entry.kind {
            EventKind::Key(key) => {
                // App switch keys arm the preemption deadline on their up.
                if Self::is_app_switch_key_event(&entry) {
                    if key.action == KeyAction::Down {
                        self.app_switch_saw_key_down = true;
                    } else if self.app_switch_saw_key_down {
                        log::debug!("app switch is pending");
                        self.app_switch_due_time =
                            Some(entry.event_time.get() + APP_SWITCH_TIMEOUT);
                        self.app_switch_saw_key_down = false;
                    }
                }
            }
            EventKind::Motion(motion) => {
                // A touch aimed at a different application than the one we
                // are stuck waiting on lets us prune everything older.
                if motion.action == MotionAction::Down
                    && motion.is_pointer_event()
                    && self.target_wait_cause == TargetWaitCause::ApplicationNotReady
                    && self.target_wait_application.is_some()
                {
                    let x = motion.pointer_coords[0].x as i32;
                    let y = motion.pointer_coords[0].y as i32;
                    if let Some(touched) = self.find_touched_window_at(motion.display_id, x, y) {
                        let touched_application = touched.application();
                        let blocked_on = self.target_wait_application.clone();
                        let different = match (touched_application, blocked_on) {
                            (Some(a), Some(b)) => !Rc::ptr_eq(&a, &b),
                            (None, Some(_)) => true,
                            _ => false,
                        };
                        if different {
                            self.next_unblocked_event = Some(entry.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn drop_inbound_event(&mut self, entry: &EventRef, drop_reason: DropReason) {
        let reason = match drop_reason {
            DropReason::Policy => {
                log::debug!("dropped event because policy consumed it");
                "inbound event was dropped because the policy consumed it"
            }
            DropReason::Disabled => {
                log::info!("dropped event because input dispatch is disabled");
                "inbound event was dropped because input dispatch is disabled"
            }
            DropReason::AppSwitch => {
                log::info!("dropped event because of pending overdue app switch");
                "inbound event was dropped because of a pending overdue app switch"
            }
            DropReason::Blocked => {
                log::info!(
                    "dropped event because the current application is not responding and the \
                     user has started interacting with a different application"
                );
                "inbound event was dropped because the current application is not responding"
            }
            DropReason::Stale => {
                log::info!("dropped event because it is stale");
                "inbound event was dropped because it is stale"
            }
        };

        match &entry.kind {
            EventKind::Key(_) => {
                let options = CancelationOptions::new(CancelationMode::NonPointerEvents, reason);
                self.synthesize_cancelation_events_for_all_connections(&options);
            }
            EventKind::Motion(motion) => {
                let mode = if motion.is_pointer_event() {
                    CancelationMode::PointerEvents
                } else {
                    CancelationMode::NonPointerEvents
                };
                let options = CancelationOptions::new(mode, reason);
                self.synthesize_cancelation_events_for_all_connections(&options);
            }
            _ => {}
        }
    }

    fn is_app_switch_key_code(key_code: i32) -> bool {
        key_code == KEYCODE_HOME || key_code == KEYCODE_ENDCALL
    }

    fn is_app_switch_key_event(entry: &EventEntry) -> bool {
        let policy_flags = entry.policy_flags.get();
        entry.key().is_some_and(|key| {
            !key.flags.get().contains(KeyFlags::CANCELED)
                && Self::is_app_switch_key_code(key.key_code.get())
                && policy_flags.contains(PolicyFlags::TRUSTED)
                && policy_flags.contains(PolicyFlags::PASS_TO_USER)
        })
    }

    fn reset_pending_app_switch(&mut self, handled: bool) {
        self.app_switch_due_time = None;
        if handled {
            log::debug!("app switch has arrived");
        } else {
            log::debug!("app switch was abandoned");
        }
    }

    fn is_stale_event(&self, current_time: Nanos, entry: &EventEntry) -> bool {
        current_time.saturating_sub(entry.event_time.get()) >= STALE_EVENT_TIMEOUT
    }

    // --- pending event lifecycle ---

    fn release_pending_event(&mut self) {
        if let Some(entry) = self.pending_event.take() {
            self.reset_anr_timeouts();
            self.release_inbound_event(entry);
        }
    }

    fn release_inbound_event(&mut self, entry: EventRef) {
        if let Some(injection) = entry.injection() {
            if injection.result() == InjectionResult::Pending {
                log::debug!("injected inbound event was dropped");
                self.set_injection_result(&entry, InjectionResult::Failed);
            }
        }
        if self
            .next_unblocked_event
            .as_ref()
            .is_some_and(|e| Rc::ptr_eq(e, &entry))
        {
            self.next_unblocked_event = None;
        }
    }

    fn drain_inbound_queue(&mut self) {
        while let Some(entry) = self.inbound_queue.pop_front() {
            self.release_inbound_event(entry);
        }
    }

    // --- key repeat ---

    fn reset_key_repeat(&mut self) {
        self.key_repeat = None;
    }

    fn synthesize_key_repeat(&mut self, current_time: Nanos) -> Option<EventRef> {
        let repeat_entry = {
            let state = self.key_repeat.as_mut()?;
            let policy_flags = (state.last_key_entry.policy_flags.get() & PolicyFlags::RAW_MASK)
                | PolicyFlags::TRUSTED
                | PolicyFlags::PASS_TO_USER;

            if Rc::strong_count(&state.last_key_entry) == 1 {
                // Otherwise unreferenced; recycle it in place.
                let entry = state.last_key_entry.clone();
                let key = entry.key()?;
                entry.clear_injection();
                entry.dispatch_in_progress.set(false);
                entry.event_time.set(current_time);
                entry.policy_flags.set(policy_flags);
                key.intercept.set(InterceptResult::Unknown);
                key.repeat_count.set(key.repeat_count.get() + 1);
                key.synthetic_repeat.set(true);
                entry
            } else {
                let last = state.last_key_entry.clone();
                let key = last.key()?;
                let repeat = EventEntry::new_key(
                    current_time,
                    policy_flags,
                    key.device_id,
                    key.source,
                    key.action,
                    key.flags.get(),
                    key.key_code.get(),
                    key.scan_code.get(),
                    key.meta_state.get(),
                    key.repeat_count.get() + 1,
                    key.down_time.get(),
                );
                repeat.key()?.synthetic_repeat.set(true);
                state.last_key_entry = repeat.clone();
                repeat
            }
        };

        if let Some(state) = self.key_repeat.as_mut() {
            state.next_repeat_time = Some(current_time + self.config.key_repeat_delay);
        }
        Some(repeat_entry)
    }

    // --- user activity ---

    pub(crate) fn poke_user_activity(&mut self, entry: &EventRef) {
        if let Some(focused) = &self.focused_window {
            let suppressed = focused.info().is_some_and(|info| {
                info.input_features
                    .contains(window::InputFeatures::DISABLE_USER_ACTIVITY)
            });
            if suppressed {
                log::debug!("not poking user activity: disabled by focused window");
                return;
            }
        }

        let event_type = match &entry.kind {
            EventKind::Motion(motion) => {
                if motion.action == MotionAction::Cancel {
                    return;
                }
                if motion.is_pointer_event() {
                    UserActivityType::Touch
                } else {
                    UserActivityType::Other
                }
            }
            EventKind::Key(key) => {
                if key.flags.get().contains(KeyFlags::CANCELED) {
                    return;
                }
                UserActivityType::Button
            }
            _ => UserActivityType::Other,
        };

        self.post_command(Command::PokeUserActivity {
            event_time: entry.event_time.get(),
            event_type,
        });
    }

    // --- registry mutations ---

    /// Atomically replaces the window set. Order is front-to-back z-order.
    pub fn set_input_windows(&mut self, windows: Vec<Rc<WindowHandle>>) {
        log::debug!("set input windows: {} handles", windows.len());
        let old_windows = std::mem::replace(&mut self.windows, windows);
        self.windows
            .retain(|w| w.update_info() && w.input_channel().is_some());

        let mut new_focused_window = None;
        let mut found_hovered_window = false;
        for window in &self.windows {
            if window.info().is_some_and(|info| info.has_focus) {
                new_focused_window = Some(window.clone());
            }
            if self
                .last_hover_window
                .as_ref()
                .is_some_and(|hover| Rc::ptr_eq(hover, window))
            {
                found_hovered_window = true;
            }
        }
        if !found_hovered_window {
            self.last_hover_window = None;
        }

        if !opt_ptr_eq(&self.focused_window, &new_focused_window) {
            if let Some(old_focused) = self.focused_window.take() {
                log::debug!("focus left window: {}", old_focused.name());
                if let Some(channel) = old_focused.input_channel() {
                    let options = CancelationOptions::new(
                        CancelationMode::NonPointerEvents,
                        "focus left window",
                    );
                    self.synthesize_cancelation_events_for_channel(channel.id(), &options);
                }
            }
            if let Some(new_focused) = &new_focused_window {
                log::debug!("focus entered window: {}", new_focused.name());
            }
            self.focused_window = new_focused_window;
        }

        let removed_touched: Vec<Rc<WindowHandle>> = self
            .touch_state
            .windows
            .iter()
            .map(|t| t.window.clone())
            .filter(|w| !self.has_window_handle(w))
            .collect();
        for window in removed_touched {
            log::debug!("touched window was removed: {}", window.name());
            if let Some(channel) = window.input_channel() {
                let options = CancelationOptions::new(
                    CancelationMode::PointerEvents,
                    "touched window was removed",
                );
                self.synthesize_cancelation_events_for_channel(channel.id(), &options);
            }
            self.touch_state.remove_window(&window);
        }

        // Release info for windows that left the set, so their channels are
        // reclaimed promptly rather than when the handle finally drops.
        for old_window in old_windows {
            if !self.has_window_handle(&old_window) {
                log::debug!("window went away: {}", old_window.name());
                old_window.release_info();
            }
        }
    }

    pub fn set_focused_application(&mut self, application: Option<Rc<ApplicationHandle>>) {
        let changed = !opt_ptr_eq(&self.focused_application, &application);
        if changed && self.focused_application.is_some() {
            self.reset_anr_timeouts();
        }
        self.focused_application = application;
    }

    pub fn set_input_dispatch_mode(&mut self, enabled: bool, frozen: bool) {
        log::debug!("set input dispatch mode: enabled={enabled}, frozen={frozen}");
        if self.dispatch_enabled == enabled && self.dispatch_frozen == frozen {
            return;
        }
        if self.dispatch_frozen && !frozen {
            self.reset_anr_timeouts();
        }
        if self.dispatch_enabled && !enabled {
            self.reset_and_drop_everything("dispatcher is being disabled");
        }
        self.dispatch_enabled = enabled;
        self.dispatch_frozen = frozen;
    }

    pub fn set_input_filter_enabled(&mut self, enabled: bool) {
        log::debug!("set input filter enabled: {enabled}");
        if self.input_filter_enabled == enabled {
            return;
        }
        self.input_filter_enabled = enabled;
        self.reset_and_drop_everything("input filter is being enabled or disabled");
    }

    /// Reassigns the active gesture to another window's channel, cancelling
    /// it on the source. Both windows must live on the same display.
    pub fn transfer_touch_focus(&mut self, from: &InputChannel, to: &InputChannel) -> bool {
        let Some(from_window) = self.get_window_handle(from) else {
            log::debug!("cannot transfer touch focus: from window not found");
            return false;
        };
        let Some(to_window) = self.get_window_handle(to) else {
            log::debug!("cannot transfer touch focus: to window not found");
            return false;
        };
        if Rc::ptr_eq(&from_window, &to_window) {
            return true;
        }
        let from_display = from_window.info().map(|i| i.display_id);
        let to_display = to_window.info().map(|i| i.display_id);
        if from_display != to_display {
            log::debug!("cannot transfer touch focus: windows are on different displays");
            return false;
        }

        let mut found = false;
        for index in 0..self.touch_state.windows.len() {
            if Rc::ptr_eq(&self.touch_state.windows[index].window, &from_window) {
                let touched = self.touch_state.windows.remove(index);
                let new_target_flags = touched.target_flags
                    & (targets::TargetFlags::FOREGROUND
                        | targets::TargetFlags::SPLIT
                        | targets::TargetFlags::DISPATCH_AS_IS);
                self.touch_state
                    .add_or_update_window(&to_window, new_target_flags, touched.pointer_ids);
                found = true;
                break;
            }
        }
        if !found {
            log::debug!("touch focus transfer failed: from window did not have touch focus");
            return false;
        }

        let from_connection = self.connections.get(&from.id()).cloned();
        let to_connection = self.connections.get(&to.id()).cloned();
        if let (Some(from_connection), Some(to_connection)) = (from_connection, to_connection) {
            {
                let from_ref = from_connection.borrow();
                let mut to_ref = to_connection.borrow_mut();
                from_ref.input_state.copy_pointer_state_to(&mut to_ref.input_state);
            }
            let options = CancelationOptions::new(
                CancelationMode::PointerEvents,
                "transferring touch focus from this window to another window",
            );
            self.synthesize_cancelation_events_for_connection(&from_connection, &options);
        }
        true
    }

    pub(crate) fn reset_and_drop_everything(&mut self, reason: &'static str) {
        log::debug!("resetting and dropping all events ({reason})");

        let options = CancelationOptions::new(CancelationMode::All, reason);
        self.synthesize_cancelation_events_for_all_connections(&options);

        self.reset_key_repeat();
        self.release_pending_event();
        self.drain_inbound_queue();
        self.reset_anr_timeouts();

        self.touch_state.reset();
        self.last_hover_window = None;
    }

    // --- channel registration ---

    pub fn register_input_channel(
        &mut self,
        channel: InputChannel,
        window: Option<Rc<WindowHandle>>,
        monitor: bool,
    ) -> Result<(), RegisterError> {
        log::debug!(
            "channel '{}' ~ register input channel, monitor={monitor}",
            channel.name()
        );
        if self.connections.contains_key(&channel.id()) {
            log::warn!(
                "attempted to register already registered input channel '{}'",
                channel.name()
            );
            return Err(RegisterError::AlreadyRegistered(channel.name().to_string()));
        }
        let connection = Connection::new(channel.clone(), window, monitor);
        self.connections
            .insert(channel.id(), Rc::new(RefCell::new(connection)));
        if monitor {
            self.monitoring_channels.push(channel);
        }
        Ok(())
    }

    pub fn unregister_input_channel(&mut self, channel: &InputChannel) -> Result<(), RegisterError> {
        log::debug!("channel '{}' ~ unregister input channel", channel.name());
        self.unregister_input_channel_locked(channel.id(), false)
    }

    pub(crate) fn unregister_input_channel_locked(
        &mut self,
        channel_id: ChannelId,
        notify: bool,
    ) -> Result<(), RegisterError> {
        let Some(connection) = self.connections.remove(&channel_id) else {
            log::warn!("attempted to unregister unknown input channel id {channel_id}");
            return Err(RegisterError::NotRegistered(channel_id));
        };
        if connection.borrow().monitor {
            self.monitoring_channels.retain(|c| c.id() != channel_id);
        }
        let current_time = self.clock.now();
        self.abort_broken_dispatch_cycle(current_time, &connection, notify);
        connection.borrow_mut().status = ConnectionStatus::Zombie;
        Ok(())
    }

    // --- diagnostics ---

    pub fn dump(&self) -> String {
        let mut out = String::from("Input Dispatcher State:\n");
        out.push_str(&self.dump_state());
        if let Some(last_anr) = &self.last_anr_state {
            out.push_str("\nInput Dispatcher State at time of last ANR:\n");
            out.push_str(last_anr);
        }
        out
    }

    pub(crate) fn dump_state(&self) -> String {
        let current_time = self.clock.now();
        let mut dump = String::new();
        let out = &mut dump;

        let _ = writeln!(out, "  DispatchEnabled: {}", self.dispatch_enabled);
        let _ = writeln!(out, "  DispatchFrozen: {}", self.dispatch_frozen);
        match &self.focused_application {
            Some(application) => {
                let _ = writeln!(
                    out,
                    "  FocusedApplication: name='{}', dispatchingTimeout={:.3}ms",
                    application.name(),
                    application.dispatching_timeout(window::DEFAULT_DISPATCHING_TIMEOUT) as f64
                        / 1_000_000.0
                );
            }
            None => {
                let _ = writeln!(out, "  FocusedApplication: <null>");
            }
        }
        let _ = writeln!(
            out,
            "  FocusedWindow: name='{}'",
            self.focused_window
                .as_ref()
                .map_or("<null>", |w| w.name())
        );
        let _ = writeln!(out, "  TouchDown: {}", self.touch_state.down);
        let _ = writeln!(out, "  TouchSplit: {}", self.touch_state.split);
        let _ = writeln!(out, "  TouchDeviceId: {:?}", self.touch_state.device_id);
        let _ = writeln!(out, "  TouchSource: {:?}", self.touch_state.source);
        let _ = writeln!(out, "  TouchDisplayId: {:?}", self.touch_state.display_id);
        if self.touch_state.windows.is_empty() {
            let _ = writeln!(out, "  TouchedWindows: <none>");
        } else {
            let _ = writeln!(out, "  TouchedWindows:");
            for (index, touched) in self.touch_state.windows.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "    {index}: name='{}', pointerIds={}, targetFlags={:?}",
                    touched.window.name(),
                    touched.pointer_ids,
                    touched.target_flags
                );
            }
        }

        if self.windows.is_empty() {
            let _ = writeln!(out, "  Windows: <none>");
        } else {
            let _ = writeln!(out, "  Windows:");
            for (index, window) in self.windows.iter().enumerate() {
                match window.info() {
                    Some(info) => {
                        let _ = writeln!(
                            out,
                            "    {index}: name='{}', displayId={}, paused={}, hasFocus={}, \
                             hasWallpaper={}, visible={}, canReceiveKeys={}, flags={:?}, \
                             type={:?}, layer={}, frame={}, scale={}, ownerPid={}, ownerUid={}, \
                             dispatchingTimeout={:.3}ms",
                            info.name,
                            info.display_id,
                            info.paused,
                            info.has_focus,
                            info.has_wallpaper,
                            info.visible,
                            info.can_receive_keys,
                            info.layout_flags,
                            info.window_type,
                            info.layer,
                            info.frame,
                            info.scale_factor,
                            info.owner_pid,
                            info.owner_uid,
                            info.dispatching_timeout as f64 / 1_000_000.0
                        );
                    }
                    None => {
                        let _ = writeln!(out, "    {index}: name='{}', <released>", window.name());
                    }
                }
            }
        }

        if self.monitoring_channels.is_empty() {
            let _ = writeln!(out, "  MonitoringChannels: <none>");
        } else {
            let _ = writeln!(out, "  MonitoringChannels:");
            for (index, channel) in self.monitoring_channels.iter().enumerate() {
                let _ = writeln!(out, "    {index}: '{}'", channel.name());
            }
        }

        if self.inbound_queue.is_empty() {
            let _ = writeln!(out, "  InboundQueue: <empty>");
        } else {
            let _ = writeln!(out, "  InboundQueue: length={}", self.inbound_queue.len());
            for entry in &self.inbound_queue {
                let _ = writeln!(
                    out,
                    "    {}, age={:.1}ms",
                    entry.describe(),
                    current_time.saturating_sub(entry.event_time.get()) as f64 / 1_000_000.0
                );
            }
        }

        if self.connections.is_empty() {
            let _ = writeln!(out, "  Connections: <none>");
        } else {
            let _ = writeln!(out, "  Connections:");
            for (index, connection) in self.connections.values().enumerate() {
                let connection = connection.borrow();
                let _ = writeln!(
                    out,
                    "    {index}: channelName='{}', windowName='{}', status={}, monitor={}, \
                     publisherBlocked={}",
                    connection.channel.name(),
                    connection.window_name(),
                    connection.status.label(),
                    connection.monitor,
                    connection.publisher_blocked
                );
                if connection.outbound_queue.is_empty() {
                    let _ = writeln!(out, "      OutboundQueue: <empty>");
                } else {
                    let _ = writeln!(
                        out,
                        "      OutboundQueue: length={}",
                        connection.outbound_queue.len()
                    );
                }
                if connection.wait_queue.is_empty() {
                    let _ = writeln!(out, "      WaitQueue: <empty>");
                } else {
                    let _ = writeln!(
                        out,
                        "      WaitQueue: length={}",
                        connection.wait_queue.len()
                    );
                    for entry in &connection.wait_queue {
                        let _ = writeln!(
                            out,
                            "        {}, seq={}, age={:.1}ms, wait={:.1}ms",
                            entry.event.describe(),
                            entry.seq,
                            current_time.saturating_sub(entry.event.event_time.get()) as f64
                                / 1_000_000.0,
                            current_time.saturating_sub(entry.delivery_time.get()) as f64
                                / 1_000_000.0
                        );
                    }
                }
            }
        }

        match self.app_switch_due_time {
            Some(due_time) => {
                let _ = writeln!(
                    out,
                    "  AppSwitch: pending, due in {:.1}ms",
                    due_time.saturating_sub(current_time) as f64 / 1_000_000.0
                );
            }
            None => {
                let _ = writeln!(out, "  AppSwitch: not pending");
            }
        }

        let _ = writeln!(out, "  Configuration:");
        let _ = writeln!(
            out,
            "    KeyRepeatDelay: {:.1}ms",
            self.config.key_repeat_delay as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "    KeyRepeatTimeout: {:.1}ms",
            self.config.key_repeat_timeout as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "    MaxEventsPerSecond: {}",
            self.config.max_events_per_second
        );
        dump
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.reset_key_repeat();
        self.release_pending_event();
        self.drain_inbound_queue();
        let channel_ids: Vec<ChannelId> = self.connections.keys().copied().collect();
        for channel_id in channel_ids {
            let _ = self.unregister_input_channel_locked(channel_id, false);
        }
    }
}

pub(crate) fn opt_ptr_eq<T>(a: &Option<Rc<T>>, b: &Option<Rc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
