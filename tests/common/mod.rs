//! Shared harness for driving the dispatcher deterministically: a manual
//! clock, a scripted policy, and windows wired to in-process consumers.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use dispatch_event::{
    KeyAction, KeyCode, KeyEventArgs, KeyFlags, MotionAction, MotionEventArgs, MotionFlags, Nanos,
    PointerCoords, PointerProperties, PolicyFlags, Source, ToolType,
};
use dispatch_proto::{InputChannel, InputConsumer, TransportError, WireEvent};
use input_dispatch::dispatcher::window::{
    ApplicationHandle, LayoutFlags, Rect, WindowHandle, WindowInfo,
};
use input_dispatch::dispatcher::{Clock, Dispatcher};
use input_dispatch::policy::{DispatchPolicy, DispatcherConfig, UserActivityType};
use std::{cell::RefCell, rc::Rc};

pub const MS: Nanos = 1_000_000;

#[derive(Default)]
pub struct PolicyState {
    pub anr_calls: Vec<String>,
    /// what notify_anr returns; 0 gives up
    pub anr_response: i64,
    /// scripted response for dispatch_unhandled_key
    pub fallback_key: Option<KeyCode>,
    pub unhandled_key_calls: Vec<(KeyCode, KeyAction, bool)>,
    pub intercept_dispatch_delay: i64,
    pub key_repeat_enabled: bool,
    pub config: DispatcherConfig,
    pub user_activity_pokes: u32,
    pub broken_channels: u32,
    pub config_changes: u32,
    pub injection_allowed: bool,
}

pub struct TestPolicy {
    pub state: RefCell<PolicyState>,
}

impl TestPolicy {
    pub fn new() -> Rc<Self> {
        Rc::new(TestPolicy {
            state: RefCell::new(PolicyState {
                key_repeat_enabled: true,
                anr_response: 0,
                ..PolicyState::default()
            }),
        })
    }
}

impl DispatchPolicy for TestPolicy {
    fn notify_configuration_changed(&self, _when: Nanos) {
        self.state.borrow_mut().config_changes += 1;
    }

    fn notify_anr(
        &self,
        application: Option<&Rc<ApplicationHandle>>,
        window: Option<&Rc<WindowHandle>>,
    ) -> i64 {
        let name = window
            .map(|w| w.name().to_string())
            .or_else(|| application.map(|a| a.name().to_string()))
            .unwrap_or_else(|| "<unknown>".to_string());
        let mut state = self.state.borrow_mut();
        state.anr_calls.push(name);
        state.anr_response
    }

    fn notify_input_channel_broken(&self, _window: Option<Rc<WindowHandle>>) {
        self.state.borrow_mut().broken_channels += 1;
    }

    fn get_dispatcher_configuration(&self) -> DispatcherConfig {
        self.state.borrow().config
    }

    fn is_key_repeat_enabled(&self) -> bool {
        self.state.borrow().key_repeat_enabled
    }

    fn intercept_key_before_queueing(&self, _event: &KeyEventArgs, policy_flags: &mut PolicyFlags) {
        *policy_flags |= PolicyFlags::PASS_TO_USER;
    }

    fn intercept_motion_before_queueing(&self, _event_time: Nanos, policy_flags: &mut PolicyFlags) {
        *policy_flags |= PolicyFlags::PASS_TO_USER;
    }

    fn intercept_key_before_dispatching(
        &self,
        _window: Option<&Rc<WindowHandle>>,
        _event: &KeyEventArgs,
        _policy_flags: PolicyFlags,
    ) -> i64 {
        self.state.borrow().intercept_dispatch_delay
    }

    fn dispatch_unhandled_key(
        &self,
        _window: Option<&Rc<WindowHandle>>,
        event: &KeyEventArgs,
        _policy_flags: PolicyFlags,
    ) -> Option<KeyEventArgs> {
        let mut state = self.state.borrow_mut();
        state
            .unhandled_key_calls
            .push((event.key_code, event.action, event.flags.contains(KeyFlags::CANCELED)));
        state.fallback_key.map(|key_code| KeyEventArgs {
            key_code,
            scan_code: key_code + 8,
            ..event.clone()
        })
    }

    fn poke_user_activity(&self, _event_time: Nanos, _event_type: UserActivityType) {
        self.state.borrow_mut().user_activity_pokes += 1;
    }

    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        self.state.borrow().injection_allowed
    }
}

pub struct TestWindow {
    pub handle: Rc<WindowHandle>,
    pub channel: InputChannel,
    pub consumer: InputConsumer,
}

impl TestWindow {
    /// Drains every event currently delivered to this window.
    pub fn drain(&self) -> Vec<WireEvent> {
        let mut events = Vec::new();
        loop {
            match self.consumer.receive_event() {
                Ok(event) => events.push(event),
                Err(TransportError::WouldBlock) | Err(TransportError::Dead) => break,
                Err(err) => panic!("receive failed: {err}"),
            }
        }
        events
    }
}

pub struct WindowBuilder {
    info: WindowInfo,
    capacity: usize,
}

impl WindowBuilder {
    pub fn new(name: &str, frame: Rect) -> Self {
        let mut info = WindowInfo::default();
        info.name = name.to_string();
        info.frame = frame;
        info.touchable_region = vec![frame];
        // Overlapping test windows hit-test by region, not modality.
        info.layout_flags = LayoutFlags::NOT_TOUCH_MODAL;
        WindowBuilder {
            info,
            capacity: dispatch_proto::DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn flags(mut self, flags: LayoutFlags) -> Self {
        self.info.layout_flags |= flags;
        self
    }

    pub fn focused(mut self) -> Self {
        self.info.has_focus = true;
        self
    }

    pub fn owner_uid(mut self, uid: i32) -> Self {
        self.info.owner_uid = uid;
        self
    }

    pub fn display(mut self, display_id: i32) -> Self {
        self.info.display_id = display_id;
        self
    }

    pub fn dispatching_timeout(mut self, timeout: Nanos) -> Self {
        self.info.dispatching_timeout = timeout;
        self
    }

    pub fn application(mut self, application: &Rc<ApplicationHandle>) -> Self {
        self.info.application = Some(application.clone());
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn build(mut self) -> TestWindow {
        let (server, client) = InputChannel::pair_with_capacity(&self.info.name, self.capacity);
        self.info.input_channel = Some(server.clone());
        TestWindow {
            handle: WindowHandle::new(self.info),
            channel: server,
            consumer: InputConsumer::new(client),
        }
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub clock: Clock,
    pub policy: Rc<TestPolicy>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(TestPolicy::new())
    }

    pub fn with_policy(policy: Rc<TestPolicy>) -> Self {
        let clock = Clock::manual(0);
        let mut dispatcher = Dispatcher::new(policy.clone(), clock.clone());
        dispatcher.set_input_dispatch_mode(true, false);
        Harness {
            dispatcher,
            clock,
            policy,
        }
    }

    /// Runs loop iterations until the dispatcher stops asking to be woken
    /// immediately.
    pub fn pump(&mut self) {
        for _ in 0..128 {
            if self.dispatcher.dispatch_once() != Some(0) {
                return;
            }
        }
        panic!("dispatcher did not become quiescent");
    }

    pub fn advance(&mut self, nanos: Nanos) {
        self.clock.advance(nanos);
        self.pump();
    }

    pub fn register(&mut self, window: &TestWindow) {
        self.dispatcher
            .register_input_channel(window.channel.clone(), Some(window.handle.clone()), false)
            .expect("register window channel");
    }

    pub fn set_windows(&mut self, windows: &[&TestWindow]) {
        self.dispatcher
            .set_input_windows(windows.iter().map(|w| w.handle.clone()).collect());
        self.pump();
    }

    /// Acknowledges one delivery and lets the dispatcher react.
    pub fn finish(&mut self, window: &TestWindow, seq: u32, handled: bool) {
        window
            .consumer
            .send_finished_signal(seq, handled)
            .expect("send finished signal");
        self.dispatcher.handle_channel_ready(window.channel.id());
        self.pump();
    }

    /// Drains and acknowledges everything delivered to the window.
    pub fn drain_and_finish(&mut self, window: &TestWindow) -> Vec<WireEvent> {
        let events = window.drain();
        for event in &events {
            self.finish(window, event.seq(), true);
        }
        events
    }
}

pub fn key_args(event_time: Nanos, action: KeyAction, key_code: KeyCode) -> KeyEventArgs {
    KeyEventArgs {
        event_time,
        device_id: 1,
        source: Source::KEYBOARD,
        policy_flags: PolicyFlags::empty(),
        action,
        flags: KeyFlags::empty(),
        key_code,
        scan_code: key_code + 8,
        meta_state: 0,
        repeat_count: 0,
        down_time: event_time,
    }
}

pub fn motion_args(
    event_time: Nanos,
    action: MotionAction,
    down_time: Nanos,
    pointers: &[(u8, f32, f32)],
) -> MotionEventArgs {
    MotionEventArgs {
        event_time,
        device_id: 2,
        source: Source::TOUCHSCREEN,
        display_id: 0,
        policy_flags: PolicyFlags::empty(),
        action,
        flags: MotionFlags::empty(),
        meta_state: 0,
        button_state: 0,
        edge_flags: 0,
        x_precision: 1.0,
        y_precision: 1.0,
        down_time,
        pointer_properties: pointers
            .iter()
            .map(|&(id, _, _)| PointerProperties {
                id,
                tool_type: ToolType::Finger,
            })
            .collect(),
        pointer_coords: pointers
            .iter()
            .map(|&(_, x, y)| PointerCoords {
                x,
                y,
                pressure: 1.0,
                size: 0.5,
            })
            .collect(),
    }
}

pub fn rect(left: i32, top: i32, right: i32, bottom: i32) -> Rect {
    Rect::new(left, top, right, bottom)
}

/// Convenience: the motion actions of a delivered stream.
pub fn motion_actions(events: &[WireEvent]) -> Vec<MotionAction> {
    events
        .iter()
        .filter_map(|event| match event {
            WireEvent::Motion(motion) => Some(motion.action),
            WireEvent::Key(_) => None,
        })
        .collect()
}
