//! Async shell around the dispatcher core.
//!
//! The service owns the [`Dispatcher`] on a single-threaded task and pumps
//! it: one `dispatch_once` per iteration, then waiting for a request, a
//! consumer acknowledgement, or the next deadline. External callers hold a
//! [`DispatcherHandle`] and never touch the state directly.

use crate::dispatcher::entry::{InjectionResult, InjectionState, InjectionSyncMode};
use crate::dispatcher::window::{ApplicationHandle, WindowHandle};
use crate::dispatcher::{Clock, Dispatcher, RegisterError};
use crate::policy::DispatchPolicy;
use dispatch_event::{
    DeviceResetArgs, InputEvent, KeyEventArgs, MotionEventArgs, Nanos, PolicyFlags,
    SwitchEventArgs,
};
use dispatch_proto::{ChannelId, InputChannel};
use local_channel::mpsc::{channel, Receiver, Sender};
use std::{rc::Rc, time::Duration};
use tokio::sync::oneshot;
use tokio::task::spawn_local;

enum Request {
    NotifyConfigurationChanged {
        event_time: Nanos,
    },
    NotifyKey(KeyEventArgs),
    NotifyMotion(MotionEventArgs),
    NotifySwitch(SwitchEventArgs),
    NotifyDeviceReset(DeviceResetArgs),
    Inject {
        event: InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: InjectionSyncMode,
        timeout: Duration,
        policy_flags: PolicyFlags,
        reply: oneshot::Sender<InjectionResult>,
    },
    SetInputWindows(Vec<Rc<WindowHandle>>),
    SetFocusedApplication(Option<Rc<ApplicationHandle>>),
    SetInputDispatchMode {
        enabled: bool,
        frozen: bool,
    },
    SetInputFilterEnabled(bool),
    TransferTouchFocus {
        from: InputChannel,
        to: InputChannel,
        reply: oneshot::Sender<bool>,
    },
    RegisterInputChannel {
        channel: InputChannel,
        window: Option<Rc<WindowHandle>>,
        monitor: bool,
        reply: oneshot::Sender<Result<(), RegisterError>>,
    },
    UnregisterInputChannel {
        channel: InputChannel,
        reply: oneshot::Sender<Result<(), RegisterError>>,
    },
    Dump {
        reply: oneshot::Sender<String>,
    },
    Monitor {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable entry point into the dispatch loop. All methods enqueue work;
/// the async ones resolve once the loop has answered.
#[derive(Clone)]
pub struct DispatcherHandle {
    request_tx: Sender<Request>,
}

impl DispatcherHandle {
    fn send(&self, request: Request) {
        self.request_tx.send(request).expect("dispatch service gone");
    }

    pub fn notify_configuration_changed(&self, event_time: Nanos) {
        self.send(Request::NotifyConfigurationChanged { event_time });
    }

    pub fn notify_key(&self, args: KeyEventArgs) {
        self.send(Request::NotifyKey(args));
    }

    pub fn notify_motion(&self, args: MotionEventArgs) {
        self.send(Request::NotifyMotion(args));
    }

    pub fn notify_switch(&self, args: SwitchEventArgs) {
        self.send(Request::NotifySwitch(args));
    }

    pub fn notify_device_reset(&self, args: DeviceResetArgs) {
        self.send(Request::NotifyDeviceReset(args));
    }

    /// Injects an event, waiting according to `sync_mode` up to `timeout`.
    pub async fn inject_input_event(
        &self,
        event: InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: InjectionSyncMode,
        timeout: Duration,
        policy_flags: PolicyFlags,
    ) -> InjectionResult {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Request::Inject {
            event,
            injector_pid,
            injector_uid,
            sync_mode,
            timeout,
            policy_flags,
            reply,
        });
        reply_rx.await.unwrap_or(InjectionResult::Failed)
    }

    pub fn set_input_windows(&self, windows: Vec<Rc<WindowHandle>>) {
        self.send(Request::SetInputWindows(windows));
    }

    pub fn set_focused_application(&self, application: Option<Rc<ApplicationHandle>>) {
        self.send(Request::SetFocusedApplication(application));
    }

    pub fn set_input_dispatch_mode(&self, enabled: bool, frozen: bool) {
        self.send(Request::SetInputDispatchMode { enabled, frozen });
    }

    pub fn set_input_filter_enabled(&self, enabled: bool) {
        self.send(Request::SetInputFilterEnabled(enabled));
    }

    pub async fn transfer_touch_focus(&self, from: InputChannel, to: InputChannel) -> bool {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Request::TransferTouchFocus { from, to, reply });
        reply_rx.await.unwrap_or(false)
    }

    pub async fn register_input_channel(
        &self,
        channel: InputChannel,
        window: Option<Rc<WindowHandle>>,
        monitor: bool,
    ) -> Result<(), RegisterError> {
        let (reply, reply_rx) = oneshot::channel();
        let channel_id = channel.id();
        self.send(Request::RegisterInputChannel {
            channel,
            window,
            monitor,
            reply,
        });
        reply_rx
            .await
            .unwrap_or(Err(RegisterError::NotRegistered(channel_id)))
    }

    pub async fn unregister_input_channel(
        &self,
        channel: InputChannel,
    ) -> Result<(), RegisterError> {
        let (reply, reply_rx) = oneshot::channel();
        let channel_id = channel.id();
        self.send(Request::UnregisterInputChannel { channel, reply });
        reply_rx
            .await
            .unwrap_or(Err(RegisterError::NotRegistered(channel_id)))
    }

    pub async fn dump(&self) -> String {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Request::Dump { reply });
        reply_rx.await.unwrap_or_default()
    }

    /// Resolves once the dispatch loop has made a full iteration; used by
    /// watchdogs to prove the loop is alive.
    pub async fn monitor(&self) {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Request::Monitor { reply });
        let _ = reply_rx.await;
    }

    pub fn shutdown(&self) {
        self.send(Request::Shutdown);
    }
}

pub struct DispatchService {
    dispatcher: Dispatcher,
    request_rx: Receiver<Request>,
    ready_tx: Sender<ChannelId>,
    ready_rx: Receiver<ChannelId>,
    monitor_waiters: Vec<oneshot::Sender<()>>,
}

impl DispatchService {
    pub fn new(policy: Rc<dyn DispatchPolicy>, clock: Clock) -> (Self, DispatcherHandle) {
        let (request_tx, request_rx) = channel();
        let (ready_tx, ready_rx) = channel();
        let service = DispatchService {
            dispatcher: Dispatcher::new(policy, clock),
            request_rx,
            ready_tx,
            ready_rx,
            monitor_waiters: Vec::new(),
        };
        (service, DispatcherHandle { request_tx })
    }

    pub async fn run(&mut self) {
        loop {
            // Anyone monitoring learns the loop made it around.
            for waiter in self.monitor_waiters.drain(..) {
                let _ = waiter.send(());
            }

            let next_wakeup = self.dispatcher.dispatch_once();
            let now = self.dispatcher.clock().now();
            let timeout =
                next_wakeup.map(|deadline| Duration::from_nanos(deadline.saturating_sub(now)));

            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle_request(request) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                channel_id = self.ready_rx.recv() => {
                    if let Some(channel_id) = channel_id {
                        self.dispatcher.handle_channel_ready(channel_id);
                    }
                }
                _ = wait_for_deadline(timeout) => {}
                result = tokio::signal::ctrl_c() => {
                    if let Err(error) = result {
                        log::warn!("failed to wait for CTRL+C: {error}");
                    }
                    break;
                }
            }
        }
        log::info!("dispatch service exiting");
    }

    /// Returns true when the service should exit.
    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::NotifyConfigurationChanged { event_time } => {
                self.dispatcher.notify_configuration_changed(event_time);
            }
            Request::NotifyKey(args) => self.dispatcher.notify_key(args),
            Request::NotifyMotion(args) => self.dispatcher.notify_motion(args),
            Request::NotifySwitch(args) => self.dispatcher.notify_switch(args),
            Request::NotifyDeviceReset(args) => self.dispatcher.notify_device_reset(args),
            Request::Inject {
                event,
                injector_pid,
                injector_uid,
                sync_mode,
                timeout,
                policy_flags,
                reply,
            } => {
                match self.dispatcher.inject(
                    event,
                    injector_pid,
                    injector_uid,
                    sync_mode,
                    policy_flags,
                ) {
                    Err(error) => {
                        log::warn!("rejecting injected event: {error}");
                        let _ = reply.send(InjectionResult::Failed);
                    }
                    Ok(injection) => {
                        if sync_mode == InjectionSyncMode::None {
                            let _ = reply.send(InjectionResult::Succeeded);
                        } else {
                            spawn_local(wait_for_injection(injection, sync_mode, timeout, reply));
                        }
                    }
                }
            }
            Request::SetInputWindows(windows) => self.dispatcher.set_input_windows(windows),
            Request::SetFocusedApplication(application) => {
                self.dispatcher.set_focused_application(application);
            }
            Request::SetInputDispatchMode { enabled, frozen } => {
                self.dispatcher.set_input_dispatch_mode(enabled, frozen);
            }
            Request::SetInputFilterEnabled(enabled) => {
                self.dispatcher.set_input_filter_enabled(enabled);
            }
            Request::TransferTouchFocus { from, to, reply } => {
                let _ = reply.send(self.dispatcher.transfer_touch_focus(&from, &to));
            }
            Request::RegisterInputChannel {
                channel,
                window,
                monitor,
                reply,
            } => {
                let result =
                    self.dispatcher
                        .register_input_channel(channel.clone(), window, monitor);
                if result.is_ok() {
                    // Readiness of the consumer side wakes the loop, the way
                    // a readable fd would.
                    let ready_tx = self.ready_tx.clone();
                    let channel_id = channel.id();
                    channel.set_ready_listener(Some(Box::new(move || {
                        let _ = ready_tx.send(channel_id);
                    })));
                }
                let _ = reply.send(result);
            }
            Request::UnregisterInputChannel { channel, reply } => {
                channel.set_ready_listener(None);
                let _ = reply.send(self.dispatcher.unregister_input_channel(&channel));
            }
            Request::Dump { reply } => {
                let _ = reply.send(self.dispatcher.dump());
            }
            Request::Monitor { reply } => {
                self.monitor_waiters.push(reply);
            }
            Request::Shutdown => return true,
        }
        false
    }
}

async fn wait_for_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

async fn wait_for_injection(
    injection: Rc<InjectionState>,
    sync_mode: InjectionSyncMode,
    timeout: Duration,
    reply: oneshot::Sender<InjectionResult>,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut result = loop {
        let changed = injection.changed();
        let current = injection.result();
        if current != InjectionResult::Pending {
            break current;
        }
        tokio::select! {
            _ = changed => {}
            _ = tokio::time::sleep_until(deadline) => {
                log::debug!("timed out waiting for injection result");
                break InjectionResult::TimedOut;
            }
        }
    };

    if result == InjectionResult::Succeeded && sync_mode == InjectionSyncMode::WaitForFinished {
        loop {
            let changed = injection.changed();
            if injection.pending_foreground_dispatches() == 0 {
                break;
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    log::debug!("timed out waiting for pending foreground dispatches");
                    result = InjectionResult::TimedOut;
                    break;
                }
            }
        }
    }

    let _ = reply.send(result);
}
