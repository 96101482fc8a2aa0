//! Deferred policy interactions.
//!
//! Anything that may call into the policy is queued as a [`Command`] and run
//! at the bottom of the loop iteration, once the state-machine work of the
//! cycle is finished. A command handler must re-check connection state after
//! a policy call: the policy may have unregistered the channel through the
//! dispatcher's public handle in the meantime.

use crate::dispatcher::connection::{Connection, ConnectionStatus};
use crate::dispatcher::entry::{EventKind, EventRef, InterceptResult};
use crate::dispatcher::input_state::{CancelationMode, CancelationOptions};
use crate::dispatcher::window::{ApplicationHandle, WindowHandle};
use crate::dispatcher::{Dispatcher, SLOW_EVENT_PROCESSING_WARNING_TIMEOUT};
use crate::policy::UserActivityType;
use dispatch_event::{KeyAction, KeyFlags, Nanos, KEYCODE_UNKNOWN};
use std::{cell::RefCell, rc::Rc};

pub(crate) enum Command {
    NotifyConfigurationChanged {
        event_time: Nanos,
    },
    NotifyInputChannelBroken {
        connection: Rc<RefCell<Connection>>,
    },
    NotifyAnr {
        application: Option<Rc<ApplicationHandle>>,
        window: Option<Rc<WindowHandle>>,
    },
    InterceptKeyBeforeDispatching {
        window: Option<Rc<WindowHandle>>,
        entry: EventRef,
    },
    DispatchCycleFinished {
        connection: Rc<RefCell<Connection>>,
        seq: u32,
        handled: bool,
        finish_time: Nanos,
    },
    PokeUserActivity {
        event_time: Nanos,
        event_type: UserActivityType,
    },
}

impl Dispatcher {
    pub(crate) fn post_command(&mut self, command: Command) {
        self.command_queue.push_back(command);
    }

    pub(crate) fn have_commands(&self) -> bool {
        !self.command_queue.is_empty()
    }

    /// Runs every queued command, including the ones queued by the commands
    /// themselves. Returns true when any command ran.
    pub(crate) fn run_commands(&mut self) -> bool {
        if self.command_queue.is_empty() {
            return false;
        }
        while let Some(command) = self.command_queue.pop_front() {
            self.run_command(command);
        }
        true
    }

    fn run_command(&mut self, command: Command) {
        match command {
            Command::NotifyConfigurationChanged { event_time } => {
                self.policy.notify_configuration_changed(event_time);
            }
            Command::NotifyInputChannelBroken { connection } => {
                let (status, window) = {
                    let connection = connection.borrow();
                    (connection.status, connection.window.clone())
                };
                if status != ConnectionStatus::Zombie {
                    self.policy.notify_input_channel_broken(window);
                }
            }
            Command::NotifyAnr {
                application,
                window,
            } => {
                let new_timeout = self.policy.notify_anr(application.as_ref(), window.as_ref());
                let channel = window.as_ref().and_then(|w| w.input_channel());
                self.resume_after_targets_not_ready_timeout(new_timeout, channel);
            }
            Command::InterceptKeyBeforeDispatching { window, entry } => {
                self.do_intercept_key_before_dispatching(window, &entry);
            }
            Command::DispatchCycleFinished {
                connection,
                seq,
                handled,
                finish_time,
            } => {
                self.do_dispatch_cycle_finished(&connection, seq, handled, finish_time);
            }
            Command::PokeUserActivity {
                event_time,
                event_type,
            } => {
                self.policy.poke_user_activity(event_time, event_type);
            }
        }
    }

    fn do_intercept_key_before_dispatching(
        &mut self,
        window: Option<Rc<WindowHandle>>,
        entry: &EventRef,
    ) {
        let Some(args) = entry.key_args() else { return };
        let delay =
            self.policy
                .intercept_key_before_dispatching(window.as_ref(), &args, args.policy_flags);
        let Some(key) = entry.key() else { return };
        if delay < 0 {
            key.intercept.set(InterceptResult::Skip);
        } else if delay == 0 {
            key.intercept.set(InterceptResult::Continue);
        } else {
            key.intercept.set(InterceptResult::TryAgainLater {
                wakeup_time: self.clock.now() + delay as Nanos,
            });
        }
    }

    fn do_dispatch_cycle_finished(
        &mut self,
        connection: &Rc<RefCell<Connection>>,
        seq: u32,
        handled: bool,
        finish_time: Nanos,
    ) {
        let (event, has_foreground, delivery_time) = {
            let conn = connection.borrow();
            let Some(index) = conn.find_wait_queue_entry(seq) else {
                // Already drained by cancellation.
                return;
            };
            let dispatch_entry = &conn.wait_queue[index];
            (
                dispatch_entry.event.clone(),
                dispatch_entry.has_foreground_target(),
                dispatch_entry.delivery_time.get(),
            )
        };

        let duration = finish_time.saturating_sub(delivery_time);
        if duration > SLOW_EVENT_PROCESSING_WARNING_TIMEOUT {
            log::info!(
                "window '{}' spent {:.1}ms processing the last input event: {}",
                connection.borrow().window_name(),
                duration as f64 / 1_000_000.0,
                event.describe()
            );
        }

        let restart = match &event.kind {
            EventKind::Key(_) => self.after_key_event(connection, &event, has_foreground, handled),
            _ => false,
        };

        // The policy may have run in between; re-check the wait queue before
        // dequeuing.
        {
            let mut conn = connection.borrow_mut();
            if let Some(index) = conn.find_wait_queue_entry(seq) {
                if let Some(dispatch_entry) = conn.wait_queue.remove(index) {
                    if restart && conn.status == ConnectionStatus::Normal {
                        conn.outbound_queue.push_front(dispatch_entry);
                    }
                }
            }
        }

        let current_time = self.clock.now();
        self.start_dispatch_cycle(current_time, connection);
    }

    /// Post-handle fallback processing for keys. Returns true when the entry
    /// was rewritten into its fallback key and must be redispatched.
    fn after_key_event(
        &mut self,
        connection: &Rc<RefCell<Connection>>,
        event: &EventRef,
        has_foreground: bool,
        handled: bool,
    ) -> bool {
        let Some(key) = event.key() else { return false };
        if key.flags.get().contains(KeyFlags::FALLBACK) {
            // Fallback deliveries do not spawn further fallbacks.
            return false;
        }

        let original_key_code = key.key_code.get();
        let fallback_key_code = connection
            .borrow()
            .input_state
            .get_fallback_key(original_key_code);
        if key.action == KeyAction::Up {
            connection
                .borrow_mut()
                .input_state
                .remove_fallback_key(original_key_code);
        }

        if handled || !has_foreground {
            // The application consumed the original key (or is not a
            // foreground target): retire the associated fallback, if any.
            if let Some(fallback_key_code) = fallback_key_code {
                let window = connection.borrow().window.clone();
                let mut args = match event.key_args() {
                    Some(args) => args,
                    None => return false,
                };
                args.flags |= KeyFlags::CANCELED;
                self.policy
                    .dispatch_unhandled_key(window.as_ref(), &args, args.policy_flags);

                if fallback_key_code != KEYCODE_UNKNOWN {
                    let mut options = CancelationOptions::new(
                        CancelationMode::FallbackEvents,
                        "application handled the original non-fallback key or is no longer \
                         a foreground target, canceling previously dispatched fallback key",
                    );
                    options.key_code = Some(fallback_key_code);
                    self.synthesize_cancelation_events_for_connection(connection, &options);
                }
                connection
                    .borrow_mut()
                    .input_state
                    .remove_fallback_key(original_key_code);
            }
            return false;
        }

        let initial_down = key.action == KeyAction::Down && key.repeat_count.get() == 0;
        if fallback_key_code.is_none() && !initial_down {
            log::trace!(
                "unhandled key event: skipping fallback processing, not an initial down \
                 (code={original_key_code})"
            );
            return false;
        }

        // Ask the policy what to do with the unhandled key.
        let window = connection.borrow().window.clone();
        let args = match event.key_args() {
            Some(args) => args,
            None => return false,
        };
        let fallback_event =
            self.policy
                .dispatch_unhandled_key(window.as_ref(), &args, args.policy_flags);

        if connection.borrow().status != ConnectionStatus::Normal {
            connection
                .borrow_mut()
                .input_state
                .remove_fallback_key(original_key_code);
            return false;
        }

        let mut fallback = fallback_event.is_some();

        // The fallback keycode latches on the initial down and cannot change
        // for the rest of the key's lifecycle.
        let mut latched = if initial_down {
            let code = fallback_event
                .as_ref()
                .map(|e| e.key_code)
                .unwrap_or(KEYCODE_UNKNOWN);
            connection
                .borrow_mut()
                .input_state
                .set_fallback_key(original_key_code, code);
            code
        } else {
            match fallback_key_code {
                Some(code) => code,
                None => return false,
            }
        };

        if latched != KEYCODE_UNKNOWN
            && (!fallback || fallback_event.as_ref().map(|e| e.key_code) != Some(latched))
        {
            // The policy changed its mind; stop sending the old fallback.
            let mut options = CancelationOptions::new(
                CancelationMode::FallbackEvents,
                "canceling fallback, policy no longer desires it",
            );
            options.key_code = Some(latched);
            self.synthesize_cancelation_events_for_connection(connection, &options);

            fallback = false;
            latched = KEYCODE_UNKNOWN;
            if key.action != KeyAction::Up {
                connection
                    .borrow_mut()
                    .input_state
                    .set_fallback_key(original_key_code, latched);
            }
        }

        if fallback {
            if let Some(fallback_args) = fallback_event {
                // Rewrite the entry in place and restart its dispatch; the
                // FALLBACK flag keeps the redispatch out of this path.
                event.event_time.set(fallback_args.event_time);
                key.flags.set(fallback_args.flags | KeyFlags::FALLBACK);
                key.key_code.set(latched);
                key.scan_code.set(fallback_args.scan_code);
                key.meta_state.set(fallback_args.meta_state);
                key.repeat_count.set(fallback_args.repeat_count);
                key.down_time.set(fallback_args.down_time);
                key.synthetic_repeat.set(false);
                log::trace!(
                    "unhandled key event: dispatching fallback key, original={original_key_code} \
                     fallback={latched}"
                );
                return true;
            }
        }
        false
    }
}
