//! Per-connection delivery: the outbound and wait queues, the publish
//! cycle, and the cancellation plumbing that keeps consumers consistent.

use crate::dispatcher::command::Command;
use crate::dispatcher::entry::{DispatchEntry, EventEntry, EventKind, EventRef, MotionEntry, Resolved};
use crate::dispatcher::input_state::{CancelationOptions, InputState};
use crate::dispatcher::targets::{InputTarget, TargetFlags};
use crate::dispatcher::window::WindowHandle;
use crate::dispatcher::Dispatcher;
use dispatch_event::{MotionAction, Nanos, PointerCoords, PointerIdSet};
use dispatch_proto::{
    ChannelId, InputChannel, InputPublisher, TransportError, WireKeyEvent, WireMotionEvent,
};
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionStatus {
    /// everything is peachy
    Normal,
    /// an unrecoverable communication error has occurred
    Broken,
    /// the input channel has been unregistered
    Zombie,
}

impl ConnectionStatus {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Normal => "NORMAL",
            ConnectionStatus::Broken => "BROKEN",
            ConnectionStatus::Zombie => "ZOMBIE",
        }
    }
}

/// Dispatch state for one registered input channel.
pub(crate) struct Connection {
    pub status: ConnectionStatus,
    pub channel: InputChannel,
    pub window: Option<Rc<WindowHandle>>,
    pub monitor: bool,
    pub publisher: InputPublisher,
    pub publisher_blocked: bool,
    pub input_state: InputState,
    /// enqueued but not yet published
    pub outbound_queue: VecDeque<DispatchEntry>,
    /// published but not yet acknowledged
    pub wait_queue: VecDeque<DispatchEntry>,
}

impl Connection {
    pub(crate) fn new(
        channel: InputChannel,
        window: Option<Rc<WindowHandle>>,
        monitor: bool,
    ) -> Self {
        let publisher = InputPublisher::new(channel.clone());
        Connection {
            status: ConnectionStatus::Normal,
            channel,
            window,
            monitor,
            publisher,
            publisher_blocked: false,
            input_state: InputState::new(),
            outbound_queue: VecDeque::new(),
            wait_queue: VecDeque::new(),
        }
    }

    pub(crate) fn window_name(&self) -> &str {
        match &self.window {
            Some(window) => window.name(),
            None if self.monitor => "monitor",
            None => "?",
        }
    }

    pub(crate) fn find_wait_queue_entry(&self, seq: u32) -> Option<usize> {
        self.wait_queue.iter().position(|entry| entry.seq == seq)
    }
}

enum PublishOutcome {
    Settled,
    Broken,
}

impl Dispatcher {
    pub(crate) fn dispatch_event_to_targets(
        &mut self,
        current_time: Nanos,
        entry: &EventRef,
        targets: &[InputTarget],
    ) {
        self.poke_user_activity(entry);

        for target in targets {
            match self.connections.get(&target.channel.id()).cloned() {
                Some(connection) => {
                    self.prepare_dispatch_cycle(current_time, &connection, entry, target);
                }
                None => log::debug!(
                    "dropping delivery to channel '{}': no longer registered",
                    target.channel.name()
                ),
            }
        }
    }

    pub(crate) fn prepare_dispatch_cycle(
        &mut self,
        current_time: Nanos,
        connection: &Rc<RefCell<Connection>>,
        entry: &EventRef,
        target: &InputTarget,
    ) {
        // A broken connection must not accumulate further outbound events.
        {
            let connection = connection.borrow();
            if connection.status != ConnectionStatus::Normal {
                log::debug!(
                    "channel '{}' ~ dropping event, channel status is {}",
                    connection.channel.name(),
                    connection.status.label()
                );
                return;
            }
        }

        // Split the motion if this target only owns a subset of the pointers.
        if target.flags.contains(TargetFlags::SPLIT) {
            if let EventKind::Motion(motion) = &entry.kind {
                if target.pointer_ids.count() != motion.pointer_count() {
                    match split_motion_entry(entry, motion, target.pointer_ids) {
                        Some(split_entry) => {
                            self.enqueue_dispatch_entries(
                                current_time,
                                connection,
                                &split_entry,
                                target,
                            );
                        }
                        None => {
                            // broken pointer id sequence from the device
                        }
                    }
                    return;
                }
            }
        }

        self.enqueue_dispatch_entries(current_time, connection, entry, target);
    }

    fn enqueue_dispatch_entries(
        &mut self,
        current_time: Nanos,
        connection: &Rc<RefCell<Connection>>,
        entry: &EventRef,
        target: &InputTarget,
    ) {
        let was_empty = connection.borrow().outbound_queue.is_empty();

        // One dispatch entry per requested mode; a single target may ask for
        // several transmutations of the same event.
        for mode in [
            TargetFlags::DISPATCH_AS_HOVER_EXIT,
            TargetFlags::DISPATCH_AS_OUTSIDE,
            TargetFlags::DISPATCH_AS_HOVER_ENTER,
            TargetFlags::DISPATCH_AS_IS,
            TargetFlags::DISPATCH_AS_SLIPPERY_EXIT,
            TargetFlags::DISPATCH_AS_SLIPPERY_ENTER,
        ] {
            self.enqueue_dispatch_entry(connection, entry, target, mode);
        }

        if was_empty && !connection.borrow().outbound_queue.is_empty() {
            self.start_dispatch_cycle(current_time, connection);
        }
    }

    pub(crate) fn enqueue_dispatch_entry(
        &mut self,
        connection: &Rc<RefCell<Connection>>,
        entry: &EventRef,
        target: &InputTarget,
        dispatch_mode: TargetFlags,
    ) {
        if !target.flags.intersects(dispatch_mode) {
            return;
        }
        let target_flags = (target.flags & !TargetFlags::DISPATCH_MASK) | dispatch_mode;

        let resolved = match &entry.kind {
            EventKind::Key(key) => {
                let action = key.action;
                let flags = key.flags.get();
                let tracked = connection.borrow_mut().input_state.track_key(
                    key,
                    entry.policy_flags.get(),
                    action,
                    flags,
                );
                if !tracked {
                    log::debug!(
                        "channel '{}' ~ skipping inconsistent key event",
                        connection.borrow().channel.name()
                    );
                    return;
                }
                Resolved::Key { action, flags }
            }
            EventKind::Motion(motion) => {
                let mut action = if dispatch_mode.contains(TargetFlags::DISPATCH_AS_OUTSIDE) {
                    MotionAction::Outside
                } else if dispatch_mode.contains(TargetFlags::DISPATCH_AS_HOVER_EXIT) {
                    MotionAction::HoverExit
                } else if dispatch_mode.contains(TargetFlags::DISPATCH_AS_HOVER_ENTER) {
                    MotionAction::HoverEnter
                } else if dispatch_mode.contains(TargetFlags::DISPATCH_AS_SLIPPERY_EXIT) {
                    MotionAction::Cancel
                } else if dispatch_mode.contains(TargetFlags::DISPATCH_AS_SLIPPERY_ENTER) {
                    MotionAction::Down
                } else {
                    motion.action
                };
                if action == MotionAction::HoverMove
                    && !connection.borrow().input_state.is_hovering(
                        motion.device_id,
                        motion.source,
                        motion.display_id,
                    )
                {
                    // The consumer never saw the enter; fill it in.
                    action = MotionAction::HoverEnter;
                }

                let mut flags = motion.flags;
                if target_flags.contains(TargetFlags::WINDOW_IS_OBSCURED) {
                    flags |= dispatch_event::MotionFlags::WINDOW_IS_OBSCURED;
                }

                let tracked = connection.borrow_mut().input_state.track_motion(
                    motion,
                    entry.policy_flags.get(),
                    action,
                    flags,
                );
                if !tracked {
                    log::debug!(
                        "channel '{}' ~ skipping inconsistent motion event",
                        connection.borrow().channel.name()
                    );
                    return;
                }
                Resolved::Motion { action, flags }
            }
            _ => return,
        };

        let seq = self.next_seq();
        let dispatch_entry = DispatchEntry::new(
            seq,
            entry.clone(),
            target_flags,
            target.x_offset,
            target.y_offset,
            target.scale_factor,
            resolved,
        );

        let mut connection = connection.borrow_mut();
        connection.outbound_queue.push_back(dispatch_entry);
        log::trace!(
            "channel '{}' ~ outbound queue length: {}",
            connection.channel.name(),
            connection.outbound_queue.len()
        );
    }

    /// Publishes from the outbound queue until it drains, the transport
    /// pushes back, or the connection breaks.
    pub(crate) fn start_dispatch_cycle(
        &mut self,
        current_time: Nanos,
        connection: &Rc<RefCell<Connection>>,
    ) {
        let outcome = {
            let mut conn = connection.borrow_mut();
            let mut outcome = PublishOutcome::Settled;
            while conn.status == ConnectionStatus::Normal {
                let (seq, target_flags, x_offset, y_offset, scale_factor, resolved, event) = {
                    let Some(head) = conn.outbound_queue.front() else {
                        break;
                    };
                    head.delivery_time.set(current_time);
                    (
                        head.seq,
                        head.target_flags,
                        head.x_offset,
                        head.y_offset,
                        head.scale_factor,
                        head.resolved,
                        head.event.clone(),
                    )
                };

                let result = match (&event.kind, resolved) {
                    (EventKind::Key(key), Resolved::Key { action, flags }) => {
                        conn.publisher.publish_key_event(&WireKeyEvent {
                            seq,
                            device_id: key.device_id,
                            source: key.source,
                            action,
                            flags,
                            key_code: key.key_code.get(),
                            scan_code: key.scan_code.get(),
                            meta_state: key.meta_state.get(),
                            repeat_count: key.repeat_count.get(),
                            down_time: key.down_time.get(),
                            event_time: event.event_time.get(),
                        })
                    }
                    (EventKind::Motion(motion), Resolved::Motion { action, flags }) => {
                        let pointer_coords = transform_coords(
                            motion,
                            target_flags,
                            x_offset,
                            y_offset,
                            scale_factor,
                        );
                        conn.publisher.publish_motion_event(&WireMotionEvent {
                            seq,
                            device_id: motion.device_id,
                            source: motion.source,
                            display_id: motion.display_id,
                            action,
                            flags,
                            meta_state: motion.meta_state,
                            button_state: motion.button_state,
                            edge_flags: motion.edge_flags,
                            x_precision: motion.x_precision,
                            y_precision: motion.y_precision,
                            down_time: motion.down_time,
                            event_time: event.event_time.get(),
                            pointer_properties: motion.pointer_properties.clone(),
                            pointer_coords,
                        })
                    }
                    _ => Ok(()),
                };

                match result {
                    Ok(()) => {
                        if let Some(published) = conn.outbound_queue.pop_front() {
                            conn.wait_queue.push_back(published);
                        }
                        log::trace!(
                            "channel '{}' ~ wait queue length: {}",
                            conn.channel.name(),
                            conn.wait_queue.len()
                        );
                    }
                    Err(TransportError::WouldBlock) => {
                        if conn.wait_queue.is_empty() {
                            log::error!(
                                "channel '{}' ~ could not publish event because the pipe is \
                                 full, which is unexpected with an empty wait queue",
                                conn.channel.name()
                            );
                            outcome = PublishOutcome::Broken;
                        } else {
                            // The consumer needs to catch up first.
                            log::debug!(
                                "channel '{}' ~ pipe full, waiting for the application to \
                                 catch up",
                                conn.channel.name()
                            );
                            conn.publisher_blocked = true;
                        }
                        break;
                    }
                    Err(err) => {
                        log::error!(
                            "channel '{}' ~ could not publish event: {err}",
                            conn.channel.name()
                        );
                        outcome = PublishOutcome::Broken;
                        break;
                    }
                }
            }
            outcome
        };

        if let PublishOutcome::Broken = outcome {
            self.abort_broken_dispatch_cycle(current_time, connection, true);
        }
    }

    pub(crate) fn finish_dispatch_cycle(
        &mut self,
        current_time: Nanos,
        connection: &Rc<RefCell<Connection>>,
        seq: u32,
        handled: bool,
    ) {
        let status = {
            let mut conn = connection.borrow_mut();
            conn.publisher_blocked = false;
            conn.status
        };
        if status == ConnectionStatus::Broken || status == ConnectionStatus::Zombie {
            return;
        }

        // The interesting part (fallback keys, dequeue, next cycle) runs as
        // a command so it may talk to the policy.
        self.post_command(Command::DispatchCycleFinished {
            connection: connection.clone(),
            seq,
            handled,
            finish_time: current_time,
        });
    }

    /// Drains both queues and marks the connection broken. Cancellation is
    /// not synthesized: the consumer is gone.
    pub(crate) fn abort_broken_dispatch_cycle(
        &mut self,
        _current_time: Nanos,
        connection: &Rc<RefCell<Connection>>,
        notify: bool,
    ) {
        let newly_broken = {
            let mut conn = connection.borrow_mut();
            conn.outbound_queue.clear();
            conn.wait_queue.clear();
            if conn.status == ConnectionStatus::Normal {
                conn.status = ConnectionStatus::Broken;
                true
            } else {
                false
            }
        };

        if newly_broken && notify {
            log::error!(
                "channel '{}' ~ channel is unrecoverably broken and will be disposed",
                connection.borrow().channel.name()
            );
            self.post_command(Command::NotifyInputChannelBroken {
                connection: connection.clone(),
            });
        }
    }

    /// Drains finished signals after the transport signaled readability.
    pub fn handle_channel_ready(&mut self, channel_id: ChannelId) {
        let Some(connection) = self.connections.get(&channel_id).cloned() else {
            log::error!("spurious readiness callback for unknown input channel id {channel_id}");
            return;
        };
        let current_time = self.clock.now();

        loop {
            let received = connection.borrow().publisher.receive_finished_signal();
            match received {
                Ok((seq, handled)) => {
                    self.finish_dispatch_cycle(current_time, &connection, seq, handled);
                }
                Err(TransportError::WouldBlock) => return,
                Err(err) => {
                    let monitor = connection.borrow().monitor;
                    // Monitor channels close silently with their consumer.
                    let notify = !matches!(err, TransportError::Dead) || !monitor;
                    if notify {
                        log::error!(
                            "channel '{}' ~ failed to receive finished signal: {err}",
                            connection.borrow().channel.name()
                        );
                    }
                    let _ = self.unregister_input_channel_locked(channel_id, notify);
                    return;
                }
            }
        }
    }

    pub(crate) fn synthesize_cancelation_events_for_all_connections(
        &mut self,
        options: &CancelationOptions,
    ) {
        let connections: Vec<Rc<RefCell<Connection>>> = self.connections.values().cloned().collect();
        for connection in connections {
            self.synthesize_cancelation_events_for_connection(&connection, options);
        }
    }

    pub(crate) fn synthesize_cancelation_events_for_channel(
        &mut self,
        channel_id: ChannelId,
        options: &CancelationOptions,
    ) {
        if let Some(connection) = self.connections.get(&channel_id).cloned() {
            self.synthesize_cancelation_events_for_connection(&connection, options);
        }
    }

    pub(crate) fn synthesize_cancelation_events_for_connection(
        &mut self,
        connection: &Rc<RefCell<Connection>>,
        options: &CancelationOptions,
    ) {
        if connection.borrow().status == ConnectionStatus::Broken {
            return;
        }

        let current_time = self.clock.now();
        let events = connection
            .borrow()
            .input_state
            .synthesize_cancelation_events(current_time, options);
        if events.is_empty() {
            return;
        }

        let channel = connection.borrow().channel.clone();
        log::debug!(
            "channel '{}' ~ synthesized {} cancelation events to bring the channel back in \
             sync with reality: {}",
            channel.name(),
            events.len(),
            options.reason
        );

        // Use the window's current transform when it is still registered.
        let (x_offset, y_offset, scale_factor) = self
            .get_window_handle(&channel)
            .and_then(|w| w.info())
            .map_or((0.0, 0.0, 1.0), |info| {
                (
                    -(info.frame.left as f32),
                    -(info.frame.top as f32),
                    info.scale_factor,
                )
            });

        for event in events {
            let target = InputTarget {
                channel: channel.clone(),
                flags: TargetFlags::DISPATCH_AS_IS,
                x_offset,
                y_offset,
                scale_factor,
                pointer_ids: PointerIdSet::empty(),
            };
            self.enqueue_dispatch_entry(connection, &event, &target, TargetFlags::DISPATCH_AS_IS);
        }

        self.start_dispatch_cycle(current_time, connection);
    }
}

fn transform_coords(
    motion: &MotionEntry,
    target_flags: TargetFlags,
    x_offset: f32,
    y_offset: f32,
    scale_factor: f32,
) -> Vec<PointerCoords> {
    if target_flags.contains(TargetFlags::ZERO_COORDS) {
        // The recipient must not learn where the touch landed.
        return motion
            .pointer_coords
            .iter()
            .map(|_| PointerCoords::default())
            .collect();
    }
    if motion.source.is_pointer() {
        let dx = x_offset * scale_factor;
        let dy = y_offset * scale_factor;
        motion
            .pointer_coords
            .iter()
            .map(|coords| coords.scaled(scale_factor).offset(dx, dy))
            .collect()
    } else {
        motion.pointer_coords.clone()
    }
}

/// Carves the subset of pointers owned by one split target out of a motion
/// event, remapping the action's pointer index into the reduced array.
fn split_motion_entry(
    entry: &EventEntry,
    motion: &MotionEntry,
    pointer_ids: PointerIdSet,
) -> Option<EventRef> {
    let mut split_properties = Vec::new();
    let mut split_coords = Vec::new();
    for (index, properties) in motion.pointer_properties.iter().enumerate() {
        if pointer_ids.contains(properties.id) {
            split_properties.push(*properties);
            split_coords.push(motion.pointer_coords[index]);
        }
    }

    if split_properties.len() != pointer_ids.count() {
        // The move carries different pointers than the downs that led us to
        // split this way; the device sent a broken sequence.
        log::warn!(
            "dropping split motion event: expected {} pointers but found {}",
            pointer_ids.count(),
            split_properties.len()
        );
        return None;
    }

    let mut action = motion.action;
    if let MotionAction::PointerDown(index) | MotionAction::PointerUp(index) = motion.action {
        let changed_id = motion.pointer_properties[index as usize].id;
        if pointer_ids.contains(changed_id) {
            if pointer_ids.count() == 1 {
                // The first or last pointer of this target went down or up.
                action = match motion.action {
                    MotionAction::PointerDown(_) => MotionAction::Down,
                    _ => MotionAction::Up,
                };
            } else {
                let split_index = split_properties
                    .iter()
                    .position(|p| p.id == changed_id)
                    .unwrap_or(0) as u8;
                action = match motion.action {
                    MotionAction::PointerDown(_) => MotionAction::PointerDown(split_index),
                    _ => MotionAction::PointerUp(split_index),
                };
            }
        } else {
            // An unrelated pointer changed.
            action = MotionAction::Move;
        }
    }

    let split_entry = EventEntry::new_motion(
        entry.event_time.get(),
        entry.policy_flags.get(),
        MotionEntry {
            device_id: motion.device_id,
            source: motion.source,
            display_id: motion.display_id,
            action,
            flags: motion.flags,
            meta_state: motion.meta_state,
            button_state: motion.button_state,
            edge_flags: motion.edge_flags,
            x_precision: motion.x_precision,
            y_precision: motion.y_precision,
            down_time: motion.down_time,
            pointer_properties: split_properties,
            pointer_coords: split_coords,
        },
    );
    if let Some(injection) = entry.injection() {
        split_entry.set_injection(injection);
    }
    Some(split_entry)
}
