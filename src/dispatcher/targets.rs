//! Target resolution: deciding which connections receive an event, or why
//! the event must wait or be dropped instead.

use crate::dispatcher::entry::{EventEntry, EventKind, EventRef, InjectionResult, InjectionState};
use crate::dispatcher::input_state::{CancelationMode, CancelationOptions};
use crate::dispatcher::window::{
    ApplicationHandle, LayoutFlags, TouchState, WindowHandle, WindowType,
    DEFAULT_DISPATCHING_TIMEOUT,
};
use crate::dispatcher::{opt_ptr_eq, Dispatcher, TargetWaitCause, STREAM_AHEAD_EVENT_TIMEOUT};
use dispatch_event::{MotionAction, Nanos, PointerIdSet};
use dispatch_proto::InputChannel;
use std::rc::Rc;

bitflags::bitflags! {
    /// How one delivery to one window is to be performed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetFlags: u32 {
        /// primary recipient; ANR and injection-finished accounting apply
        const FOREGROUND         = 1 << 0;
        const WINDOW_IS_OBSCURED = 1 << 1;
        /// the motion event is split across multiple windows
        const SPLIT              = 1 << 2;
        /// deliver with zeroed coordinates
        const ZERO_COORDS        = 1 << 3;

        const DISPATCH_AS_IS             = 1 << 8;
        const DISPATCH_AS_OUTSIDE        = 1 << 9;
        const DISPATCH_AS_HOVER_ENTER    = 1 << 10;
        const DISPATCH_AS_HOVER_EXIT     = 1 << 11;
        const DISPATCH_AS_SLIPPERY_EXIT  = 1 << 12;
        const DISPATCH_AS_SLIPPERY_ENTER = 1 << 13;

        const DISPATCH_MASK = Self::DISPATCH_AS_IS.bits()
            | Self::DISPATCH_AS_OUTSIDE.bits()
            | Self::DISPATCH_AS_HOVER_ENTER.bits()
            | Self::DISPATCH_AS_HOVER_EXIT.bits()
            | Self::DISPATCH_AS_SLIPPERY_EXIT.bits()
            | Self::DISPATCH_AS_SLIPPERY_ENTER.bits();
    }
}

/// Destination plus the transform and pointer subset for one delivery.
#[derive(Debug, Clone)]
pub struct InputTarget {
    pub channel: InputChannel,
    pub flags: TargetFlags,
    pub x_offset: f32,
    pub y_offset: f32,
    pub scale_factor: f32,
    /// subset of pointer ids to deliver when FLAG_SPLIT is set
    pub pointer_ids: PointerIdSet,
}

fn add_window_target(
    window: &Rc<WindowHandle>,
    target_flags: TargetFlags,
    pointer_ids: PointerIdSet,
    targets: &mut Vec<InputTarget>,
) {
    let Some(info) = window.info() else {
        return;
    };
    let Some(channel) = info.input_channel.clone() else {
        return;
    };
    targets.push(InputTarget {
        channel,
        flags: target_flags,
        x_offset: -(info.frame.left as f32),
        y_offset: -(info.frame.top as f32),
        scale_factor: info.scale_factor,
        pointer_ids,
    });
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

impl Dispatcher {
    /// Resolves targets for keys and non-pointer motions: the focused
    /// window, once it is ready for more input.
    pub(crate) fn find_focused_window_targets(
        &mut self,
        current_time: Nanos,
        entry: &EventRef,
        targets: &mut Vec<InputTarget>,
        next_wakeup: &mut Option<Nanos>,
    ) -> InjectionResult {
        let Some(focused) = self.focused_window.clone() else {
            if self.focused_application.is_some() {
                return self.handle_targets_not_ready(
                    current_time,
                    entry,
                    self.focused_application.clone(),
                    None,
                    next_wakeup,
                    "no focused window, but the focused application may still \
                     bring one up",
                );
            }
            log::info!("dropping event: no focused window or focused application");
            return InjectionResult::Failed;
        };

        if !self.check_injection_permission(Some(&focused), entry.injection().as_ref()) {
            return InjectionResult::PermissionDenied;
        }

        if focused.info().is_some_and(|info| info.paused) {
            return self.handle_targets_not_ready(
                current_time,
                entry,
                self.focused_application.clone(),
                Some(focused),
                next_wakeup,
                "focused window is paused",
            );
        }

        if !self.is_window_ready_for_more_input(current_time, &focused, entry) {
            return self.handle_targets_not_ready(
                current_time,
                entry,
                self.focused_application.clone(),
                Some(focused),
                next_wakeup,
                "focused window has not finished processing earlier input",
            );
        }

        add_window_target(
            &focused,
            TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS,
            PointerIdSet::empty(),
            targets,
        );
        InjectionResult::Succeeded
    }

    /// Resolves targets for pointer motions: hit testing, splitting,
    /// slippery transfers, hover transitions, obscuration. The global touch
    /// state is only committed when the injector had permission.
    pub(crate) fn find_touched_window_targets(
        &mut self,
        current_time: Nanos,
        entry: &EventRef,
        targets: &mut Vec<InputTarget>,
        next_wakeup: &mut Option<Nanos>,
        conflicting_pointer_actions: &mut bool,
    ) -> InjectionResult {
        let EventKind::Motion(motion) = &entry.kind else {
            return InjectionResult::Failed;
        };

        let display_id = motion.display_id;
        let action = motion.action;
        let is_hover = action.is_hover();
        let new_gesture =
            matches!(action, MotionAction::Down | MotionAction::Scroll) || is_hover;

        let mut injection_permission = PermissionState::Unknown;
        let mut wrong_device = false;
        let mut new_hover_window: Option<Rc<WindowHandle>> = None;
        let mut is_split = self.touch_state.split;
        let switched_device = self.touch_state.device_id.is_some()
            && self.touch_state.display_id.is_some()
            && (self.touch_state.device_id != Some(motion.device_id)
                || self.touch_state.source != motion.source
                || self.touch_state.display_id != Some(display_id));
        let mut temp = TouchState::default();

        let result = 'resolve: {
            if new_gesture {
                let down = action == MotionAction::Down;
                if switched_device && self.touch_state.down && !down {
                    log::debug!("dropping event: a pointer for a different device is already down");
                    wrong_device = true;
                    break 'resolve InjectionResult::Failed;
                }
                temp.down = down;
                temp.device_id = Some(motion.device_id);
                temp.source = motion.source;
                temp.display_id = Some(display_id);
                is_split = false;
            } else {
                temp = self.touch_state.clone();
            }

            if new_gesture || (is_split && matches!(action, MotionAction::PointerDown(_))) {
                // New splittable pointer going down, or a target is needed
                // for a hover or scroll.
                let pointer_index = action.pointer_index();
                let x = motion.pointer_coords[pointer_index].x as i32;
                let y = motion.pointer_coords[pointer_index].y as i32;
                let mut new_touched: Option<Rc<WindowHandle>> = None;
                let mut top_error: Option<Rc<WindowHandle>> = None;

                for window in &self.windows {
                    let Some(info) = window.info() else { continue };
                    if info.display_id != display_id {
                        continue;
                    }
                    let flags = info.layout_flags;
                    if flags.contains(LayoutFlags::SYSTEM_ERROR) && top_error.is_none() {
                        top_error = Some(window.clone());
                    }
                    if info.visible {
                        if !flags.contains(LayoutFlags::NOT_TOUCHABLE) {
                            let touch_modal = !flags.intersects(
                                LayoutFlags::NOT_FOCUSABLE | LayoutFlags::NOT_TOUCH_MODAL,
                            );
                            if touch_modal || info.touchable_region_contains(x, y) {
                                new_touched = Some(window.clone());
                                break;
                            }
                        }
                        if action == MotionAction::Down
                            && flags.contains(LayoutFlags::WATCH_OUTSIDE_TOUCH)
                        {
                            let mut outside_flags = TargetFlags::DISPATCH_AS_OUTSIDE;
                            if self.is_window_obscured_at_point(window, x, y) {
                                outside_flags |= TargetFlags::WINDOW_IS_OBSCURED;
                            }
                            temp.add_or_update_window(window, outside_flags, PointerIdSet::empty());
                        }
                    }
                }

                // An error window that is not taking the touch is about to
                // be displayed; everything else may well be in ANR state.
                if let Some(top_error) = &top_error {
                    let error_is_target =
                        new_touched.as_ref().is_some_and(|w| Rc::ptr_eq(w, top_error));
                    if !error_is_target {
                        break 'resolve self.handle_targets_not_ready(
                            current_time,
                            entry,
                            None,
                            None,
                            next_wakeup,
                            "a system error window is about to be displayed",
                        );
                    }
                }

                if new_touched
                    .as_ref()
                    .is_some_and(|w| w.info().is_some_and(|i| i.supports_split_touch()))
                {
                    is_split = true;
                } else if is_split {
                    // The gesture is already split but this window cannot
                    // take part; ignore the new pointer.
                    new_touched = None;
                }

                if new_touched.is_none() {
                    new_touched = temp.first_foreground_window();
                }
                let new_touched = match new_touched {
                    Some(window) => window,
                    None => {
                        if action == MotionAction::Down && self.focused_application.is_some() {
                            break 'resolve self.handle_targets_not_ready(
                                current_time,
                                entry,
                                self.focused_application.clone(),
                                None,
                                next_wakeup,
                                "no touchable window can take the event, but the \
                                 focused application may still bring one up",
                            );
                        }
                        log::info!("dropping event: there is no touched window");
                        break 'resolve InjectionResult::Failed;
                    }
                };

                let mut target_flags = TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS;
                if is_split {
                    target_flags |= TargetFlags::SPLIT;
                }
                if self.is_window_obscured_at_point(&new_touched, x, y) {
                    target_flags |= TargetFlags::WINDOW_IS_OBSCURED;
                }

                if is_hover {
                    new_hover_window = Some(new_touched.clone());
                } else if action == MotionAction::Scroll {
                    new_hover_window = self.last_hover_window.clone();
                }

                let mut pointer_ids = PointerIdSet::empty();
                if is_split {
                    pointer_ids.insert(motion.pointer_properties[pointer_index].id);
                }
                temp.add_or_update_window(&new_touched, target_flags, pointer_ids);
            } else {
                // Pointer move, up, cancel or non-splittable pointer down.
                if !temp.down {
                    log::debug!(
                        "dropping event: pointer is not down or its down was dropped earlier"
                    );
                    break 'resolve InjectionResult::Failed;
                }

                // A single-pointer move may slip out of a slippery window.
                if action == MotionAction::Move
                    && motion.pointer_count() == 1
                    && temp.is_slippery()
                {
                    let x = motion.pointer_coords[0].x as i32;
                    let y = motion.pointer_coords[0].y as i32;
                    let old_touched = temp.first_foreground_window();
                    let slipped_into = self.find_touched_window_at(display_id, x, y);
                    if let (Some(old_touched), Some(new_touched)) = (old_touched, slipped_into) {
                        if !Rc::ptr_eq(&old_touched, &new_touched) {
                            log::debug!(
                                "touch is slipping out of window '{}' into window '{}'",
                                old_touched.name(),
                                new_touched.name()
                            );
                            temp.add_or_update_window(
                                &old_touched,
                                TargetFlags::DISPATCH_AS_SLIPPERY_EXIT,
                                PointerIdSet::empty(),
                            );

                            if new_touched.info().is_some_and(|i| i.supports_split_touch()) {
                                is_split = true;
                            }
                            let mut target_flags =
                                TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_SLIPPERY_ENTER;
                            if is_split {
                                target_flags |= TargetFlags::SPLIT;
                            }
                            if self.is_window_obscured_at_point(&new_touched, x, y) {
                                target_flags |= TargetFlags::WINDOW_IS_OBSCURED;
                            }
                            let mut pointer_ids = PointerIdSet::empty();
                            if is_split {
                                pointer_ids.insert(motion.pointer_properties[0].id);
                            }
                            temp.add_or_update_window(&new_touched, target_flags, pointer_ids);
                        }
                    }
                }
            }

            if !opt_ptr_eq(&new_hover_window, &self.last_hover_window) {
                if let Some(last_hover) = self.last_hover_window.clone() {
                    temp.add_or_update_window(
                        &last_hover,
                        TargetFlags::DISPATCH_AS_HOVER_EXIT,
                        PointerIdSet::empty(),
                    );
                }
                if let Some(new_hover) = &new_hover_window {
                    temp.add_or_update_window(
                        new_hover,
                        TargetFlags::DISPATCH_AS_HOVER_ENTER,
                        PointerIdSet::empty(),
                    );
                }
            }

            // Every touched foreground window must accept the injector, and
            // there must be at least one of them.
            let mut have_foreground_window = false;
            let mut permission_failed = false;
            for touched in &temp.windows {
                if touched.target_flags.contains(TargetFlags::FOREGROUND) {
                    have_foreground_window = true;
                    if !self
                        .check_injection_permission(Some(&touched.window), entry.injection().as_ref())
                    {
                        permission_failed = true;
                        break;
                    }
                }
            }
            if permission_failed {
                injection_permission = PermissionState::Denied;
                break 'resolve InjectionResult::PermissionDenied;
            }
            if !have_foreground_window {
                log::debug!("dropping event: no touched foreground window to receive it");
                break 'resolve InjectionResult::Failed;
            }
            injection_permission = PermissionState::Granted;

            // Outside-watching windows owned by a foreign uid must not learn
            // where the touch landed.
            if action == MotionAction::Down {
                if let Some(foreground) = temp.first_foreground_window() {
                    let foreground_uid = foreground.info().map(|i| i.owner_uid);
                    let outside_windows: Vec<Rc<WindowHandle>> = temp
                        .windows
                        .iter()
                        .filter(|t| t.target_flags.contains(TargetFlags::DISPATCH_AS_OUTSIDE))
                        .map(|t| t.window.clone())
                        .collect();
                    for window in outside_windows {
                        if window.info().map(|i| i.owner_uid) != foreground_uid {
                            temp.add_or_update_window(
                                &window,
                                TargetFlags::ZERO_COORDS,
                                PointerIdSet::empty(),
                            );
                        }
                    }
                }
            }

            let foreground_windows: Vec<Rc<WindowHandle>> = temp
                .windows
                .iter()
                .filter(|t| t.target_flags.contains(TargetFlags::FOREGROUND))
                .map(|t| t.window.clone())
                .collect();
            for window in foreground_windows {
                if window.info().is_some_and(|i| i.paused) {
                    break 'resolve self.handle_targets_not_ready(
                        current_time,
                        entry,
                        None,
                        Some(window),
                        next_wakeup,
                        "touched window is paused",
                    );
                }
                if !self.is_window_ready_for_more_input(current_time, &window, entry) {
                    break 'resolve self.handle_targets_not_ready(
                        current_time,
                        entry,
                        None,
                        Some(window),
                        next_wakeup,
                        "touched window has not finished processing earlier input",
                    );
                }
            }

            // Lock the wallpaper windows in for the duration of the gesture.
            if action == MotionAction::Down {
                let wants_wallpaper = temp
                    .first_foreground_window()
                    .and_then(|w| w.info())
                    .is_some_and(|i| i.has_wallpaper);
                if wants_wallpaper {
                    let wallpapers: Vec<Rc<WindowHandle>> = self
                        .windows
                        .iter()
                        .filter(|w| {
                            w.info().is_some_and(|i| {
                                i.display_id == display_id
                                    && i.window_type == WindowType::Wallpaper
                            })
                        })
                        .cloned()
                        .collect();
                    for wallpaper in wallpapers {
                        temp.add_or_update_window(
                            &wallpaper,
                            TargetFlags::WINDOW_IS_OBSCURED | TargetFlags::DISPATCH_AS_IS,
                            PointerIdSet::empty(),
                        );
                    }
                }
            }

            for touched in &temp.windows {
                add_window_target(
                    &touched.window,
                    touched.target_flags,
                    touched.pointer_ids,
                    targets,
                );
            }

            // Outside and hover-exit windows are of no interest for the rest
            // of the gesture.
            temp.filter_non_as_is_touch_windows();

            InjectionResult::Succeeded
        };

        if !matches!(result, InjectionResult::Pending | InjectionResult::TimedOut) {
            if injection_permission == PermissionState::Unknown {
                injection_permission =
                    if self.check_injection_permission(None, entry.injection().as_ref()) {
                        PermissionState::Granted
                    } else {
                        PermissionState::Denied
                    };
            }

            // Update the committed touch state, but only when the injector
            // was allowed to influence it at all.
            if injection_permission == PermissionState::Granted && !wrong_device {
                if switched_device {
                    log::debug!("conflicting pointer actions: switched to a different device");
                    *conflicting_pointer_actions = true;
                }

                match action {
                    MotionAction::HoverEnter | MotionAction::HoverMove | MotionAction::HoverExit => {
                        if self.touch_state.down {
                            log::debug!(
                                "conflicting pointer actions: hover received while pointer down"
                            );
                            *conflicting_pointer_actions = true;
                        }
                        self.touch_state.reset();
                        if matches!(
                            action,
                            MotionAction::HoverEnter | MotionAction::HoverMove
                        ) {
                            self.touch_state.device_id = Some(motion.device_id);
                            self.touch_state.source = motion.source;
                            self.touch_state.display_id = Some(display_id);
                        }
                    }
                    MotionAction::Up | MotionAction::Cancel => {
                        self.touch_state.reset();
                    }
                    MotionAction::Down => {
                        if self.touch_state.down {
                            log::debug!(
                                "conflicting pointer actions: down received while already down"
                            );
                            *conflicting_pointer_actions = true;
                        }
                        self.touch_state = temp.clone();
                    }
                    MotionAction::PointerUp(index) => {
                        if is_split {
                            let pointer_id = motion.pointer_properties[index as usize].id;
                            temp.windows.retain_mut(|touched| {
                                if touched.target_flags.contains(TargetFlags::SPLIT) {
                                    touched.pointer_ids.remove(pointer_id);
                                    if touched.pointer_ids.is_empty() {
                                        return false;
                                    }
                                }
                                true
                            });
                        }
                        self.touch_state = temp.clone();
                    }
                    MotionAction::Scroll => {
                        // discrete action; temporary state is discarded
                    }
                    _ => {
                        self.touch_state = temp.clone();
                    }
                }

                self.last_hover_window = new_hover_window.clone();
            } else {
                log::debug!("not updating touch focus: injection was denied");
            }
        }

        result
    }

    pub(crate) fn add_monitoring_targets(&self, targets: &mut Vec<InputTarget>) {
        for channel in &self.monitoring_channels {
            targets.push(InputTarget {
                channel: channel.clone(),
                flags: TargetFlags::DISPATCH_AS_IS,
                x_offset: 0.0,
                y_offset: 0.0,
                scale_factor: 1.0,
                pointer_ids: PointerIdSet::empty(),
            });
        }
    }

    /// Front-to-back hit test used outside of gesture resolution (blocked
    /// event detection, slippery transfer).
    pub(crate) fn find_touched_window_at(
        &self,
        display_id: dispatch_event::DisplayId,
        x: i32,
        y: i32,
    ) -> Option<Rc<WindowHandle>> {
        for window in &self.windows {
            let Some(info) = window.info() else { continue };
            if info.display_id != display_id {
                continue;
            }
            if info.visible && !info.layout_flags.contains(LayoutFlags::NOT_TOUCHABLE) {
                let touch_modal = !info
                    .layout_flags
                    .intersects(LayoutFlags::NOT_FOCUSABLE | LayoutFlags::NOT_TOUCH_MODAL);
                if touch_modal || info.touchable_region_contains(x, y) {
                    return Some(window.clone());
                }
            }
            if info.layout_flags.contains(LayoutFlags::SYSTEM_ERROR) {
                // Error window is on top but not visible; the touch is lost.
                return None;
            }
        }
        None
    }

    pub(crate) fn check_injection_permission(
        &self,
        window: Option<&Rc<WindowHandle>>,
        injection: Option<&Rc<InjectionState>>,
    ) -> bool {
        let Some(injection) = injection else {
            return true;
        };
        let owner_matches = window
            .and_then(|w| w.info())
            .is_some_and(|info| info.owner_uid == injection.injector_uid);
        if !owner_matches
            && !self.has_injection_permission(injection.injector_pid, injection.injector_uid)
        {
            match window {
                Some(window) => log::warn!(
                    "permission denied: injecting event from pid {} uid {} to window '{}'",
                    injection.injector_pid,
                    injection.injector_uid,
                    window.name()
                ),
                None => log::warn!(
                    "permission denied: injecting event from pid {} uid {}",
                    injection.injector_pid,
                    injection.injector_uid
                ),
            }
            return false;
        }
        true
    }

    pub(crate) fn has_injection_permission(&self, injector_pid: i32, injector_uid: i32) -> bool {
        injector_uid == 0
            || self
                .policy
                .check_inject_events_permission(injector_pid, injector_uid)
    }

    pub(crate) fn is_window_obscured_at_point(
        &self,
        window: &Rc<WindowHandle>,
        x: i32,
        y: i32,
    ) -> bool {
        let display_id = match window.info() {
            Some(info) => info.display_id,
            None => return false,
        };
        for other in &self.windows {
            if Rc::ptr_eq(other, window) {
                break;
            }
            let Some(info) = other.info() else { continue };
            if info.display_id == display_id
                && info.visible
                && !info.is_trusted_overlay()
                && info.frame_contains(x, y)
            {
                return true;
            }
        }
        false
    }

    /// Keys serialize behind everything previously delivered, because they
    /// may chase a focus change. Touches only pause once the consumer falls
    /// too far behind, so ANRs are still detected.
    pub(crate) fn is_window_ready_for_more_input(
        &self,
        current_time: Nanos,
        window: &Rc<WindowHandle>,
        entry: &EventEntry,
    ) -> bool {
        let Some(channel) = window.input_channel() else {
            return true;
        };
        let Some(connection) = self.connections.get(&channel.id()) else {
            return true;
        };
        let connection = connection.borrow();
        if connection.publisher_blocked {
            return false;
        }
        if matches!(entry.kind, EventKind::Key(_)) {
            return connection.outbound_queue.is_empty() && connection.wait_queue.is_empty();
        }
        if let Some(head) = connection.wait_queue.front() {
            if current_time >= head.event.event_time.get() + STREAM_AHEAD_EVENT_TIMEOUT {
                return false;
            }
        }
        true
    }

    /// Parks the pending event on a window or application that is not ready,
    /// arming the ANR timeout, or reports expiry.
    pub(crate) fn handle_targets_not_ready(
        &mut self,
        current_time: Nanos,
        entry: &EventEntry,
        application: Option<Rc<ApplicationHandle>>,
        window: Option<Rc<WindowHandle>>,
        next_wakeup: &mut Option<Nanos>,
        reason: &'static str,
    ) -> InjectionResult {
        if application.is_none() && window.is_none() {
            if self.target_wait_cause != TargetWaitCause::SystemNotReady {
                log::debug!("waiting for system to become ready for input: {reason}");
                self.target_wait_cause = TargetWaitCause::SystemNotReady;
                self.target_wait_start_time = current_time;
                self.target_wait_timeout_time = None;
                self.target_wait_expired = false;
                self.target_wait_application = None;
            }
        } else if self.target_wait_cause != TargetWaitCause::ApplicationNotReady {
            log::debug!(
                "waiting for {} to become ready for input: {reason}",
                application_window_label(application.as_ref(), window.as_ref())
            );
            let timeout = if let Some(window) = &window {
                window.dispatching_timeout(DEFAULT_DISPATCHING_TIMEOUT)
            } else if let Some(application) = &application {
                application.dispatching_timeout(DEFAULT_DISPATCHING_TIMEOUT)
            } else {
                DEFAULT_DISPATCHING_TIMEOUT
            };
            self.target_wait_cause = TargetWaitCause::ApplicationNotReady;
            self.target_wait_start_time = current_time;
            self.target_wait_timeout_time = Some(current_time + timeout);
            self.target_wait_expired = false;
            self.target_wait_application = window
                .as_ref()
                .and_then(|w| w.application())
                .or_else(|| application.clone());
        }

        if self.target_wait_expired {
            return InjectionResult::TimedOut;
        }

        if let Some(timeout_time) = self.target_wait_timeout_time {
            if current_time >= timeout_time {
                self.on_anr(current_time, application, window, entry.event_time.get(), reason);
                // Come back immediately once the policy answers.
                *next_wakeup = Some(0);
                return InjectionResult::Pending;
            }
            Self::cap_wakeup(next_wakeup, timeout_time);
        }
        InjectionResult::Pending
    }

    /// Called with the policy's answer to an ANR: a positive timeout
    /// extends the wait, anything else gives up on the target.
    pub(crate) fn resume_after_targets_not_ready_timeout(
        &mut self,
        new_timeout: i64,
        channel: Option<InputChannel>,
    ) {
        if new_timeout > 0 {
            self.target_wait_timeout_time = Some(self.clock.now() + new_timeout as Nanos);
            return;
        }

        self.target_wait_expired = true;
        let Some(channel) = channel else { return };
        let Some(connection) = self.connections.get(&channel.id()).cloned() else {
            return;
        };

        // The consumer's input state is no longer realistic.
        let (window, status) = {
            let connection = connection.borrow();
            (connection.window.clone(), connection.status)
        };
        if let Some(window) = window {
            self.touch_state.remove_window(&window);
        }
        if status == crate::dispatcher::connection::ConnectionStatus::Normal {
            let options =
                CancelationOptions::new(CancelationMode::All, "application not responding");
            self.synthesize_cancelation_events_for_connection(&connection, &options);
        }
    }

    pub(crate) fn reset_anr_timeouts(&mut self) {
        self.target_wait_cause = TargetWaitCause::None;
        self.target_wait_application = None;
    }

    fn on_anr(
        &mut self,
        current_time: Nanos,
        application: Option<Rc<ApplicationHandle>>,
        window: Option<Rc<WindowHandle>>,
        event_time: Nanos,
        reason: &'static str,
    ) {
        let label = application_window_label(application.as_ref(), window.as_ref());
        let dispatch_latency_ms = (current_time.saturating_sub(event_time)) as f64 / 1_000_000.0;
        let wait_duration_ms =
            (current_time.saturating_sub(self.target_wait_start_time)) as f64 / 1_000_000.0;
        log::info!(
            "application is not responding: {label}. It has been {dispatch_latency_ms:.1}ms \
             since event, {wait_duration_ms:.1}ms since wait started. Reason: {reason}"
        );

        let mut snapshot = String::new();
        snapshot.push_str("ANR:\n");
        snapshot.push_str(&format!("  Window: {label}\n"));
        snapshot.push_str(&format!("  DispatchLatency: {dispatch_latency_ms:.1}ms\n"));
        snapshot.push_str(&format!("  WaitDuration: {wait_duration_ms:.1}ms\n"));
        snapshot.push_str(&format!("  Reason: {reason}\n"));
        snapshot.push_str(&self.dump_state());
        self.last_anr_state = Some(snapshot);

        self.post_command(crate::dispatcher::command::Command::NotifyAnr {
            application,
            window,
        });
    }

    pub(crate) fn get_window_handle(&self, channel: &InputChannel) -> Option<Rc<WindowHandle>> {
        self.windows
            .iter()
            .find(|w| w.input_channel().is_some_and(|c| c.id() == channel.id()))
            .cloned()
    }

    pub(crate) fn has_window_handle(&self, handle: &Rc<WindowHandle>) -> bool {
        self.windows.iter().any(|w| Rc::ptr_eq(w, handle))
    }
}

pub(crate) fn application_window_label(
    application: Option<&Rc<ApplicationHandle>>,
    window: Option<&Rc<WindowHandle>>,
) -> String {
    match (application, window) {
        (Some(application), Some(window)) => {
            format!("{} - {}", application.name(), window.name())
        }
        (Some(application), None) => application.name().to_string(),
        (None, Some(window)) => window.name().to_string(),
        (None, None) => "<unknown application or window>".to_string(),
    }
}
