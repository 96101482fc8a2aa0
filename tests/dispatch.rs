//! End-to-end dispatcher scenarios, driven deterministically with a manual
//! clock and in-process consumers.

mod common;

use common::*;
use dispatch_event::{
    DeviceResetArgs, KeyAction, KeyFlags, MotionAction, PolicyFlags, Source, KEYCODE_HOME,
};
use dispatch_proto::WireEvent;
use input_dispatch::dispatcher::entry::{InjectionResult, InjectionSyncMode};
use input_dispatch::dispatcher::window::{ApplicationHandle, LayoutFlags};
use input_dispatch::policy::DispatcherConfig;
use dispatch_event::InputEvent;

fn expect_key(event: &WireEvent) -> &dispatch_proto::WireKeyEvent {
    match event {
        WireEvent::Key(key) => key,
        other => panic!("expected key event, got {other}"),
    }
}

fn expect_motion(event: &WireEvent) -> &dispatch_proto::WireMotionEvent {
    match event {
        WireEvent::Motion(motion) => motion,
        other => panic!("expected motion event, got {other}"),
    }
}

#[test]
fn focused_window_receives_keys() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("app", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();

    let events = window.drain();
    assert_eq!(events.len(), 1);
    let key = expect_key(&events[0]);
    assert_eq!(key.action, KeyAction::Down);
    assert_eq!(key.key_code, 30);
    assert!(harness.policy.state.borrow().user_activity_pokes > 0);
}

#[test]
fn keys_serialize_behind_unfinished_events() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("app", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    harness.dispatcher.notify_key(key_args(2, KeyAction::Up, 30));
    harness.pump();

    // The up waits until the down is acknowledged.
    let events = window.drain();
    assert_eq!(events.len(), 1);
    let down_seq = events[0].seq();

    harness.finish(&window, down_seq, true);
    let events = window.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(expect_key(&events[0]).action, KeyAction::Up);
}

// S1: two overlapping split-touch windows each own their pointer.
#[test]
fn split_touch_routes_pointers_to_separate_windows() {
    let mut harness = Harness::new();
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100))
        .flags(LayoutFlags::SPLIT_TOUCH)
        .build();
    let b = WindowBuilder::new("b", rect(50, 0, 150, 100))
        .flags(LayoutFlags::SPLIT_TOUCH)
        .build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    harness
        .dispatcher
        .notify_motion(motion_args(1, MotionAction::Down, 1, &[(7, 25.0, 50.0)]));
    harness.pump();

    let events = a.drain();
    assert_eq!(events.len(), 1);
    let down = expect_motion(&events[0]);
    assert_eq!(down.action, MotionAction::Down);
    assert_eq!(down.pointer_properties[0].id, 7);
    assert_eq!(down.pointer_coords[0].x, 25.0);
    assert!(b.drain().is_empty());

    harness.dispatcher.notify_motion(motion_args(
        2,
        MotionAction::PointerDown(1),
        1,
        &[(7, 25.0, 50.0), (3, 120.0, 50.0)],
    ));
    harness.pump();

    // The second pointer lands in b: b sees a fresh down with only its own
    // pointer, translated into its frame; a sees the split residue as a move.
    let b_events = b.drain();
    assert_eq!(b_events.len(), 1);
    let b_down = expect_motion(&b_events[0]);
    assert_eq!(b_down.action, MotionAction::Down);
    assert_eq!(b_down.pointer_properties.len(), 1);
    assert_eq!(b_down.pointer_properties[0].id, 3);
    assert_eq!(b_down.pointer_coords[0].x, 70.0);

    let a_events = a.drain();
    assert_eq!(a_events.len(), 1);
    let a_move = expect_motion(&a_events[0]);
    assert_eq!(a_move.action, MotionAction::Move);
    assert_eq!(a_move.pointer_properties.len(), 1);
    assert_eq!(a_move.pointer_properties[0].id, 7);
}

// S2: a slippery window hands the gesture over when the touch slides out.
#[test]
fn slippery_window_transfers_gesture_on_move() {
    let mut harness = Harness::new();
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100))
        .flags(LayoutFlags::SLIPPERY)
        .build();
    let b = WindowBuilder::new("b", rect(100, 0, 200, 100)).build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    harness
        .dispatcher
        .notify_motion(motion_args(1, MotionAction::Down, 1, &[(0, 50.0, 50.0)]));
    harness.pump();
    harness
        .dispatcher
        .notify_motion(motion_args(2, MotionAction::Move, 1, &[(0, 150.0, 50.0)]));
    harness.pump();

    assert_eq!(
        motion_actions(&a.drain()),
        vec![MotionAction::Down, MotionAction::Cancel]
    );
    let b_events = b.drain();
    assert_eq!(motion_actions(&b_events), vec![MotionAction::Down]);
    // coordinates are rewritten into b's frame
    assert_eq!(expect_motion(&b_events[0]).pointer_coords[0].x, 50.0);

    // The rest of the gesture belongs to b.
    harness
        .dispatcher
        .notify_motion(motion_args(3, MotionAction::Up, 1, &[(0, 160.0, 50.0)]));
    harness.pump();
    assert!(a.drain().is_empty());
    assert_eq!(motion_actions(&b.drain()), vec![MotionAction::Up]);
}

// S3: an unresponsive window draws exactly one ANR, and giving up cancels
// its state and fails the waiting injection.
#[test]
fn anr_fires_once_and_gives_up_when_policy_declines() {
    let policy = TestPolicy::new();
    // Repeats would park behind the stuck key and re-arm the wait.
    policy.state.borrow_mut().key_repeat_enabled = false;
    let mut harness = Harness::with_policy(policy);
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100))
        .focused()
        .dispatching_timeout(5_000 * MS)
        .build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    // First key is delivered and never acknowledged.
    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    assert_eq!(window.drain().len(), 1);

    // Injected key parks behind it.
    let injection = harness
        .dispatcher
        .inject(
            InputEvent::Key(key_args(2, KeyAction::Down, 31)),
            1,
            0,
            InjectionSyncMode::WaitForResult,
            PolicyFlags::empty(),
        )
        .expect("injection accepted");
    harness.pump();
    assert_eq!(injection.result(), InjectionResult::Pending);
    assert!(harness.policy.state.borrow().anr_calls.is_empty());

    harness.advance(5_001 * MS);

    assert_eq!(harness.policy.state.borrow().anr_calls, vec!["w".to_string()]);
    assert_eq!(injection.result(), InjectionResult::TimedOut);

    // Giving up synthesized a canceled key-up for the held key.
    let events = window.drain();
    assert_eq!(events.len(), 1);
    let canceled = expect_key(&events[0]);
    assert_eq!(canceled.action, KeyAction::Up);
    assert!(canceled.flags.contains(KeyFlags::CANCELED));
    assert_eq!(canceled.key_code, 30);

    // No further ANR for the same expired wait.
    harness.advance(10_000 * MS);
    assert_eq!(harness.policy.state.borrow().anr_calls.len(), 1);
}

// S3 variant: a positive policy answer extends the wait instead.
#[test]
fn anr_timeout_extension_keeps_waiting() {
    let policy = TestPolicy::new();
    policy.state.borrow_mut().anr_response = 2_000 * MS as i64;
    let mut harness = Harness::with_policy(policy);
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100))
        .focused()
        .dispatching_timeout(1_000 * MS)
        .build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    harness.dispatcher.notify_key(key_args(2, KeyAction::Up, 30));
    harness.pump();

    harness.advance(1_001 * MS);
    assert_eq!(harness.policy.state.borrow().anr_calls.len(), 1);

    // The extension holds; acknowledging revives delivery.
    let delivered = window.drain();
    assert_eq!(delivered.len(), 1);
    harness.finish(&window, delivered[0].seq(), true);
    let events = window.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(expect_key(&events[0]).action, KeyAction::Up);
}

// S4: synthetic key repeats fire on schedule, the first with LONG_PRESS.
#[test]
fn key_repeat_schedule_and_long_press_flag() {
    let policy = TestPolicy::new();
    policy.state.borrow_mut().config = DispatcherConfig {
        key_repeat_timeout: 400 * MS,
        key_repeat_delay: 50 * MS,
        max_events_per_second: 90,
    };
    let mut harness = Harness::with_policy(policy);
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(0, KeyAction::Down, 30));
    harness.pump();
    let initial = harness.drain_and_finish(&window);
    assert_eq!(expect_key(&initial[0]).repeat_count, 0);

    harness.advance(399 * MS);
    assert!(window.drain().is_empty());

    harness.advance(1 * MS);
    let first_repeat = harness.drain_and_finish(&window);
    assert_eq!(first_repeat.len(), 1);
    let key = expect_key(&first_repeat[0]);
    assert_eq!(key.repeat_count, 1);
    assert!(key.flags.contains(KeyFlags::LONG_PRESS));

    harness.advance(50 * MS);
    let second_repeat = harness.drain_and_finish(&window);
    let key = expect_key(&second_repeat[0]);
    assert_eq!(key.repeat_count, 2);
    assert!(!key.flags.contains(KeyFlags::LONG_PRESS));

    harness.advance(50 * MS);
    let third_repeat = harness.drain_and_finish(&window);
    assert_eq!(expect_key(&third_repeat[0]).repeat_count, 3);

    // Releasing the key stops the repeats.
    harness.dispatcher.notify_key(key_args(600 * MS, KeyAction::Up, 30));
    harness.pump();
    harness.drain_and_finish(&window);
    harness.advance(500 * MS);
    assert!(window.drain().is_empty());
}

// S5: an overdue app switch drops everything queued ahead of the HOME key.
#[test]
fn overdue_app_switch_preempts_stuck_events() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    // Delivered but never acknowledged: the window is unresponsive.
    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    let delivered = window.drain();
    assert_eq!(delivered.len(), 1);
    let stuck_seq = delivered[0].seq();

    // This key parks behind it and will be preempted.
    harness.dispatcher.notify_key(key_args(2, KeyAction::Down, 31));
    harness.pump();

    // Motion burst, then the app switch key pair.
    for i in 0..10u64 {
        harness.dispatcher.notify_motion(motion_args(
            3 + i,
            MotionAction::Down,
            3 + i,
            &[(0, 10.0, 10.0)],
        ));
    }
    harness
        .dispatcher
        .notify_key(key_args(20, KeyAction::Down, KEYCODE_HOME));
    harness.dispatcher.notify_key(key_args(20, KeyAction::Up, KEYCODE_HOME));

    // Deadline is HOME-up event time + 500ms.
    harness.advance(501 * MS);

    // The stuck key and the motions were dropped; dropping the key
    // synthesized a canceled up for the one key the window holds.
    let events = window.drain();
    assert_eq!(events.len(), 1);
    let canceled = expect_key(&events[0]);
    assert!(canceled.flags.contains(KeyFlags::CANCELED));
    assert_eq!(canceled.key_code, 30);
    let canceled_seq = canceled.seq;

    // Once the window drains its wait queue, the HOME pair arrives; the
    // dropped events never do.
    harness.finish(&window, stuck_seq, true);
    harness.finish(&window, canceled_seq, true);
    let mut home_actions = Vec::new();
    loop {
        let events = harness.drain_and_finish(&window);
        if events.is_empty() {
            break;
        }
        for event in &events {
            let key = expect_key(event);
            assert_eq!(key.key_code, KEYCODE_HOME);
            home_actions.push(key.action);
        }
    }
    assert_eq!(home_actions, vec![KeyAction::Down, KeyAction::Up]);
}

// S6: inconsistent motion is rejected without a crash or delivery.
#[test]
fn motion_up_without_down_is_dropped() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness
        .dispatcher
        .notify_motion(motion_args(1, MotionAction::Up, 1, &[(0, 10.0, 10.0)]));
    harness.pump();
    assert!(window.drain().is_empty());

    // The dispatcher is still fully functional afterwards.
    harness
        .dispatcher
        .notify_motion(motion_args(2, MotionAction::Down, 2, &[(0, 10.0, 10.0)]));
    harness.pump();
    assert_eq!(motion_actions(&window.drain()), vec![MotionAction::Down]);
}

#[test]
fn hover_stream_gets_enter_and_exit_filled_in() {
    let mut harness = Harness::new();
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100)).build();
    let b = WindowBuilder::new("b", rect(100, 0, 200, 100)).build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    let hover = |t: u64, x: f32| {
        let mut args = motion_args(t, MotionAction::HoverMove, t, &[(0, x, 50.0)]);
        args.source = Source::MOUSE;
        args
    };

    harness.dispatcher.notify_motion(hover(1, 10.0));
    harness.pump();
    assert_eq!(
        motion_actions(&a.drain()),
        vec![MotionAction::HoverEnter, MotionAction::HoverMove]
    );

    harness.dispatcher.notify_motion(hover(2, 20.0));
    harness.pump();
    assert_eq!(motion_actions(&a.drain()), vec![MotionAction::HoverMove]);

    // Crossing into b closes a's hover and opens b's.
    harness.dispatcher.notify_motion(hover(3, 150.0));
    harness.pump();
    assert_eq!(motion_actions(&a.drain()), vec![MotionAction::HoverExit]);
    assert_eq!(
        motion_actions(&b.drain()),
        vec![MotionAction::HoverEnter, MotionAction::HoverMove]
    );
}

#[test]
fn monitors_see_keys_and_main_display_motion_only() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    let secondary = WindowBuilder::new("s", rect(0, 0, 100, 100)).display(1).build();
    let (monitor_server, monitor_client) = dispatch_proto::InputChannel::pair("monitor");
    let monitor = dispatch_proto::InputConsumer::new(monitor_client);
    harness.register(&window);
    harness.register(&secondary);
    harness
        .dispatcher
        .register_input_channel(monitor_server, None, true)
        .expect("register monitor");
    harness.set_windows(&[&window, &secondary]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    harness
        .dispatcher
        .notify_motion(motion_args(2, MotionAction::Down, 2, &[(0, 10.0, 10.0)]));
    harness.pump();
    harness
        .dispatcher
        .notify_motion(motion_args(3, MotionAction::Up, 2, &[(0, 10.0, 10.0)]));
    harness.pump();

    let mut monitored = Vec::new();
    while let Ok(event) = monitor.receive_event() {
        monitored.push(event);
    }
    assert_eq!(monitored.len(), 3);

    // Secondary-display motion is not copied to monitors.
    let mut secondary_motion = motion_args(4, MotionAction::Down, 4, &[(1, 10.0, 10.0)]);
    secondary_motion.display_id = 1;
    secondary_motion.device_id = 7;
    harness.dispatcher.notify_motion(secondary_motion);
    harness.pump();

    assert_eq!(motion_actions(&secondary.drain()), vec![MotionAction::Down]);
    assert!(monitor.receive_event().is_err());
}

#[test]
fn device_reset_cancels_only_that_device() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    // Key from device 1, touch from device 2.
    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    harness
        .dispatcher
        .notify_motion(motion_args(2, MotionAction::Down, 2, &[(0, 10.0, 10.0)]));
    harness.pump();
    harness.drain_and_finish(&window);

    harness.dispatcher.notify_device_reset(DeviceResetArgs {
        event_time: 3,
        device_id: 2,
    });
    harness.pump();

    let events = window.drain();
    assert_eq!(events.len(), 1);
    let cancel = expect_motion(&events[0]);
    assert_eq!(cancel.action, MotionAction::Cancel);
    assert_eq!(cancel.device_id, 2);
}

#[test]
fn removing_touched_window_synthesizes_pointer_cancel() {
    let mut harness = Harness::new();
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100)).build();
    let b = WindowBuilder::new("b", rect(100, 0, 200, 100)).build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    harness
        .dispatcher
        .notify_motion(motion_args(1, MotionAction::Down, 1, &[(0, 10.0, 10.0)]));
    harness.pump();
    assert_eq!(motion_actions(&a.drain()), vec![MotionAction::Down]);

    // a disappears from the window set mid-gesture.
    harness.set_windows(&[&b]);

    assert_eq!(motion_actions(&a.drain()), vec![MotionAction::Cancel]);
}

#[test]
fn focus_change_synthesizes_key_cancel_on_old_focus() {
    let mut harness = Harness::new();
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100)).focused().build();
    let b = WindowBuilder::new("b", rect(100, 0, 200, 100)).build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    harness.drain_and_finish(&a);

    // Focus moves to b.
    b.handle.set_info({
        let mut info = (*b.handle.info().unwrap()).clone();
        info.has_focus = true;
        info
    });
    a.handle.set_info({
        let mut info = (*a.handle.info().unwrap()).clone();
        info.has_focus = false;
        info
    });
    harness.set_windows(&[&a, &b]);

    let events = a.drain();
    assert_eq!(events.len(), 1);
    let canceled = expect_key(&events[0]);
    assert_eq!(canceled.action, KeyAction::Up);
    assert!(canceled.flags.contains(KeyFlags::CANCELED));
}

#[test]
fn injection_permission_denied_preserves_touch_state() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).owner_uid(1000).build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    let injection = harness
        .dispatcher
        .inject(
            InputEvent::Motion {
                args: motion_args(1, MotionAction::Down, 1, &[(0, 10.0, 10.0)]),
                history: Vec::new(),
            },
            5,
            42,
            InjectionSyncMode::WaitForResult,
            PolicyFlags::empty(),
        )
        .expect("injection accepted");
    harness.pump();

    assert_eq!(injection.result(), InjectionResult::PermissionDenied);
    assert!(window.drain().is_empty());

    // A matching owner uid is allowed without blanket permission.
    let matching = WindowBuilder::new("mine", rect(0, 0, 100, 100)).owner_uid(42).build();
    harness.register(&matching);
    harness.set_windows(&[&matching]);
    let injection = harness
        .dispatcher
        .inject(
            InputEvent::Motion {
                args: motion_args(2, MotionAction::Down, 2, &[(0, 10.0, 10.0)]),
                history: Vec::new(),
            },
            5,
            42,
            InjectionSyncMode::WaitForResult,
            PolicyFlags::empty(),
        )
        .expect("injection accepted");
    harness.pump();
    assert_eq!(injection.result(), InjectionResult::Succeeded);
    assert_eq!(motion_actions(&matching.drain()), vec![MotionAction::Down]);
}

#[test]
fn unhandled_key_redispatches_policy_fallback() {
    let policy = TestPolicy::new();
    policy.state.borrow_mut().fallback_key = Some(62);
    let mut harness = Harness::with_policy(policy);
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();

    let events = window.drain();
    assert_eq!(events.len(), 1);
    let original = expect_key(&events[0]);
    assert_eq!(original.key_code, 30);

    // The application does not handle it: the policy supplies a fallback
    // and the same entry is redispatched rewritten.
    harness.finish(&window, original.seq, false);

    let events = window.drain();
    assert_eq!(events.len(), 1);
    let fallback = expect_key(&events[0]);
    assert_eq!(fallback.key_code, 62);
    assert!(fallback.flags.contains(KeyFlags::FALLBACK));

    // The fallback delivery itself does not recurse into the policy.
    let calls_before = harness.policy.state.borrow().unhandled_key_calls.len();
    harness.finish(&window, fallback.seq, false);
    assert_eq!(
        harness.policy.state.borrow().unhandled_key_calls.len(),
        calls_before
    );
}

#[test]
fn transfer_touch_focus_moves_gesture_and_cancels_source() {
    let mut harness = Harness::new();
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100)).build();
    let b = WindowBuilder::new("b", rect(0, 0, 100, 100)).build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    harness
        .dispatcher
        .notify_motion(motion_args(1, MotionAction::Down, 1, &[(0, 10.0, 10.0)]));
    harness.pump();
    assert_eq!(motion_actions(&a.drain()), vec![MotionAction::Down]);

    assert!(harness
        .dispatcher
        .transfer_touch_focus(&a.channel, &b.channel));
    harness.pump();

    assert_eq!(motion_actions(&a.drain()), vec![MotionAction::Cancel]);

    // The rest of the gesture goes to b; its first delivery closes
    // consistently because the pointer state moved over.
    harness
        .dispatcher
        .notify_motion(motion_args(2, MotionAction::Up, 1, &[(0, 12.0, 10.0)]));
    harness.pump();
    assert_eq!(motion_actions(&b.drain()), vec![MotionAction::Up]);
}

#[test]
fn full_pipe_with_empty_wait_queue_breaks_connection() {
    let mut harness = Harness::new();
    // Too small for even one key frame.
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100))
        .focused()
        .channel_capacity(16)
        .build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();

    assert_eq!(harness.policy.state.borrow().broken_channels, 1);

    // The broken connection no longer receives anything.
    harness.dispatcher.notify_key(key_args(2, KeyAction::Up, 30));
    harness.pump();
    assert!(window.drain().is_empty());
}

#[test]
fn touch_on_other_application_prunes_blocked_events() {
    let mut harness = Harness::new();
    let app_a = ApplicationHandle::new("app-a", 0);
    let app_b = ApplicationHandle::new("app-b", 0);
    let a = WindowBuilder::new("a", rect(0, 0, 100, 100))
        .focused()
        .application(&app_a)
        .dispatching_timeout(5_000 * MS)
        .build();
    let b = WindowBuilder::new("b", rect(100, 0, 200, 100))
        .application(&app_b)
        .build();
    harness.register(&a);
    harness.register(&b);
    harness.set_windows(&[&a, &b]);

    // Delivered, never acknowledged.
    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness.pump();
    assert_eq!(a.drain().len(), 1);

    // Parks waiting on app-a.
    harness.dispatcher.notify_key(key_args(2, KeyAction::Down, 31));
    harness.pump();

    // The user gives up and touches app-b instead.
    harness
        .dispatcher
        .notify_motion(motion_args(3, MotionAction::Down, 3, &[(0, 150.0, 50.0)]));
    harness.pump();

    // The blocked key was dropped (with a synthesized cancel for the held
    // key) and the touch went straight to b.
    assert_eq!(motion_actions(&b.drain()), vec![MotionAction::Down]);
    let a_events = a.drain();
    assert_eq!(a_events.len(), 1);
    assert!(expect_key(&a_events[0]).flags.contains(KeyFlags::CANCELED));
}

#[test]
fn configuration_change_reaches_policy_and_resets_repeat() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(0, KeyAction::Down, 30));
    harness.pump();
    harness.drain_and_finish(&window);

    harness.dispatcher.notify_configuration_changed(10 * MS);
    harness.pump();
    assert_eq!(harness.policy.state.borrow().config_changes, 1);

    // Repeat state was discarded along the way.
    harness.advance(1_000 * MS);
    assert!(window.drain().is_empty());
}

#[test]
fn disabling_dispatch_drops_and_cancels_everything() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.dispatcher.notify_key(key_args(1, KeyAction::Down, 30));
    harness
        .dispatcher
        .notify_motion(motion_args(2, MotionAction::Down, 2, &[(0, 10.0, 10.0)]));
    harness.pump();
    harness.drain_and_finish(&window);

    harness.dispatcher.set_input_dispatch_mode(false, false);
    harness.pump();

    let events = window.drain();
    let key_cancels = events
        .iter()
        .filter(|e| matches!(e, WireEvent::Key(k) if k.flags.contains(KeyFlags::CANCELED)))
        .count();
    let motion_cancels = events
        .iter()
        .filter(|e| matches!(e, WireEvent::Motion(m) if m.action == MotionAction::Cancel))
        .count();
    assert_eq!(key_cancels, 1);
    assert_eq!(motion_cancels, 1);

    // New events are dropped while disabled.
    harness.dispatcher.notify_key(key_args(3, KeyAction::Down, 31));
    harness.pump();
    assert!(window.drain().is_empty());
}

#[test]
fn stale_events_are_dropped() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    harness.clock.advance(20_000 * MS);
    // Event time far in the past relative to the clock.
    harness.dispatcher.notify_key(key_args(1, KeyAction::Up, 30));
    harness.pump();
    assert!(window.drain().is_empty());
}

#[test]
fn dump_reports_windows_and_connections() {
    let mut harness = Harness::new();
    let window = WindowBuilder::new("main-window", rect(0, 0, 100, 100))
        .focused()
        .build();
    harness.register(&window);
    harness.set_windows(&[&window]);

    let dump = harness.dispatcher.dump();
    assert!(dump.contains("main-window"));
    assert!(dump.contains("DispatchEnabled: true"));
    assert!(dump.contains("Connections:"));
}
