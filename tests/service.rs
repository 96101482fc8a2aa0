//! Async shell tests: the service loop, synchronous injection, and the
//! monitor handshake, with a live consumer task acknowledging deliveries.

mod common;

use common::*;
use dispatch_event::{InputEvent, KeyAction, PolicyFlags};
use dispatch_proto::TransportError;
use input_dispatch::dispatcher::entry::{InjectionResult, InjectionSyncMode};
use input_dispatch::dispatcher::Clock;
use input_dispatch::service::DispatchService;
use std::time::Duration;
use tokio::task::{spawn_local, LocalSet};

#[tokio::test]
async fn injection_waits_for_finish_with_live_consumer() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let policy = TestPolicy::new();
            let (mut service, handle) = DispatchService::new(policy, Clock::monotonic());
            let service_task = spawn_local(async move {
                service.run().await;
            });

            handle.set_input_dispatch_mode(true, false);

            let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
            handle
                .register_input_channel(window.channel.clone(), Some(window.handle.clone()), false)
                .await
                .expect("register window channel");
            handle.set_input_windows(vec![window.handle.clone()]);

            // A consumer that acknowledges everything promptly.
            let consumer = window.consumer;
            let consumer_task = spawn_local(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    loop {
                        match consumer.receive_event() {
                            Ok(event) => {
                                let _ = consumer.send_finished_signal(event.seq(), true);
                            }
                            Err(TransportError::WouldBlock) => break,
                            Err(_) => return,
                        }
                    }
                }
            });

            let result = handle
                .inject_input_event(
                    InputEvent::Key(key_args(1, KeyAction::Down, 30)),
                    1,
                    0,
                    InjectionSyncMode::WaitForFinished,
                    Duration::from_secs(5),
                    PolicyFlags::empty(),
                )
                .await;
            assert_eq!(result, InjectionResult::Succeeded);

            let dump = handle.dump().await;
            assert!(dump.contains("w"));

            // The loop keeps iterating.
            handle.monitor().await;

            handle.shutdown();
            let _ = service_task.await;
            consumer_task.abort();
        })
        .await;
}

#[tokio::test]
async fn injection_times_out_without_acks() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let policy = TestPolicy::new();
            let (mut service, handle) = DispatchService::new(policy, Clock::monotonic());
            let service_task = spawn_local(async move {
                service.run().await;
            });

            handle.set_input_dispatch_mode(true, false);

            let window = WindowBuilder::new("w", rect(0, 0, 100, 100)).focused().build();
            handle
                .register_input_channel(window.channel.clone(), Some(window.handle.clone()), false)
                .await
                .expect("register window channel");
            handle.set_input_windows(vec![window.handle.clone()]);

            // Delivery succeeds but nobody ever finishes it.
            let result = handle
                .inject_input_event(
                    InputEvent::Key(key_args(1, KeyAction::Down, 30)),
                    1,
                    0,
                    InjectionSyncMode::WaitForFinished,
                    Duration::from_millis(50),
                    PolicyFlags::empty(),
                )
                .await;
            assert_eq!(result, InjectionResult::TimedOut);

            handle.shutdown();
            let _ = service_task.await;
        })
        .await;
}
