use env_logger::Env;
use input_dispatch::{
    config::{Config, ConfigError},
    dispatcher::Clock,
    policy::{DispatchPolicy, DispatcherConfig},
    service::DispatchService,
};
use std::{process, rc::Rc};
use thiserror::Error;
use tokio::task::LocalSet;

shadow_rs::shadow!(build);

#[derive(Debug, Error)]
enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn main() {
    let env = Env::default().filter_or("INPUT_DISPATCH_LOG_LEVEL", "info");
    env_logger::init_from_env(env);

    if let Err(e) = run() {
        log::error!("{e}");
        process::exit(1);
    }
}

fn run() -> Result<(), ServiceError> {
    let config = Config::new()?;
    log::debug!("{config:?}");
    log::info!("input-dispatch {} ({})", build::PKG_VERSION, build::BUILD_TIME);

    // single threaded tokio runtime; the dispatcher is one cooperative loop
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;

    runtime.block_on(LocalSet::new().run_until(async {
        let policy: Rc<dyn DispatchPolicy> = Rc::new(SystemPolicy::new(&config));
        let (mut service, handle) = DispatchService::new(policy, Clock::monotonic());

        // dispatch starts disabled until the window manager is ready; this
        // standalone daemon has no such gate, so enable immediately
        handle.set_input_dispatch_mode(true, false);

        service.run().await;
    }));
    Ok(())
}

/// Minimal standalone policy: passes everything to the user, repeats keys
/// per the configuration, and reports events of interest to the log. A real
/// window manager supplies its own implementation through the library API.
struct SystemPolicy {
    config: Config,
}

impl SystemPolicy {
    fn new(config: &Config) -> Self {
        SystemPolicy {
            config: config.clone(),
        }
    }
}

impl DispatchPolicy for SystemPolicy {
    fn notify_configuration_changed(&self, when: dispatch_event::Nanos) {
        log::info!("configuration changed at {when}");
    }

    fn notify_anr(
        &self,
        application: Option<&Rc<input_dispatch::dispatcher::window::ApplicationHandle>>,
        window: Option<&Rc<input_dispatch::dispatcher::window::WindowHandle>>,
    ) -> i64 {
        let name = window
            .map(|w| w.name().to_string())
            .or_else(|| application.map(|a| a.name().to_string()))
            .unwrap_or_else(|| "<unknown>".to_string());
        log::warn!("application not responding: {name}");
        0
    }

    fn notify_input_channel_broken(
        &self,
        window: Option<Rc<input_dispatch::dispatcher::window::WindowHandle>>,
    ) {
        log::warn!(
            "input channel broken for window '{}'",
            window.as_ref().map_or("<unknown>", |w| w.name())
        );
    }

    fn get_dispatcher_configuration(&self) -> DispatcherConfig {
        DispatcherConfig {
            key_repeat_timeout: self.config.key_repeat_timeout.as_nanos() as u64,
            key_repeat_delay: self.config.key_repeat_delay.as_nanos() as u64,
            max_events_per_second: self.config.max_events_per_second,
        }
    }

    fn is_key_repeat_enabled(&self) -> bool {
        self.config.key_repeat_enabled
    }

    fn intercept_key_before_queueing(
        &self,
        _event: &dispatch_event::KeyEventArgs,
        policy_flags: &mut dispatch_event::PolicyFlags,
    ) {
        *policy_flags |= dispatch_event::PolicyFlags::PASS_TO_USER;
    }

    fn intercept_motion_before_queueing(
        &self,
        _event_time: dispatch_event::Nanos,
        policy_flags: &mut dispatch_event::PolicyFlags,
    ) {
        *policy_flags |= dispatch_event::PolicyFlags::PASS_TO_USER;
    }
}
