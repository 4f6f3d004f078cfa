//! Orchestrates the error classifier, device view, path arbiter, and stale reaper around a
//! [`GattClient`]'s connect call. The slot manager is a sibling concern, not wired in here; see
//! the doc comment on [`establish_connection`].
//!
//! Grounded on `establish_connection` in `bleak_retry_connector/__init__.py`; state machine
//! names (`AttemptStart`/`PreConnect`/`Connect`/`OnError`) are spec.md §4.F's, not the source's
//! (the source is one long `while True` loop with inline `try/except`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::classify::{self, classify, ErrorClass};
use crate::client::{ClientFactory, DisconnectedCallback, GattClient};
use crate::config::RetryConfig;
use crate::device::BleDevice;
use crate::error::{terminal_error, ConnectError, TransportError};
use crate::reaper::StaleReaper;
use crate::view::DeviceView;
use crate::arbiter::Arbiter;

/// Per-attempt-sequence counters driving the terminal-condition check.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    pub timeouts: u32,
    pub connect_errors: u32,
    pub transient_errors: u32,
    pub attempt: u32,
}

impl Counters {
    fn is_terminal(&self, config: &RetryConfig) -> bool {
        self.timeouts + self.connect_errors >= config.max_attempts
            || self.transient_errors >= config.max_transient_errors
    }
}

/// Per-call options, all optional, mirroring `establish_connection`'s keyword arguments.
#[derive(Default)]
pub struct ConnectOptions {
    pub disconnected_callback: Option<DisconnectedCallback>,
    /// Overrides [`RetryConfig::max_attempts`] for this call only.
    pub max_attempts: Option<u32>,
    /// Object paths of a previously cached services collection; see spec.md §4.F.1.
    pub cached_services: Option<Vec<String>>,
    pub use_services_cache: bool,
    /// Opaque producer for a fresh device between attempts.
    pub ble_device_callback: Option<Box<dyn Fn() -> BleDevice + Send + Sync>>,
}

/// The collaborators `establish_connection` orchestrates. Constructed once per host/session and
/// shared across calls.
pub struct RetryEngine {
    pub view: Option<Arc<dyn DeviceView>>,
    pub arbiter: Option<Arc<Arbiter>>,
    pub reaper: Option<Arc<StaleReaper>>,
    pub config: RetryConfig,
}

/// Establish a connection, retrying through the classifier/arbiter/reaper pipeline until success
/// or a terminal condition. `cancel` resolves when the caller wants to give up; every suspension
/// point in the loop races against it.
///
/// The slot manager ([`crate::slots::SlotManager`]) is deliberately not wired in here: spec.md
/// §4.F's state machine never calls `allocate_slot`/`release_slot`, matching the upstream
/// connector where slot accounting is a sibling concern the caller drives independently (e.g.
/// before deciding whether to attempt a connection at all), not a step inside the attempt loop.
pub async fn establish_connection(
    engine: &RetryEngine,
    client_factory: ClientFactory,
    initial_device: BleDevice,
    logical_name: &str,
    options: ConnectOptions,
    cancel: impl Future<Output = ()> + Send,
) -> Result<Box<dyn GattClient>, ConnectError> {
    let max_attempts = options.max_attempts.unwrap_or(engine.config.max_attempts);
    let mut config = engine.config.clone();
    config.max_attempts = max_attempts;

    tokio::pin!(cancel);

    let run = run_attempt_loop(engine, client_factory, initial_device, logical_name, options, &config);
    tokio::pin!(run);

    tokio::select! {
        biased;
        _ = &mut cancel => Err(ConnectError::Cancelled),
        result = &mut run => result,
    }
}

async fn run_attempt_loop(
    engine: &RetryEngine,
    client_factory: ClientFactory,
    initial_device: BleDevice,
    logical_name: &str,
    options: ConnectOptions,
    config: &RetryConfig,
) -> Result<Box<dyn GattClient>, ConnectError> {
    let mut counters = Counters::default();
    let mut device = initial_device;
    let mut create_client = true;
    let mut client: Option<Box<dyn GattClient>> = None;

    loop {
        counters.attempt += 1;
        let original_device = device.clone();

        if let Some(callback) = &options.ble_device_callback {
            device = callback();
        }

        if let Some(arbiter) = &engine.arbiter {
            if let Some(fresh) = arbiter.freshen(&device).await {
                device = fresh;
                create_client = true;
            }
        }

        if !create_client && device.has_changed_from(&original_device) {
            create_client = true;
        }

        if create_client {
            if let Some(old_client) = client.take() {
                drop(old_client);
            }
            client = Some(client_factory(&device, options.disconnected_callback.clone()));
            create_client = false;
        }

        if let Some(reaper) = &engine.reaper {
            reaper.close_stale_connections(&device, true).await;
        }

        let use_cache = should_use_cache(engine, &options, &device).await;

        let client_ref = client.as_mut().expect("client constructed above");
        let connect_result =
            tokio::time::timeout(config.bleak_safety_timeout, client_ref.connect(config.bleak_timeout, use_cache))
                .await;

        let transport_error = match connect_result {
            Ok(Ok(())) => return Ok(client.take().expect("client constructed above")),
            Ok(Err(err)) => err,
            Err(_) => TransportError::Timeout,
        };

        let (class, backoff_class) = classify(&transport_error);
        bump_counters(&mut counters, &transport_error, class);

        if class == ErrorClass::DeviceMissing {
            // A stale lookup against a path/handle the platform no longer has (the Rust analogue
            // of the source's KeyError-class services-changed signal) - drop whatever the client
            // cached about this device's GATT services before the next attempt.
            let client_ref = client.as_mut().expect("client constructed above");
            let _ = client_ref.disconnect().await;
            let _ = client_ref.clear_cache().await;
        }

        if let Some(view) = &engine.view {
            crate::wait::wait_for_disconnect(view.as_ref(), &device, backoff_class.duration()).await;
        } else {
            tokio::time::sleep(backoff_class.duration()).await;
        }

        if counters.is_terminal(config) {
            return Err(terminal_error(class, &device, logical_name, counters.attempt, transport_error));
        }

        // Give the disconnect callback a chance to run before the next attempt.
        tokio::task::yield_now().await;
    }
}

fn bump_counters(counters: &mut Counters, err: &TransportError, class: ErrorClass) {
    match err {
        TransportError::Timeout => counters.timeouts += 1,
        TransportError::BrokenPipe(_) | TransportError::Eof(_) | TransportError::DeviceNotFound(_) => {
            counters.transient_errors += 1
        }
        _ if classify::counts_as_transient(class) => counters.transient_errors += 1,
        _ => counters.connect_errors += 1,
    }
}

/// Whether the cache hint should be enabled for this attempt (spec.md §4.F.1). If the bus is
/// unavailable, we accept the hint rather than reject it (we can't prove staleness either way).
async fn should_use_cache(engine: &RetryEngine, options: &ConnectOptions, device: &BleDevice) -> bool {
    if options.use_services_cache {
        return true;
    }
    let Some(cached) = &options.cached_services else {
        return false;
    };
    if cached.is_empty() {
        return true;
    }
    let (Some(view), Some(path)) = (&engine.view, device.path()) else {
        return true;
    };
    let Ok(properties) = view.get_properties().await else {
        return true;
    };
    let Some(ifaces) = properties.get(path) else {
        return true;
    };
    cached.iter().all(|service_path| ifaces.contains_key(service_path) || properties.contains_key(service_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDetails, NO_RSSI};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedClient {
        script: Arc<StdMutex<Vec<Result<(), TransportError>>>>,
        connects: Arc<AtomicU32>,
        disconnects: Arc<AtomicU32>,
        clear_caches: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl GattClient for ScriptedClient {
        async fn connect(&mut self, _timeout: Duration, _use_cached_services: bool) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn clear_cache(&mut self) -> Result<(), TransportError> {
            self.clear_caches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device() -> BleDevice {
        BleDevice {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            name: None,
            details: DeviceDetails::Unknown,
            rssi: NO_RSSI,
            services: vec![],
            manufacturer_data: Default::default(),
        }
    }

    fn engine() -> RetryEngine {
        RetryEngine {
            view: None,
            arbiter: None,
            reaper: None,
            config: RetryConfig {
                bleak_timeout: Duration::from_millis(50),
                bleak_safety_timeout: Duration::from_millis(200),
                ..RetryConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn happy_path_returns_client_with_no_backoff() {
        let connects = Arc::new(AtomicU32::new(0));
        let connects_for_factory = connects.clone();
        let factory: ClientFactory = Arc::new(move |_device, _callback| {
            Box::new(ScriptedClient {
                script: Arc::new(StdMutex::new(vec![])),
                connects: connects_for_factory.clone(),
                ..Default::default()
            })
        });

        let start = std::time::Instant::now();
        let result = establish_connection(
            &engine(),
            factory,
            device(),
            "AA:BB:CC:DD:EE:FF",
            ConnectOptions::default(),
            std::future::pending(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn timeout_terminal_after_max_attempts() {
        let factory: ClientFactory = Arc::new(move |_device, _callback| {
            Box::new(ScriptedClient {
                script: Arc::new(StdMutex::new(vec![
                    Err(TransportError::Timeout),
                    Err(TransportError::Timeout),
                    Err(TransportError::Timeout),
                    Err(TransportError::Timeout),
                ])),
                ..Default::default()
            })
        });

        let mut eng = engine();
        eng.config.max_attempts = 4;

        let result = establish_connection(
            &eng,
            factory,
            device(),
            "AA:BB:CC:DD:EE:FF",
            ConnectOptions::default(),
            std::future::pending(),
        )
        .await;

        match result {
            Err(ConnectError::NotFound(message, _)) => {
                assert!(message.contains("after 4 attempt(s)"));
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_loop() {
        let factory: ClientFactory = Arc::new(move |_device, _callback| {
            Box::new(ScriptedClient {
                script: Arc::new(StdMutex::new(vec![Err(TransportError::Timeout); 100])),
                ..Default::default()
            })
        });

        let result = establish_connection(
            &engine(),
            factory,
            device(),
            "AA:BB:CC:DD:EE:FF",
            ConnectOptions::default(),
            async {},
        )
        .await;

        assert!(matches!(result, Err(ConnectError::Cancelled)));
    }

    #[tokio::test]
    async fn device_missing_error_triggers_disconnect_and_clear_cache() {
        let disconnects = Arc::new(AtomicU32::new(0));
        let clear_caches = Arc::new(AtomicU32::new(0));
        let disconnects_for_factory = disconnects.clone();
        let clear_caches_for_factory = clear_caches.clone();
        let factory: ClientFactory = Arc::new(move |_device, _callback| {
            Box::new(ScriptedClient {
                script: Arc::new(StdMutex::new(vec![Err(TransportError::Other(
                    "org.freedesktop.DBus.Error.UnknownObject: no such object".to_string(),
                ))])),
                disconnects: disconnects_for_factory.clone(),
                clear_caches: clear_caches_for_factory.clone(),
                ..Default::default()
            })
        });

        let result = establish_connection(
            &engine(),
            factory,
            device(),
            "AA:BB:CC:DD:EE:FF",
            ConnectOptions::default(),
            std::future::pending(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(clear_caches.load(Ordering::SeqCst), 1);
    }
}
