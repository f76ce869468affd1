//! The public entry point tying the writer, the pollers and the drain
//! coordinator together.

use std::future::Future;
use std::sync::{
    Arc, OnceLock, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    central_config::CentralConfigPoller,
    config::{Config, ConfigError},
    drain::{DrainCoordinator, DrainError, InFlightId},
    event_bus::{EventBus, EventSender, TransportEvent},
    http,
    intake::{
        EventKind, RequestError, encoder,
        writer::{IntakeHandle, IntakeService},
    },
    metadata::{
        MetadataManager,
        cloud::{self, CloudMetadataFetcher},
        system::SystemInfo,
    },
    server_info::{self, ServerVersion, ServerVersionError},
};

/// Set while a transport is running. A second transport is allowed but both
/// would report the same process, so it is worth a warning.
static ACTIVE_INSTANCE: AtomicBool = AtomicBool::new(false);

/// Whether a transport was created and has not been ended or destroyed.
#[must_use]
pub fn is_active() -> bool {
    ACTIVE_INSTANCE.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// Marks the last flush of a Lambda invocation.
    pub lambda_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlushError {
    /// The writer was flushed, but some in-flight events did not make it.
    #[error(transparent)]
    Drain(#[from] DrainError),
}

pub struct Transport {
    config: RwLock<Arc<Config>>,
    intake: IntakeHandle,
    drain: DrainCoordinator,
    server_version: Arc<OnceLock<ServerVersion>>,
    cancel: CancellationToken,
}

impl Transport {
    /// Validates `config`, starts the writer and the background tasks and
    /// returns the transport along with the bus its events are reported on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<(Transport, EventBus), ConfigError> {
        config.validate()?;
        if ACTIVE_INSTANCE.swap(true, Ordering::SeqCst) {
            warn!("TRANSPORT | Another transport is already active in this process");
        }

        let client = http::get_client(&config);
        let (bus, events) = EventBus::run();
        let cancel = CancellationToken::new();

        let metadata = MetadataManager::new(&config, SystemInfo::detect());
        let (service, intake) =
            IntakeService::new(config.clone(), client.clone(), metadata, events.clone());
        tokio::spawn(service.run());

        let server_version = Arc::new(OnceLock::new());
        match config.apm_server_version.as_deref() {
            Some(configured) => match configured.parse::<ServerVersion>() {
                Ok(version) => {
                    let _ = server_version.set(version);
                    intake.set_activation_method_supported(
                        server_info::supports_activation_method_field(Some(version)),
                    );
                }
                Err(e) => warn!("TRANSPORT | Ignoring apm_server_version: {e}"),
            },
            None => {
                tokio::spawn(probe_server_version(
                    client.clone(),
                    config.clone(),
                    intake.clone(),
                    events.clone(),
                    Arc::clone(&server_version),
                    cancel.child_token(),
                ));
            }
        }

        if config.central_config_enabled() {
            let poller = CentralConfigPoller::new(client.clone(), config.clone(), events.clone());
            tokio::spawn(poller.run(cancel.child_token()));
        }

        if let Some(fetcher) = cloud::fetcher_for(config.effective_cloud_provider()) {
            tokio::spawn(fetch_cloud_metadata(
                fetcher,
                intake.clone(),
                cancel.child_token(),
            ));
        }

        debug!(
            "TRANSPORT | Started, sending to {} as {}",
            config.server_url,
            config.user_agent()
        );
        let transport = Transport {
            config: RwLock::new(Arc::new(config)),
            intake,
            drain: DrainCoordinator::new(),
            server_version,
            cancel,
        };
        Ok((transport, bus))
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Queues a record for upload. Never blocks.
    pub fn send<T: Serialize + ?Sized>(&self, kind: EventKind, record: &T) {
        self.intake.send(kind, encoder::to_record(record));
    }

    /// Like [`Transport::send`], resolving once the writer buffered the record.
    pub async fn send_accepted<T: Serialize + ?Sized>(&self, kind: EventKind, record: &T) {
        self.intake
            .send_accepted(kind, encoder::to_record(record))
            .await;
    }

    pub fn send_transaction<T: Serialize + ?Sized>(&self, transaction: &T) {
        self.send(EventKind::Transaction, transaction);
    }

    pub fn send_span<T: Serialize + ?Sized>(&self, span: &T) {
        self.send(EventKind::Span, span);
    }

    pub fn send_error<T: Serialize + ?Sized>(&self, error: &T) {
        self.send(EventKind::Error, error);
    }

    pub fn send_metricset<T: Serialize + ?Sized>(&self, metricset: &T) {
        self.send(EventKind::Metricset, metricset);
    }

    /// Registers async work that will end in a `send`, so that a flush
    /// started meanwhile waits for it.
    pub fn register_in_flight(&self) -> InFlightId {
        self.drain.register_in_flight()
    }

    pub fn resolve_in_flight(&self, id: InFlightId) {
        self.drain.resolve_in_flight(id);
    }

    fn flush_future(
        &self,
        options: FlushOptions,
    ) -> impl Future<Output = Result<(), FlushError>> + Send + 'static {
        let snapshot = self.drain.take_snapshot();
        let inflight_timeout = self.config().inflight_timeout();
        let intake = self.intake.clone();
        async move {
            let drained = snapshot.on_next_drain(Some(inflight_timeout)).await;
            if let Err(e) = &drained {
                warn!("TRANSPORT | {e}, flushing anyway");
            }
            intake.flush(options.lambda_end).await;
            drained.map_err(FlushError::from)
        }
    }

    /// Waits for the in-flight events registered before the call, then for
    /// the upload of everything buffered.
    ///
    /// The writer is flushed even when waiting for in-flight events timed
    /// out, the timeout is reported afterwards.
    ///
    /// Uploads need the metadata record: when extra metadata is expected
    /// (always the case on AWS Lambda), the flush only resolves after
    /// [`Transport::set_extra_metadata`] was called. On Lambda, records
    /// buffered between invocations are held until the next
    /// [`Transport::lambda_start`]. Wrap the call in a timeout when neither
    /// is guaranteed to happen.
    pub async fn flush(&self, options: FlushOptions) -> Result<(), FlushError> {
        self.flush_future(options).await
    }

    /// Callback flavour of [`Transport::flush`].
    pub fn flush_with<F>(&self, options: FlushOptions, callback: F)
    where
        F: FnOnce(Result<(), FlushError>) + Send + 'static,
    {
        let flushing = self.flush_future(options);
        tokio::spawn(async move {
            callback(flushing.await);
        });
    }

    /// Merges platform metadata into the metadata record and, when uploads
    /// were waiting for it, lets them start.
    pub fn set_extra_metadata(&self, extra: Value) {
        self.intake.set_extra_metadata(extra);
    }

    /// Applies a new configuration to the running transport.
    ///
    /// Background tasks already started keep the configuration they were
    /// started with.
    pub fn update_config(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.intake.update_config(config.clone());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        Ok(())
    }

    /// The metadata record as it would be sent now.
    pub async fn metadata(&self) -> Option<Value> {
        self.intake.metadata().await
    }

    pub fn lambda_start(&self) {
        self.intake.lambda_start();
    }

    #[must_use]
    pub fn lambda_should_register_transactions(&self) -> bool {
        self.intake.lambda_should_register_transactions()
    }

    pub async fn lambda_register_transaction<T: Serialize + ?Sized>(
        &self,
        transaction: &T,
        aws_request_id: impl Into<String>,
    ) {
        self.intake
            .lambda_register_transaction(encoder::to_record(transaction), aws_request_id.into())
            .await;
    }

    #[must_use]
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.server_version.get().copied()
    }

    #[must_use]
    pub fn supports_keeping_unsampled_transaction(&self) -> bool {
        server_info::supports_keeping_unsampled_transaction(self.server_version())
    }

    #[must_use]
    pub fn supports_activation_method_field(&self) -> bool {
        server_info::supports_activation_method_field(self.server_version())
    }

    /// Records delivered by successful uploads so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.intake.sent()
    }

    /// Uploads what is buffered, with the shorter end-of-life timeout, and
    /// stops every background task.
    pub async fn end(&self) {
        self.cancel.cancel();
        self.intake.end().await;
        ACTIVE_INSTANCE.store(false, Ordering::SeqCst);
    }

    /// Stops immediately, discarding buffered records and the upload in
    /// flight. Pending flushes resolve.
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.intake.destroy();
        ACTIVE_INSTANCE.store(false, Ordering::SeqCst);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn probe_server_version(
    client: reqwest::Client,
    config: Config,
    intake: IntakeHandle,
    events: EventSender,
    server_version: Arc<OnceLock<ServerVersion>>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        () = cancel.cancelled() => return,
        result = server_info::fetch_server_version(&client, &config) => result,
    };
    match result {
        Ok(version) => {
            let _ = server_version.set(version);
            intake.set_activation_method_supported(server_info::supports_activation_method_field(
                Some(version),
            ));
            events.emit(TransportEvent::ServerVersion(version));
        }
        Err(e) => {
            debug!("TRANSPORT | Unable to fetch APM Server version: {e}");
            let code = match e {
                ServerVersionError::UnexpectedStatus(status) => Some(status),
                _ => None,
            };
            events.request_error(RequestError {
                code,
                ..RequestError::new(format!("error fetching APM Server version: {e}"))
            });
        }
    }
}

async fn fetch_cloud_metadata(
    fetcher: Box<dyn CloudMetadataFetcher>,
    intake: IntakeHandle,
    cancel: CancellationToken,
) {
    let provider = fetcher.provider();
    let result = tokio::select! {
        () = cancel.cancelled() => return,
        result = fetcher.fetch() => result,
    };
    match result {
        Ok(cloud) => intake.set_cloud_metadata(cloud),
        Err(e) => debug!("CLOUD_METADATA | Unable to fetch {provider} metadata: {e}"),
    }
}
