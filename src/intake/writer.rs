//! The batching writer.
//!
//! A single [`IntakeService`] task owns the buffer of encoded records. It stays
//! corked until `buffer_window_size` records are buffered, `buffer_window_time`
//! elapsed since the first one or somebody flushes, then ships the buffer as
//! one gzip ndjson request with the metadata line first. Only one upload is in
//! flight at a time; records arriving meanwhile start a new buffer.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
    time::{Instant, sleep_until},
};
use tracing::{debug, error, warn};

use crate::{
    config::Config,
    event_bus::{EventSender, TransportEvent},
    http::base_headers,
    intake::{
        EventKind, RequestError, encoder,
        truncate::TruncationLimits,
        upload::{self, INTAKE_PATH, REGISTER_TRANSACTION_PATH, RegisterOutcome},
    },
    metadata::MetadataManager,
};

#[derive(Debug)]
pub enum IntakeCommand {
    Send {
        kind: EventKind,
        record: Value,
        accepted: Option<oneshot::Sender<()>>,
    },
    Flush {
        lambda_end: bool,
        done: oneshot::Sender<()>,
    },
    SetExtraMetadata(Value),
    CloudMetadata(Value),
    ActivationMethodSupported(bool),
    UpdateConfig(Box<Config>),
    LambdaStart,
    RegisterTransaction {
        transaction: Value,
        aws_request_id: String,
        done: oneshot::Sender<()>,
    },
    Metadata(oneshot::Sender<Value>),
    End(oneshot::Sender<()>),
    Destroy,
}

/// Cloneable handle to a running [`IntakeService`]. Every method is a no-op
/// once the service stopped.
#[derive(Clone, Debug)]
pub struct IntakeHandle {
    tx: mpsc::UnboundedSender<IntakeCommand>,
    sent: Arc<AtomicU64>,
    should_register: Arc<AtomicBool>,
}

impl IntakeHandle {
    fn command(&self, command: IntakeCommand) {
        if self.tx.send(command).is_err() {
            debug!("INTAKE | Writer is stopped, ignoring command");
        }
    }

    pub fn send(&self, kind: EventKind, record: Value) {
        self.command(IntakeCommand::Send {
            kind,
            record,
            accepted: None,
        });
    }

    /// Resolves once the record is in the buffer (or was dropped).
    pub async fn send_accepted(&self, kind: EventKind, record: Value) {
        let (accepted, rx) = oneshot::channel();
        self.command(IntakeCommand::Send {
            kind,
            record,
            accepted: Some(accepted),
        });
        let _ = rx.await;
    }

    /// Resolves once every record buffered before the call has been uploaded
    /// or its upload failed.
    ///
    /// Pending while uploads wait for extra metadata or for the next Lambda
    /// invocation.
    pub async fn flush(&self, lambda_end: bool) {
        let (done, rx) = oneshot::channel();
        self.command(IntakeCommand::Flush { lambda_end, done });
        let _ = rx.await;
    }

    pub fn set_extra_metadata(&self, extra: Value) {
        self.command(IntakeCommand::SetExtraMetadata(extra));
    }

    pub fn set_cloud_metadata(&self, cloud: Value) {
        self.command(IntakeCommand::CloudMetadata(cloud));
    }

    pub fn set_activation_method_supported(&self, supported: bool) {
        self.command(IntakeCommand::ActivationMethodSupported(supported));
    }

    pub fn update_config(&self, config: Config) {
        self.command(IntakeCommand::UpdateConfig(Box::new(config)));
    }

    pub fn lambda_start(&self) {
        self.command(IntakeCommand::LambdaStart);
    }

    #[must_use]
    pub fn lambda_should_register_transactions(&self) -> bool {
        self.should_register.load(Ordering::Relaxed)
    }

    pub async fn lambda_register_transaction(&self, transaction: Value, aws_request_id: String) {
        let (done, rx) = oneshot::channel();
        self.command(IntakeCommand::RegisterTransaction {
            transaction,
            aws_request_id,
            done,
        });
        let _ = rx.await;
    }

    /// The metadata record as it would be sent now.
    pub async fn metadata(&self) -> Option<Value> {
        let (tx, rx) = oneshot::channel();
        self.command(IntakeCommand::Metadata(tx));
        rx.await.ok()
    }

    pub async fn end(&self) {
        let (done, rx) = oneshot::channel();
        self.command(IntakeCommand::End(done));
        let _ = rx.await;
    }

    pub fn destroy(&self) {
        self.command(IntakeCommand::Destroy);
    }

    /// Records delivered by successful uploads so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LambdaState {
    NotLambda,
    /// Between invocations, or before the first one.
    Inactive,
    AwaitingRegistration,
    Active,
}

struct FlushWaiter {
    /// Records ahead of this flush still sitting in the buffer.
    remaining: usize,
    done: oneshot::Sender<()>,
}

struct LambdaEnd {
    remaining: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

struct InFlightUpload {
    handle: JoinHandle<Result<(), RequestError>>,
    records: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

struct PendingRegistration {
    transaction: Value,
    aws_request_id: String,
    done: oneshot::Sender<()>,
}

struct Registration {
    handle: JoinHandle<RegisterOutcome>,
    done: oneshot::Sender<()>,
}

pub struct IntakeService {
    config: Config,
    client: reqwest::Client,
    headers: HeaderMap,
    limits: TruncationLimits,
    metadata: MetadataManager,
    events: EventSender,
    rx: mpsc::UnboundedReceiver<IntakeCommand>,

    buffer: VecDeque<Vec<u8>>,
    cork_deadline: Option<Instant>,
    uncork_requested: bool,
    flush_waiters: Vec<FlushWaiter>,
    in_flight: Option<InFlightUpload>,
    upload_timeout: Duration,

    lambda: LambdaState,
    lambda_end: Option<LambdaEnd>,
    pending_registration: Option<PendingRegistration>,
    registration: Option<Registration>,

    ending: Vec<oneshot::Sender<()>>,
    sent: Arc<AtomicU64>,
    should_register: Arc<AtomicBool>,
}

impl IntakeService {
    #[must_use]
    pub fn new(
        config: Config,
        client: reqwest::Client,
        metadata: MetadataManager,
        events: EventSender,
    ) -> (Self, IntakeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicU64::new(0));
        let should_register = Arc::new(AtomicBool::new(config.is_lambda()));
        let lambda = if config.is_lambda() {
            LambdaState::Inactive
        } else {
            LambdaState::NotLambda
        };

        let service = IntakeService {
            headers: base_headers(&config),
            limits: TruncationLimits::from_config(&config),
            upload_timeout: config.intake_response_timeout(),
            config,
            client,
            metadata,
            events,
            rx,
            buffer: VecDeque::new(),
            cork_deadline: None,
            uncork_requested: false,
            flush_waiters: Vec::new(),
            in_flight: None,
            lambda,
            lambda_end: None,
            pending_registration: None,
            registration: None,
            ending: Vec::new(),
            sent: Arc::clone(&sent),
            should_register: Arc::clone(&should_register),
        };
        let handle = IntakeHandle {
            tx,
            sent,
            should_register,
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("INTAKE | Writer started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("INTAKE | All handles dropped, stopping writer");
                        break;
                    };
                    if let IntakeCommand::Destroy = command {
                        self.destroy();
                        break;
                    }
                    self.handle_command(command);
                }
                () = cork_timer(self.cork_deadline) => {
                    self.cork_deadline = None;
                    self.uncork_requested = true;
                    self.maybe_start_upload();
                }
                result = join(self.in_flight.as_mut().map(|upload| &mut upload.handle)) => {
                    self.on_upload_complete(result);
                }
                outcome = join(self.registration.as_mut().map(|registration| &mut registration.handle)) => {
                    self.on_registration_complete(outcome);
                }
            }

            if !self.ending.is_empty() && self.in_flight.is_none() {
                self.finish();
                break;
            }
        }
    }

    fn handle_command(&mut self, command: IntakeCommand) {
        match command {
            IntakeCommand::Send {
                kind,
                record,
                accepted,
            } => {
                self.buffer_record(kind, record);
                if let Some(accepted) = accepted {
                    let _ = accepted.send(());
                }
            }
            IntakeCommand::Flush { lambda_end, done } => self.flush(lambda_end, done),
            IntakeCommand::SetExtraMetadata(extra) => {
                self.metadata.set_extra_metadata(extra);
                self.start_pending_registration();
                self.maybe_start_upload();
            }
            IntakeCommand::CloudMetadata(cloud) => {
                if self.metadata.set_cloud_metadata(cloud.clone()) {
                    self.events.emit(TransportEvent::CloudMetadata(cloud));
                }
            }
            IntakeCommand::ActivationMethodSupported(supported) => {
                self.metadata
                    .set_activation_method_supported(&self.config, supported);
            }
            IntakeCommand::UpdateConfig(config) => self.update_config(*config),
            IntakeCommand::LambdaStart => self.lambda_start(),
            IntakeCommand::RegisterTransaction {
                transaction,
                aws_request_id,
                done,
            } => self.register_transaction(transaction, aws_request_id, done),
            IntakeCommand::Metadata(tx) => {
                let _ = tx.send(self.metadata.metadata().clone());
            }
            IntakeCommand::End(done) => self.end(done),
            IntakeCommand::Destroy => self.destroy(),
        }
    }

    fn buffer_record(&mut self, kind: EventKind, record: Value) {
        if !self.ending.is_empty() {
            debug!("INTAKE | Writer is ending, ignoring {kind}");
            return;
        }
        if kind == EventKind::Metadata {
            debug!("INTAKE | Metadata is managed by the writer, ignoring sent metadata");
            return;
        }
        if self.buffer.len() >= self.config.max_queue_size
            && self.in_flight.is_some()
            && self.lambda_gate_open()
        {
            warn!(
                "INTAKE | Queue is full ({} records), dropping {kind}",
                self.buffer.len()
            );
            return;
        }

        if self.buffer.is_empty() && self.cork_deadline.is_none() {
            self.cork_deadline = self.next_cork_deadline();
        }
        self.buffer
            .push_back(encoder::encode(kind, record, &self.limits));
        if self.buffer.len() >= self.config.buffer_window_size
            || self.buffer.len() >= self.config.max_queue_size
        {
            self.uncork_requested = true;
        }
        self.maybe_start_upload();
    }

    fn flush(&mut self, lambda_end: bool, done: oneshot::Sender<()>) {
        if !self.ending.is_empty() {
            let _ = done.send(());
            return;
        }

        if lambda_end && self.lambda != LambdaState::NotLambda {
            let remaining = self.buffer.len();
            match &mut self.lambda_end {
                Some(end) => {
                    end.remaining = remaining;
                    end.waiters.push(done);
                }
                None => {
                    self.lambda_end = Some(LambdaEnd {
                        remaining,
                        waiters: vec![done],
                    });
                }
            }
        } else if self.buffer.is_empty() {
            match &mut self.in_flight {
                Some(upload) => upload.waiters.push(done),
                None => {
                    let _ = done.send(());
                }
            }
        } else {
            self.flush_waiters.push(FlushWaiter {
                remaining: self.buffer.len(),
                done,
            });
        }
        self.maybe_start_upload();
    }

    fn lambda_gate_open(&self) -> bool {
        matches!(self.lambda, LambdaState::NotLambda | LambdaState::Active)
    }

    fn maybe_start_upload(&mut self) {
        if self.in_flight.is_some() || !self.metadata.is_ready() {
            return;
        }

        let lambda_boundary = self.lambda_end.as_ref().map(|end| end.remaining);
        if lambda_boundary.is_none() {
            if self.buffer.is_empty() || !self.lambda_gate_open() {
                return;
            }
            if !self.uncork_requested && self.flush_waiters.is_empty() && self.ending.is_empty() {
                return;
            }
        }

        let max_records = lambda_boundary.unwrap_or(self.buffer.len());
        let mut payload = self.metadata.encoded().to_vec();
        let mut taken = 0;
        while taken < max_records {
            let Some(line) = self.buffer.get(taken) else {
                break;
            };
            if taken > 0 && payload.len() + line.len() > self.config.api_request_size {
                break;
            }
            payload.extend_from_slice(line);
            taken += 1;
        }
        self.buffer.drain(..taken);

        let mut waiters = Vec::new();
        let mut still_waiting = Vec::with_capacity(self.flush_waiters.len());
        for mut waiter in self.flush_waiters.drain(..) {
            if waiter.remaining <= taken {
                waiters.push(waiter.done);
            } else {
                waiter.remaining -= taken;
                still_waiting.push(waiter);
            }
        }
        self.flush_waiters = still_waiting;

        let mut flushed = false;
        if let Some(end) = &mut self.lambda_end {
            if end.remaining <= taken {
                flushed = true;
                waiters.append(&mut end.waiters);
                self.lambda_end = None;
                self.lambda = LambdaState::Inactive;
            } else {
                end.remaining -= taken;
            }
        }

        self.uncork_requested = false;
        if self.buffer.is_empty() {
            self.cork_deadline = None;
        } else if self.buffer.len() >= self.config.buffer_window_size {
            self.uncork_requested = true;
        } else if self.cork_deadline.is_none() {
            self.cork_deadline = self.next_cork_deadline();
        }

        let mut url = match self.config.endpoint(INTAKE_PATH) {
            Ok(url) => url,
            Err(e) => {
                error!("INTAKE | Dropping {taken} records: {e}");
                release(waiters);
                return;
            }
        };
        if flushed {
            upload::mark_flushed(&mut url);
        }
        let body = match encoder::compress(&payload) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                error!("INTAKE | Unable to compress payload, dropping {taken} records: {e}");
                release(waiters);
                return;
            }
        };

        debug!(
            "INTAKE | Uploading {taken} records ({} bytes uncompressed){}",
            payload.len(),
            if flushed { ", end of invocation" } else { "" }
        );
        let handle = tokio::spawn(upload::send_events(
            self.client.clone(),
            url,
            self.headers.clone(),
            body,
            self.upload_timeout,
        ));
        self.in_flight = Some(InFlightUpload {
            handle,
            records: taken,
            waiters,
        });
    }

    fn on_upload_complete(&mut self, result: Result<Result<(), RequestError>, JoinError>) {
        let Some(upload) = self.in_flight.take() else {
            return;
        };
        match result {
            Ok(Ok(())) => {
                self.sent.fetch_add(upload.records as u64, Ordering::Relaxed);
                debug!("INTAKE | Uploaded {} records", upload.records);
            }
            Ok(Err(err)) => {
                warn!(
                    "INTAKE | Dropping {} records: {} (code: {:?})",
                    upload.records, err.message, err.code
                );
                self.events.request_error(err);
                self.restart_cork();
            }
            Err(e) => {
                error!("INTAKE | Upload task failed, dropping {} records: {e}", upload.records);
                self.restart_cork();
            }
        }
        release(upload.waiters);
        self.maybe_start_upload();
    }

    // Records buffered behind a failed upload start their own cork cycle.
    fn restart_cork(&mut self) {
        if self.buffer.is_empty() || !self.ending.is_empty() {
            return;
        }
        self.uncork_requested = self.buffer.len() >= self.config.buffer_window_size;
        self.cork_deadline = self.next_cork_deadline();
    }

    // `None` when the window time is too large to be represented: the buffer
    // then only uncorks on size or flush.
    fn next_cork_deadline(&self) -> Option<Instant> {
        Instant::now().checked_add(self.config.buffer_window_time())
    }

    fn update_config(&mut self, config: Config) {
        self.headers = base_headers(&config);
        self.limits = TruncationLimits::from_config(&config);
        if self.ending.is_empty() {
            self.upload_timeout = config.intake_response_timeout();
        }
        self.metadata.rebuild(&config);
        self.config = config;
        debug!("INTAKE | Configuration updated");
        self.maybe_start_upload();
    }

    fn lambda_start(&mut self) {
        if self.lambda == LambdaState::NotLambda {
            debug!("INTAKE | Not running on AWS Lambda, ignoring invocation start");
            return;
        }
        self.lambda = if self.should_register.load(Ordering::Relaxed) {
            LambdaState::AwaitingRegistration
        } else {
            LambdaState::Active
        };
        self.maybe_start_upload();
    }

    fn register_transaction(
        &mut self,
        transaction: Value,
        aws_request_id: String,
        done: oneshot::Sender<()>,
    ) {
        if !self.should_register.load(Ordering::Relaxed)
            || self.registration.is_some()
            || self.pending_registration.is_some()
        {
            debug!("INTAKE | Skipping transaction registration");
            let _ = done.send(());
            return;
        }
        self.pending_registration = Some(PendingRegistration {
            transaction,
            aws_request_id,
            done,
        });
        self.start_pending_registration();
    }

    fn start_pending_registration(&mut self) {
        if !self.metadata.is_ready() || self.registration.is_some() {
            return;
        }
        let Some(pending) = self.pending_registration.take() else {
            return;
        };
        let url = match self.config.endpoint(REGISTER_TRANSACTION_PATH) {
            Ok(url) => url,
            Err(e) => {
                error!("INTAKE | Unable to register transaction: {e}");
                let _ = pending.done.send(());
                return;
            }
        };

        let mut body = self.metadata.encoded().to_vec();
        body.extend(encoder::encode(
            EventKind::Transaction,
            pending.transaction,
            &self.limits,
        ));
        let handle = tokio::spawn(upload::register_transaction(
            self.client.clone(),
            url,
            self.headers.clone(),
            Bytes::from(body),
            pending.aws_request_id,
            self.config.intake_response_timeout_on_end(),
        ));
        self.registration = Some(Registration {
            handle,
            done: pending.done,
        });
    }

    fn on_registration_complete(&mut self, outcome: Result<RegisterOutcome, JoinError>) {
        let Some(registration) = self.registration.take() else {
            return;
        };
        match outcome {
            Ok(RegisterOutcome::Registered) => debug!("INTAKE | Registered transaction"),
            Ok(RegisterOutcome::NotSupported) => {
                debug!("INTAKE | Transaction registration not supported, disabling it");
                self.should_register.store(false, Ordering::Relaxed);
            }
            Ok(RegisterOutcome::Failed(err)) => {
                debug!("INTAKE | Unable to register transaction: {err}");
            }
            Err(e) => error!("INTAKE | Registration task failed: {e}"),
        }
        if self.lambda == LambdaState::AwaitingRegistration {
            self.lambda = LambdaState::Active;
            if !self.buffer.is_empty() {
                self.uncork_requested = true;
            }
        }
        let _ = registration.done.send(());
        self.maybe_start_upload();
    }

    fn end(&mut self, done: oneshot::Sender<()>) {
        self.ending.push(done);
        self.upload_timeout = self.config.intake_response_timeout_on_end();
        if !self.buffer.is_empty() {
            self.uncork_requested = true;
        }
        self.maybe_start_upload();
    }

    // Called once no upload is in flight after `end`: what is still buffered
    // cannot be uploaded anymore.
    fn finish(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                "INTAKE | Dropping {} buffered records on end",
                self.buffer.len()
            );
        }
        if let Some(registration) = self.registration.take() {
            registration.handle.abort();
        }
        self.clear();
        release(std::mem::take(&mut self.ending));
        debug!("INTAKE | Writer ended");
    }

    fn destroy(&mut self) {
        if let Some(upload) = self.in_flight.take() {
            upload.handle.abort();
        }
        if let Some(registration) = self.registration.take() {
            registration.handle.abort();
        }
        self.clear();
        debug!("INTAKE | Writer destroyed");
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.cork_deadline = None;
        self.uncork_requested = false;
        release(self.flush_waiters.drain(..).map(|waiter| waiter.done));
        if let Some(end) = self.lambda_end.take() {
            release(end.waiters);
        }
        if let Some(pending) = self.pending_registration.take() {
            let _ = pending.done.send(());
        }
    }
}

fn release(waiters: impl IntoIterator<Item = oneshot::Sender<()>>) {
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

async fn cork_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn join<T>(handle: Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
