// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of relaypub.
//
// relaypub is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// relaypub is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with relaypub.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Outbound delivery
//!
//! When a local actor posts an activity, the peers to whom it's addressed may be slow, down, or
//! simply gone. Callers don't want to wait on any of that, so rather than POST to each inbox
//! inline, they hand the payload to a [DeliveryEngine] and move on.
//!
//! The engine makes the first attempt right away. Each failure multiplies the wait before the next
//! attempt by a configurable factor (up to a ceiling), until either a send succeeds or the task
//! runs out of retries. With an initial wait of one second, a factor of two & a ceiling of ten
//! seconds, the waits between attempts go 1, 2, 4, 8, 10, 10 &c. All attempts, first & retried,
//! draw from a single [governor] rate limiter so that a burst of outbound activity can't swamp our
//! peers (or our own network).
//!
//! Pending retries are just tokio tasks sleeping on a timer. The engine keeps their
//! [JoinHandle]s in a private map keyed by a monotonically increasing handle, so that
//! [DeliveryEngine::stop] can wake every one of them (through a shared [CancellationToken]) and
//! wait for them to wind down.
//!
//! None of this is durable on its own; an application wanting deliveries to survive a restart can
//! supply a [DeliveryPersister], which is told about each delivery's progress & can later feed
//! unfinished ones back in through [DeliveryEngine::restart]. Deliveries that are finally given up
//! on are also announced on a [broadcast] channel (see [DeliveryEngine::subscribe]).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, RateLimiter};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use relaypub_shared::service::{self, RateLimit};

use crate::{define_metric, storage, transport};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A backoff factor of {factor} is invalid; it must be finite & at least one"))]
    BackoffFactor { factor: f64, backtrace: Backtrace },
    #[snafu(display("initial-wait ({initial_wait:?}) may not exceed max-wait ({max_wait:?})"))]
    InitialWait {
        initial_wait: Duration,
        max_wait: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("max-retries must be at least one"))]
    MaxRetries { backtrace: Backtrace },
    #[snafu(display("Invalid rate limit: {source}"))]
    RateLimit { source: service::Error },
    #[snafu(display("The delivery engine has been stopped"))]
    Stopped { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Delivery engine configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// How long to wait after the first failed attempt
    #[serde(rename = "initial-wait")]
    pub initial_wait: Duration,
    /// Each subsequent wait is the prior wait times this factor...
    #[serde(rename = "backoff-factor")]
    pub backoff_factor: f64,
    /// ...but never more than this
    #[serde(rename = "max-wait")]
    pub max_wait: Duration,
    /// Give up after this many failed attempts
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
    /// Limit on attempts across all deliveries
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimit,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_wait: Duration::from_secs(10),
            backoff_factor: 2.0,
            max_wait: Duration::from_secs(30 * 60),
            max_retries: 10,
            rate_limit: RateLimit::default(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          persistence                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Application hook for recording the progress of each delivery
///
/// A delivery begins with [DeliveryPersister::sending], after which the engine reports zero or
/// more retries followed by exactly one of success, abandonment, or cancellation (the latter when
/// the engine is stopped with the delivery still outstanding). Errors are logged & otherwise
/// ignored; they never affect the delivery itself.
#[async_trait]
pub trait DeliveryPersister: Send + Sync {
    /// A new delivery of `payload` to `to` is starting; return an ID by which to refer to it
    async fn sending(&self, payload: &Bytes, to: &Url) -> StdResult<String, storage::Error>;
    async fn cancel(&self, id: &str) -> StdResult<(), storage::Error>;
    async fn successful(&self, id: &str) -> StdResult<(), storage::Error>;
    async fn retrying(&self, id: &str) -> StdResult<(), storage::Error>;
    async fn undeliverable(&self, id: &str) -> StdResult<(), storage::Error>;
}

/// A delivery that was finally given up on
#[derive(Clone, Debug)]
pub struct Failure {
    pub destination: Url,
    pub attempts: u32,
    pub persistence_id: Option<String>,
    pub error: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           RetryTask                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The function that actually sends a payload; typically a thin wrapper around
/// [Transport::deliver](crate::transport::Transport::deliver)
pub type SendFn =
    Arc<dyn Fn(Bytes, Url) -> BoxFuture<'static, StdResult<(), transport::Error>> + Send + Sync>;

/// One pending delivery
#[derive(Clone)]
struct RetryTask {
    next_wait: Duration,
    attempts: u32,
    send_fn: SendFn,
    persistence_id: Option<String>,
    payload: Bytes,
    destination: Url,
}

impl RetryTask {
    fn new(
        payload: Bytes,
        destination: Url,
        persistence_id: Option<String>,
        send_fn: SendFn,
        config: &Config,
    ) -> RetryTask {
        RetryTask {
            next_wait: config.initial_wait,
            attempts: 0,
            send_fn,
            persistence_id,
            payload,
            destination,
        }
    }
    /// The task to schedule after a failed attempt
    fn retry(self, factor: f64, max_wait: Duration) -> RetryTask {
        RetryTask {
            // Overflow (or an infinite product) just means "as long as we'll ever wait"
            next_wait: Duration::try_from_secs_f64(self.next_wait.as_secs_f64() * factor)
                .map_or(max_wait, |wait| wait.min(max_wait)),
            attempts: self.attempts + 1,
            ..self
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         DeliveryEngine                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "delivery.enqueued",      delivery_enqueued,      Sort::IntegralCounter }
define_metric! { "delivery.successes",     delivery_successes,     Sort::IntegralCounter }
define_metric! { "delivery.retries",       delivery_retries,       Sort::IntegralCounter }
define_metric! { "delivery.abandoned",     delivery_abandoned,     Sort::IntegralCounter }
define_metric! { "delivery.cancellations", delivery_cancellations, Sort::IntegralCounter }

#[derive(Default)]
struct Timers {
    next_handle: u64,
    map: HashMap<u64, JoinHandle<()>>,
}

struct Inner {
    config: Config,
    limiter: DefaultDirectRateLimiter,
    cancel: CancellationToken,
    timers: Mutex<Timers>,
    persister: Option<Arc<dyn DeliveryPersister>>,
    failures: broadcast::Sender<Failure>,
}

/// A rate-limited, retrying, cancellable delivery queue
///
/// Cloning a [DeliveryEngine] produces another handle on the same engine.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("config", &self.inner.config)
            .field("stopped", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

/// Where a delivery stands, as reported to the [DeliveryPersister]
enum State {
    Cancel,
    Successful,
    Retrying,
    Undeliverable,
}

enum Outcome {
    Delivered,
    Cancelled,
    Retry(RetryTask, Duration),
    Abandoned,
}

impl DeliveryEngine {
    pub fn new(
        config: Config,
        persister: Option<Arc<dyn DeliveryPersister>>,
    ) -> Result<DeliveryEngine> {
        ensure!(
            config.backoff_factor.is_finite() && config.backoff_factor >= 1.0,
            BackoffFactorSnafu {
                factor: config.backoff_factor
            }
        );
        ensure!(
            config.initial_wait <= config.max_wait,
            InitialWaitSnafu {
                initial_wait: config.initial_wait,
                max_wait: config.max_wait,
            }
        );
        ensure!(config.max_retries > 0, MaxRetriesSnafu);
        let limiter = RateLimiter::direct(config.rate_limit.quota().context(RateLimitSnafu)?);
        let (failures, _) = broadcast::channel(64);
        Ok(DeliveryEngine {
            inner: Arc::new(Inner {
                config,
                limiter,
                cancel: CancellationToken::new(),
                timers: Mutex::new(Timers::default()),
                persister,
                failures,
            }),
        })
    }
    /// Deliver `payload` to `destination` via `send_fn`, in the background
    ///
    /// Returns as soon as the delivery is queued.
    pub async fn enqueue(&self, payload: Bytes, destination: Url, send_fn: SendFn) -> Result<()> {
        ensure!(!self.inner.cancel.is_cancelled(), StoppedSnafu);
        let persistence_id = match &self.inner.persister {
            Some(persister) => persister
                .sending(&payload, &destination)
                .await
                .inspect_err(|err| error!("Failed to persist delivery to {destination}: {err}"))
                .ok(),
            None => None,
        };
        delivery_enqueued.add(1, &[]);
        let task = RetryTask::new(
            payload,
            destination,
            persistence_id,
            send_fn,
            &self.inner.config,
        );
        self.schedule(task, Duration::ZERO)
    }
    /// Resume a delivery the [DeliveryPersister] knows as `persistence_id`
    ///
    /// Retry accounting starts afresh.
    pub fn restart(
        &self,
        payload: Bytes,
        destination: Url,
        persistence_id: &str,
        send_fn: SendFn,
    ) -> Result<()> {
        ensure!(!self.inner.cancel.is_cancelled(), StoppedSnafu);
        let task = RetryTask::new(
            payload,
            destination,
            Some(persistence_id.to_owned()),
            send_fn,
            &self.inner.config,
        );
        self.schedule(task, Duration::ZERO)
    }
    /// Subscribe to deliveries the engine gives up on
    pub fn subscribe(&self) -> broadcast::Receiver<Failure> {
        self.inner.failures.subscribe()
    }
    /// Stop the engine
    ///
    /// All pending & in-flight deliveries are cancelled, and this method waits for them to wind
    /// down. Calling it again is harmless.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handles = self
            .timers()
            .map
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<JoinHandle<()>>>();
        debug!("Stopping the delivery engine; {} tasks pending", handles.len());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("A delivery task failed to exit cleanly: {err}");
            }
        }
    }
    /// The number of pending deliveries
    pub fn pending(&self) -> usize {
        self.timers().map.len()
    }
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
    /// Arrange for `task` to be attempted after `delay`
    fn schedule(&self, task: RetryTask, delay: Duration) -> Result<()> {
        // Checking for cancellation under the lock means `stop` either sees this timer when it
        // drains the map, or we see the cancellation here.
        let mut timers = self.timers();
        ensure!(!self.inner.cancel.is_cancelled(), StoppedSnafu);
        let handle = timers.next_handle;
        timers.next_handle += 1;
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.fire(handle, task, delay).await });
        timers.map.insert(handle, join);
        Ok(())
    }
    async fn fire(self, handle: u64, task: RetryTask, delay: Duration) {
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.inner.cancel.cancelled() => true,
        };
        let outcome = if cancelled {
            Outcome::Cancelled
        } else {
            self.attempt(&task).await
        };
        self.timers().map.remove(&handle);
        match outcome {
            Outcome::Delivered => {
                delivery_successes.add(1, &[KeyValue::new("host", host_of(&task.destination))]);
                self.notify(&task, State::Successful).await;
            }
            Outcome::Cancelled => self.cancelled(&task).await,
            Outcome::Retry(next, wait) => {
                delivery_retries.add(1, &[KeyValue::new("host", host_of(&task.destination))]);
                self.notify(&task, State::Retrying).await;
                if self.schedule(next, wait).is_err() {
                    self.cancelled(&task).await;
                }
            }
            Outcome::Abandoned => (),
        }
    }
    /// Make one attempt at delivering `task`
    async fn attempt(&self, task: &RetryTask) -> Outcome {
        let cancel = &self.inner.cancel;
        tokio::select! {
            _ = self.inner.limiter.until_ready() => (),
            _ = cancel.cancelled() => return Outcome::Cancelled,
        }
        let result = tokio::select! {
            result = (task.send_fn)(task.payload.clone(), task.destination.clone()) => result,
            _ = cancel.cancelled() => return Outcome::Cancelled,
        };
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        match result {
            Ok(()) => {
                info!("Delivered to {}", task.destination);
                Outcome::Delivered
            }
            Err(err) => {
                let config = &self.inner.config;
                let wait = task.next_wait;
                let next = task.clone().retry(config.backoff_factor, config.max_wait);
                if next.attempts >= config.max_retries {
                    error!(
                        "Giving up on delivery to {} after {} attempts: {err}",
                        task.destination, next.attempts
                    );
                    delivery_abandoned
                        .add(1, &[KeyValue::new("host", host_of(&task.destination))]);
                    self.notify(task, State::Undeliverable).await;
                    // No subscribers is fine
                    let _ = self.inner.failures.send(Failure {
                        destination: task.destination.clone(),
                        attempts: next.attempts,
                        persistence_id: task.persistence_id.clone(),
                        error: err.to_string(),
                    });
                    Outcome::Abandoned
                } else {
                    warn!(
                        "Delivery to {} failed ({err}); retrying in {:?}",
                        task.destination, wait
                    );
                    Outcome::Retry(next, wait)
                }
            }
        }
    }
    async fn cancelled(&self, task: &RetryTask) {
        debug!("Delivery to {} cancelled", task.destination);
        delivery_cancellations.add(1, &[]);
        self.notify(task, State::Cancel).await;
    }
    async fn notify(&self, task: &RetryTask, state: State) {
        if let (Some(persister), Some(id)) = (&self.inner.persister, &task.persistence_id) {
            let result = match state {
                State::Cancel => persister.cancel(id).await,
                State::Successful => persister.successful(id).await,
                State::Retrying => persister.retrying(id).await,
                State::Undeliverable => persister.undeliverable(id).await,
            };
            if let Err(err) = result {
                error!("Failed to record the state of delivery {id}: {err}");
            }
        }
    }
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or("unknown").to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use nonzero::nonzero;
    use tokio::time::Instant;

    fn config(max_retries: u32) -> Config {
        Config {
            initial_wait: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_wait: Duration::from_secs(10),
            max_retries,
            rate_limit: RateLimit {
                num: nonzero!(100u32).get(),
                duration: Duration::from_secs(1),
            },
        }
    }

    fn destination() -> Url {
        Url::parse("https://b.example/users/bob/inbox").unwrap()
    }

    fn failing(calls: Arc<Mutex<Vec<Instant>>>) -> SendFn {
        Arc::new(move |_: Bytes, to: Url| {
            calls.lock().unwrap().push(Instant::now());
            async move {
                Err::<(), _>(transport::Error::Status {
                    iri: to,
                    status: http::StatusCode::SERVICE_UNAVAILABLE,
                })
            }
            .boxed()
        })
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliveryPersister for Recorder {
        async fn sending(&self, _: &Bytes, to: &Url) -> StdResult<String, storage::Error> {
            self.events.lock().unwrap().push(format!("sending {to}"));
            Ok("d1".to_owned())
        }
        async fn cancel(&self, id: &str) -> StdResult<(), storage::Error> {
            self.events.lock().unwrap().push(format!("cancel {id}"));
            Ok(())
        }
        async fn successful(&self, id: &str) -> StdResult<(), storage::Error> {
            self.events.lock().unwrap().push(format!("successful {id}"));
            Ok(())
        }
        async fn retrying(&self, id: &str) -> StdResult<(), storage::Error> {
            self.events.lock().unwrap().push(format!("retrying {id}"));
            Ok(())
        }
        async fn undeliverable(&self, id: &str) -> StdResult<(), storage::Error> {
            self.events.lock().unwrap().push(format!("undeliverable {id}"));
            Ok(())
        }
    }

    #[test]
    fn retry_backoff() {
        let send_fn: SendFn = Arc::new(|_: Bytes, _: Url| async { Ok(()) }.boxed());
        let mut task = RetryTask::new(Bytes::new(), destination(), None, send_fn, &config(10));
        let mut waits = Vec::new();
        for _ in 0..6 {
            waits.push(task.next_wait.as_secs());
            task = task.retry(2.0, Duration::from_secs(10));
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(task.attempts, 6);

        // Absurd factors saturate rather than overflow
        let task = task.retry(f64::MAX, Duration::from_secs(10)).retry(f64::MAX, Duration::MAX);
        assert_eq!(task.next_wait, Duration::MAX);
    }

    #[test]
    fn bad_configs() {
        let mut cfg = config(3);
        cfg.backoff_factor = 0.5;
        assert!(DeliveryEngine::new(cfg, None).is_err());
        assert!(DeliveryEngine::new(config(0), None).is_err());
        let mut cfg = config(3);
        cfg.initial_wait = cfg.max_wait + Duration::from_secs(1);
        assert!(DeliveryEngine::new(cfg, None).is_err());
        let mut cfg = config(3);
        cfg.backoff_factor = f64::MAX;
        assert!(DeliveryEngine::new(cfg, None).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_then_abandon() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let persister = Arc::new(Recorder::default());
        let engine = DeliveryEngine::new(config(7), Some(persister.clone())).unwrap();
        let mut failures = engine.subscribe();

        let start = Instant::now();
        engine
            .enqueue(Bytes::from_static(b"{}"), destination(), failing(calls.clone()))
            .await
            .unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.destination, destination());
        assert_eq!(failure.attempts, 7);
        assert_eq!(failure.persistence_id.as_deref(), Some("d1"));

        let offsets = calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| (*t - start).as_secs())
            .collect::<Vec<u64>>();
        assert_eq!(offsets, vec![0, 1, 3, 7, 15, 25, 35]);

        let events = persister.events.lock().unwrap().clone();
        assert_eq!(events.first().unwrap(), "sending https://b.example/users/bob/inbox");
        assert_eq!(events.iter().filter(|e| *e == "retrying d1").count(), 6);
        assert_eq!(events.last().unwrap(), "undeliverable d1");

        engine.stop().await;
        assert_eq!(engine.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure() {
        let count = Arc::new(AtomicUsize::new(0));
        let send_fn: SendFn = {
            let count = count.clone();
            Arc::new(move |_: Bytes, to: Url| {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(transport::Error::Status {
                            iri: to,
                            status: http::StatusCode::BAD_GATEWAY,
                        })
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
        };
        let persister = Arc::new(Recorder::default());
        let engine = DeliveryEngine::new(config(5), Some(persister.clone())).unwrap();
        engine
            .enqueue(Bytes::new(), destination(), send_fn)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.pending(), 0);
        assert_eq!(
            persister.events.lock().unwrap().last().unwrap(),
            "successful d1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let persister = Arc::new(Recorder::default());
        let engine = DeliveryEngine::new(config(10), Some(persister.clone())).unwrap();
        engine
            .enqueue(Bytes::new(), destination(), failing(calls.clone()))
            .await
            .unwrap();
        // Let the first attempt fail, leaving a retry waiting on its timer
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(engine.pending(), 1);

        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.pending(), 0);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(persister.events.lock().unwrap().last().unwrap(), "cancel d1");

        assert!(matches!(
            engine
                .enqueue(Bytes::new(), destination(), failing(calls.clone()))
                .await,
            Err(Error::Stopped { .. })
        ));
    }
}
