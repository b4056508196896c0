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

//! # relaypubd
//!
//! A small ActivityPub server built on [relaypub].
//!
//! # Introduction
//!
//! relaypubd hosts a fixed set of local actors, held in memory, and speaks both halves of the
//! protocol on their behalf: peers deliver to their inboxes (authenticated by HTTP signature), and
//! the operator posts to their outboxes (authenticated by a bearer token). Deliveries are signed
//! with a single instance key & retried in the background.

use std::{
    collections::{HashMap, HashSet},
    env,
    fmt::Display,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use axum::{routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use futures::FutureExt;
use http::{header::AUTHORIZATION, request::Parts, HeaderName, HeaderValue, StatusCode};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::{broadcast::error::RecvError, Notify},
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use url::Url;

use relaypub::{
    actor::{make_router as make_actor_router, Actor},
    ap_entities::{ActivityKind, Object},
    authn::{self, private_key_from_pem, VerifiedKey},
    callbacks::{self, Callback, Callbacks, OnFollow},
    client::Signer,
    delivery::{self, DeliveryEngine},
    http::status_response,
    memory::{self, MemoryDatabase},
    metrics::{self, check_metric_registrations},
    protocol::{self, Authentication, CommonBehavior, FederatingProtocol, SocialProtocol},
    side_effect_actor::SideEffectActor,
    storage::Database,
    transport::{self, HttpSigTransport, Transport},
};

/// The relaypubd application error type
///
/// As with any binary returning `Result` from `main()`, the [Debug] implementation is what the
/// operator sees on failure, so it's written by hand to defer to [Display].
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Invalid callbacks: {source}"))]
    Callbacks { source: callbacks::Error },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to create the delivery engine: {source}"))]
    Delivery { source: delivery::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to parse a key: {source}"))]
    KeyParse { source: authn::Error },
    #[snafu(display("Failed to create the local actor {username}: {source}"))]
    LocalActor {
        username: String,
        source: memory::Error,
    },
    #[snafu(display("Metric registration failure: {source}"))]
    Metrics { source: metrics::Error },
    #[snafu(display("While building the OLTP exporter, {source}"))]
    OltpExporer {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Failed to read the key file {pth:?}: {source}"))]
    ReadKey {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Bad HTTP signature: {source}"))]
    Signature { source: authn::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
    #[snafu(display("Failed to create a transport: {source}"))]
    Transport { source: transport::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

type ProtocolResult<T> = StdResult<T, protocol::Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<std::time::Duration>,
}

/// The instance key pair; every local actor signs with it
#[derive(Clone, Debug, Deserialize)]
pub struct SigningKeyConfig {
    /// PEM-encoded PKCS#8 RSA private key
    #[serde(rename = "private-key")]
    private_key: PathBuf,
    /// PEM-encoded public half of `private_key`, published in each actor's `publicKey`
    #[serde(rename = "public-key")]
    public_key: PathBuf,
}

/// relaypubd configuration, version one
// Not `Clone`, thanks to the API token.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// Local address at which to listen; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// The origin at which this instance may be reached from the public internet; local actor IDs
    /// are minted beneath it
    #[serde(rename = "public-origin")]
    public_origin: Url,
    #[serde(rename = "user-agent")]
    user_agent: String,
    /// Usernames of the local actors
    actors: Vec<String>,
    /// None means deliveries go out unsigned (and most peers will refuse them)
    #[serde(rename = "signing-key")]
    signing_key: Option<SigningKeyConfig>,
    /// Bearer token required to post to any outbox or read any inbox; None shuts both off
    #[serde(rename = "api-token")]
    api_token: Option<SecretString>,
    /// Activities from (or forwarded to) actors on these hosts are refused
    #[serde(rename = "blocked-domains")]
    blocked_domains: Vec<String>,
    #[serde(rename = "on-follow")]
    on_follow: OnFollow,
    #[serde(rename = "enable-social")]
    enable_social: bool,
    #[serde(rename = "enable-federation")]
    enable_federation: bool,
    #[serde(rename = "max-delivery-depth")]
    max_delivery_depth: i64,
    #[serde(rename = "max-forwarding-depth")]
    max_forwarding_depth: i64,
    delivery: delivery::Config,
    /// OTLP export target; None means don't export
    #[serde(rename = "otlp-export")]
    otlp_export: Option<OtelExportConfig>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:20779".parse::<SocketAddr>().unwrap(/* known good */),
            public_origin: Url::parse("http://localhost:20779").unwrap(/* known good */),
            user_agent: format!("relaypub/{}; +sp1ff@pobox.com", crate_version!()),
            actors: Vec::new(),
            signing_key: None,
            api_token: None,
            blocked_domains: Vec::new(),
            on_follow: OnFollow::default(),
            enable_social: true,
            enable_federation: true,
            max_delivery_depth: 4,
            max_forwarding_depth: 4,
            delivery: delivery::Config::default(),
            otlp_export: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the relaypubd configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/relaypubd.toml").unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(cfg) => match cfg {
                Configuration::V1(cfg) => Ok(cfg),
            },
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Configure relaypubd logging
///
/// JSON to stdout, unless `--plain` was given. This can only be done once, since the caller hands
/// the result to [set_global_default](tracing::subscriber::set_global_default).
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types, hence the box.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the application                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// relaypubd's policies, as handed to the library
struct App {
    db: Arc<MemoryDatabase>,
    /// Signing transports, keyed by local actor
    transports: HashMap<Url, Arc<dyn Transport>>,
    /// Unsigned, for fetching keys & for boxes with no local actor
    fetcher: Arc<dyn Transport>,
    api_token: Option<SecretString>,
    blocked_domains: HashSet<String>,
    federating_callbacks: Arc<Callbacks>,
    social_callbacks: Arc<Callbacks>,
    max_delivery_depth: i64,
    max_forwarding_depth: i64,
}

impl App {
    fn is_blocked(&self, iri: &Url) -> bool {
        iri.host_str()
            .map(|host| self.blocked_domains.contains(&host.to_lowercase()))
            .unwrap_or(false)
    }
    /// Check for `Authorization: Bearer {api-token}`
    fn bearer(&self, request: &Parts) -> Authentication {
        let presented = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        match (&self.api_token, presented) {
            (Some(token), Some(presented)) if token.expose_secret() == presented => {
                Authentication::Proceed
            }
            (None, _) => Authentication::Halt(status_response(StatusCode::FORBIDDEN)),
            _ => Authentication::Halt(status_response(StatusCode::UNAUTHORIZED)),
        }
    }
    /// Verify an inbound delivery's signature; return the owner of the signing key
    async fn verify(&self, request: &Parts, body: &[u8]) -> Result<VerifiedKey> {
        authn::verify_delivery(self.fetcher.as_ref(), request, body, &self.now())
            .await
            .context(SignatureSnafu)
    }
}

#[async_trait]
impl CommonBehavior for App {
    async fn authenticate_get_inbox(&self, request: &Parts) -> ProtocolResult<Authentication> {
        Ok(self.bearer(request))
    }
    async fn authenticate_get_outbox(&self, _request: &Parts) -> ProtocolResult<Authentication> {
        Ok(Authentication::Proceed)
    }
    async fn get_outbox(&self, _request: &Parts, outbox: &Url) -> ProtocolResult<Object> {
        self.db.get_outbox(outbox).await.map_err(protocol::Error::new)
    }
    async fn new_transport(&self, box_iri: &Url) -> ProtocolResult<Arc<dyn Transport>> {
        let actor = match self.db.actor_for_outbox(box_iri).await {
            Ok(actor) => Some(actor),
            Err(_) => self.db.actor_for_inbox(box_iri).await.ok(),
        };
        actor
            .and_then(|actor| self.transports.get(&actor).cloned())
            .unwrap_or_else(|| self.fetcher.clone())
            .pipe(Ok)
    }
}

#[async_trait]
impl FederatingProtocol for App {
    async fn authenticate_post_inbox(
        &self,
        request: &Parts,
        body: &[u8],
    ) -> ProtocolResult<Authentication> {
        let signer = match self.verify(request, body).await {
            Ok(signer) => signer,
            Err(err) => {
                debug!("Refusing an unauthenticated delivery: {err:?}");
                return Ok(Authentication::Halt(status_response(StatusCode::UNAUTHORIZED)));
            }
        };
        if self.is_blocked(&signer.key_id) {
            debug!("Refusing a delivery signed by {}", signer.key_id);
            return Ok(Authentication::Halt(status_response(StatusCode::FORBIDDEN)));
        }
        // Bodies that aren't objects are refused further on; all that matters here is that the
        // signer not put words in anyone else's mouth.
        match Object::from_slice(body) {
            Ok(activity) if !authn::attributable_to(&signer.owner, &activity) => {
                debug!(
                    "Refusing a delivery signed by {} on behalf of {:?}",
                    signer.key_id,
                    activity.iris("actor")
                );
                Ok(Authentication::Halt(status_response(StatusCode::FORBIDDEN)))
            }
            _ => {
                debug!("Delivery signed by {}", signer.key_id);
                Ok(Authentication::Proceed)
            }
        }
    }
    async fn blocked(&self, actors: &[Url]) -> ProtocolResult<bool> {
        Ok(actors.iter().any(|actor| self.is_blocked(actor)))
    }
    fn federating_callbacks(&self) -> Arc<Callbacks> {
        self.federating_callbacks.clone()
    }
    async fn default_callback(&self, activity: &Object) -> ProtocolResult<()> {
        info!("Ignoring an inbound {:?}", activity.types());
        Ok(())
    }
    fn max_inbox_forwarding_recursion_depth(&self) -> i64 {
        self.max_forwarding_depth
    }
    fn max_delivery_recursion_depth(&self) -> i64 {
        self.max_delivery_depth
    }
    async fn filter_forwarding(
        &self,
        potential_recipients: Vec<Url>,
        _activity: &Object,
    ) -> ProtocolResult<Vec<Url>> {
        potential_recipients
            .into_iter()
            .filter(|iri| !self.is_blocked(iri))
            .collect::<Vec<Url>>()
            .pipe(Ok)
    }
    async fn get_inbox(&self, _request: &Parts, inbox: &Url) -> ProtocolResult<Object> {
        self.db.get_inbox(inbox).await.map_err(protocol::Error::new)
    }
}

#[async_trait]
impl SocialProtocol for App {
    async fn authenticate_post_outbox(&self, request: &Parts) -> ProtocolResult<Authentication> {
        Ok(self.bearer(request))
    }
    fn social_callbacks(&self) -> Arc<Callbacks> {
        self.social_callbacks.clone()
    }
}

/// Log follows as they're processed; the library takes care of replying
fn log_follows() -> Callback {
    Callback::Wrapped(
        ActivityKind::Follow,
        Arc::new(|activity: Object| {
            async move {
                info!(
                    "{} followed {}",
                    activity.get_str("actor").unwrap_or("(unknown)"),
                    activity.get_str("object").unwrap_or("(unknown)")
                );
                Ok::<(), protocol::Error>(())
            }
            .boxed()
        }),
    )
}

/// Build the application & populate the database per `cfg`
fn make_app(cfg: &ConfigV1) -> Result<(Arc<MemoryDatabase>, App)> {
    let db = Arc::new(MemoryDatabase::new(&cfg.public_origin));

    let keys = cfg
        .signing_key
        .as_ref()
        .map(|keys| -> Result<(String, String)> {
            let private = std::fs::read_to_string(&keys.private_key).context(ReadKeySnafu {
                pth: keys.private_key.clone(),
            })?;
            let public = std::fs::read_to_string(&keys.public_key).context(ReadKeySnafu {
                pth: keys.public_key.clone(),
            })?;
            Ok((private, public))
        })
        .transpose()?;

    let mut transports: HashMap<Url, Arc<dyn Transport>> = HashMap::new();
    for username in &cfg.actors {
        let actor = db
            .add_actor(username, keys.as_ref().map(|(_, public)| public.as_str()))
            .context(LocalActorSnafu {
                username: username.clone(),
            })?;
        if let (Some((private, _)), Some(id)) = (&keys, actor.id()) {
            let signer = Signer::new(
                &format!("{id}#main-key"),
                private_key_from_pem(private).context(KeyParseSnafu)?,
            );
            transports.insert(
                id,
                Arc::new(
                    HttpSigTransport::new(&cfg.user_agent, Some(Arc::new(signer)))
                        .context(TransportSnafu)?,
                ),
            );
        }
        info!("Hosting local actor {username}");
    }

    let app = App {
        db: db.clone(),
        transports,
        fetcher: Arc::new(HttpSigTransport::new(&cfg.user_agent, None).context(TransportSnafu)?),
        api_token: cfg
            .api_token
            .as_ref()
            .map(|token| SecretString::from(token.expose_secret().to_owned())),
        blocked_domains: cfg
            .blocked_domains
            .iter()
            .map(|domain| domain.to_lowercase())
            .collect(),
        federating_callbacks: Arc::new(
            Callbacks::new(vec![log_follows()], cfg.on_follow).context(CallbacksSnafu)?,
        ),
        social_callbacks: Arc::new(Callbacks::default()),
        max_delivery_depth: cfg.max_delivery_depth,
        max_forwarding_depth: cfg.max_forwarding_depth,
    };

    Ok((db, app))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 is more readable than a UUID, and doubles as a rough
/// gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(actor: Actor) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(make_actor_router(actor, "/users/{username}"))
        // Incoming requests should hit `SetRequestIdLayer` first, so it's applied last:
        //
        //                 requests
        //                    |
        //                    v
        // +---------  SetRequestIdLayer      ---------+
        // | +-----      TraceLayer         -----+     |
        // | | +--- PropagateRequestIdLayer ---+ |     |
        // | | |          handler              | |     |
        // | | +--- PropagateRequestIdLayer ---+ |     |
        // | +-----      TraceLayer         -----+     |
        // +---------   SetRequestIdLayer     ---------+
        //                    |
        //                    v
        //                responses
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

/// Report deliveries the engine gives up on
fn watch_failures(engine: &DeliveryEngine) {
    let mut failures = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(failure) => error!(
                    "Giving up on delivery to {} after {} attempts: {}",
                    failure.destination, failure.attempts, failure.error
                ),
                Err(RecvError::Lagged(n)) => warn!("Missed {n} delivery failures"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Serve ActivityPub requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    init_telemetry(cfg.otlp_export.as_ref())?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        let (db, app) = make_app(&cfg)?;
        let app = Arc::new(app);

        let engine = DeliveryEngine::new(cfg.delivery.clone(), None).context(DeliverySnafu)?;
        watch_failures(&engine);

        let federating: Option<Arc<dyn FederatingProtocol>> = if cfg.enable_federation {
            Some(app.clone())
        } else {
            None
        };
        let social: Option<Arc<dyn SocialProtocol>> = if cfg.enable_social {
            Some(app.clone())
        } else {
            None
        };
        let inner = SideEffectActor::new(db, app.clone(), federating, social)
            .with_delivery_engine(engine.clone());
        let actor = Actor::new(cfg.public_origin.clone(), inner);

        let nfy = Arc::new(Notify::new());
        let server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(actor),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()));

        info!("Listening on {}", cfg.public_address);

        let mut server = server.into_future();

        tokio::select! {
            // The server *should* never shut down on its own.
            res = &mut server => {
                error!("The server exited unexpectedly with {:?}; shutting-down.", res);
                engine.stop().await;
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                // Outstanding deliveries don't survive a reload.
                if engine.pending() > 0 {
                    warn!("Abandoning {} pending deliveries.", engine.pending());
                }
                engine.stop().await;
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{err:?}; keeping the current configuration.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                engine.stop().await;
                break;
            }
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// <div class="warning">
///
/// This method must be invoked from inside the Tokio runtime, but before any instruments are
/// accessed.
///
/// </div>
///
/// Instruments bind to the global meter provider on first use; the provider installed here always
/// exists, but only exports anything if `collector_config` names an OTLP endpoint.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<()> {
    let n = check_metric_registrations().context(MetricsSnafu)?;
    debug!("{n} metrics registered.");

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().with_resource(
        opentelemetry_sdk::Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", "relaypub"))
            .build(),
    );

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OltpExporerSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(())
}

/// Transition to async: configure logging, then serve
///
/// Logging is configured here, rather than in [serve], because [serve] is instrumented & we'd
/// like its span to be recorded.
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    #[allow(clippy::type_complexity)]
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(ConfigV1, Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
        // Failure to parse at this point is fatal; on SIGHUP, we fall back to the last "known-good"
        // configuration & keep going.
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter) = configure_logging(&opts.log_opts)?;
        Ok((cfg, formatter, filter))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter)) => {
            // Nb. this can only be invoked once!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);

            info!("relaypub version {} starting.", crate_version!());

            serve(opts, cfg).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most of relaypubd's configuration is read from file; the command-line options govern where to
    // find that file & how to log. They all have corresponding environment variables for the sake
    // of convenience when running in a container.
    let opts = CliOpts::new(
        Command::new("relaypubd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A small ActivityPub server")
            .long_about("`relaypubd` hosts a set of ActivityPub actors, speaking both the federated & social protocols on their behalf.")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("RELAYPUB_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("RELAYPUB_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("RELAYPUB_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("RELAYPUB_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("RELAYPUB_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Until the configuration's been read, log to stderr at whatever level the command line
    // dictates.
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
