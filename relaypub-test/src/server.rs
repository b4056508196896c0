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

//! An in-process relaypub server for the integration tests to talk to
//!
//! Nearly everything's permitted: unsigned deliveries are accepted & nobody's blocked. What's under
//! test is the protocol machinery, not an application's policies. Signed deliveries are checked,
//! though, so that the signature machinery gets exercised end to end.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{routing::get, Router};
use futures::FutureExt;
use http::{request::Parts, StatusCode};
use libtest_mimic::Failed;
use tokio::{net::TcpListener, sync::Notify};
use tracing::error;
use url::Url;

use relaypub::{
    actor::{make_router, Actor},
    ap_entities::{ActivityKind, Object},
    authn,
    callbacks::{Callback, Callbacks, OnFollow},
    delivery::{self, DeliveryEngine},
    http::status_response,
    memory::MemoryDatabase,
    protocol::{self, Authentication, CommonBehavior, FederatingProtocol, SocialProtocol},
    side_effect_actor::SideEffectActor,
    storage::Database,
    transport::{HttpSigTransport, Transport},
};
use relaypub_shared::service::RateLimit;

type ProtocolResult<T> = std::result::Result<T, protocol::Error>;

/// The test application
pub struct TestApp {
    db: Arc<MemoryDatabase>,
    transport: Arc<dyn Transport>,
    federating_callbacks: Arc<Callbacks>,
    social_callbacks: Arc<Callbacks>,
    likes: Arc<AtomicUsize>,
}

impl TestApp {
    fn new(db: Arc<MemoryDatabase>) -> Result<TestApp, Failed> {
        let likes = Arc::new(AtomicUsize::new(0));
        let counter = likes.clone();
        let count_likes = Callback::Wrapped(
            ActivityKind::Like,
            Arc::new(move |_: Object| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), protocol::Error>(()) }.boxed()
            }),
        );
        Ok(TestApp {
            db,
            transport: Arc::new(HttpSigTransport::new("relaypub-test", None)?),
            federating_callbacks: Arc::new(Callbacks::new(
                vec![count_likes],
                OnFollow::AutomaticallyAccept,
            )?),
            social_callbacks: Arc::new(Callbacks::default()),
            likes,
        })
    }
    /// The number of times the Like callback has fired
    pub fn likes(&self) -> usize {
        self.likes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommonBehavior for TestApp {
    async fn authenticate_get_inbox(&self, _: &Parts) -> ProtocolResult<Authentication> {
        Ok(Authentication::Proceed)
    }
    async fn authenticate_get_outbox(&self, _: &Parts) -> ProtocolResult<Authentication> {
        Ok(Authentication::Proceed)
    }
    async fn get_outbox(&self, _: &Parts, outbox: &Url) -> ProtocolResult<Object> {
        self.db.get_outbox(outbox).await.map_err(protocol::Error::new)
    }
    async fn new_transport(&self, _: &Url) -> ProtocolResult<Arc<dyn Transport>> {
        Ok(self.transport.clone())
    }
}

#[async_trait]
impl FederatingProtocol for TestApp {
    /// Unsigned deliveries are let through; signed ones must be signed by their actor
    async fn authenticate_post_inbox(
        &self,
        request: &Parts,
        body: &[u8],
    ) -> ProtocolResult<Authentication> {
        if !request.headers.contains_key("signature") {
            return Ok(Authentication::Proceed);
        }
        let signer =
            match authn::verify_delivery(self.transport.as_ref(), request, body, &self.now()).await
            {
                Ok(signer) => signer,
                Err(err) => {
                    error!("Bad signature: {err}");
                    return Ok(Authentication::Halt(status_response(StatusCode::UNAUTHORIZED)));
                }
            };
        match Object::from_slice(body) {
            Ok(activity) if !authn::attributable_to(&signer.owner, &activity) => {
                Ok(Authentication::Halt(status_response(StatusCode::FORBIDDEN)))
            }
            _ => Ok(Authentication::Proceed),
        }
    }
    async fn blocked(&self, _: &[Url]) -> ProtocolResult<bool> {
        Ok(false)
    }
    fn federating_callbacks(&self) -> Arc<Callbacks> {
        self.federating_callbacks.clone()
    }
    fn max_inbox_forwarding_recursion_depth(&self) -> i64 {
        4
    }
    fn max_delivery_recursion_depth(&self) -> i64 {
        4
    }
    async fn filter_forwarding(
        &self,
        potential_recipients: Vec<Url>,
        _: &Object,
    ) -> ProtocolResult<Vec<Url>> {
        Ok(potential_recipients)
    }
    async fn get_inbox(&self, _: &Parts, inbox: &Url) -> ProtocolResult<Object> {
        self.db.get_inbox(inbox).await.map_err(protocol::Error::new)
    }
}

#[async_trait]
impl SocialProtocol for TestApp {
    async fn authenticate_post_outbox(&self, _: &Parts) -> ProtocolResult<Authentication> {
        Ok(Authentication::Proceed)
    }
    fn social_callbacks(&self) -> Arc<Callbacks> {
        self.social_callbacks.clone()
    }
}

/// A running relaypub server, listening on an ephemeral port on localhost
pub struct Instance {
    /// The server's origin; every local actor lives beneath it
    pub url: Url,
    pub db: Arc<MemoryDatabase>,
    pub engine: DeliveryEngine,
    pub app: Arc<TestApp>,
    shutdown: Arc<Notify>,
}

impl Instance {
    /// Start a server; must be called from within a Tokio runtime
    pub async fn start() -> Result<Instance, Failed> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = Url::parse(&format!("http://{}", listener.local_addr()?))?;
        let db = Arc::new(MemoryDatabase::new(&url));
        let app = Arc::new(TestApp::new(db.clone())?);
        // Retry briskly; the tests don't wait around.
        let engine = DeliveryEngine::new(
            delivery::Config {
                initial_wait: Duration::from_millis(100),
                backoff_factor: 2.0,
                max_wait: Duration::from_secs(1),
                max_retries: 3,
                rate_limit: RateLimit::default(),
            },
            None,
        )?;
        let inner = SideEffectActor::new(
            db.clone(),
            app.clone(),
            Some(app.clone()),
            Some(app.clone()),
        )
        .with_delivery_engine(engine.clone());
        let router = Router::new()
            .route("/healthcheck", get(|| async { "GOOD" }))
            .merge(make_router(Actor::new(url.clone(), inner), "/users/{username}"));

        let shutdown = Arc::new(Notify::new());
        let nfy = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { nfy.notified().await })
                .await
            {
                error!("The test server failed: {err:?}");
            }
        });

        Ok(Instance {
            url,
            db,
            engine,
            app,
            shutdown,
        })
    }
    /// Create a local actor named `username`; return its ID
    pub fn add_actor(&self, username: &str) -> Result<Url, Failed> {
        self.db
            .add_actor(username, None)?
            .id()
            .ok_or_else(|| Failed::from("a new actor had no id"))
    }
    pub fn inbox(&self, username: &str) -> Result<Url, Failed> {
        Ok(self.url.join(&format!("/users/{username}/inbox"))?)
    }
    pub fn outbox(&self, username: &str) -> Result<Url, Failed> {
        Ok(self.url.join(&format!("/users/{username}/outbox"))?)
    }
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        self.engine.stop().await;
    }
}
