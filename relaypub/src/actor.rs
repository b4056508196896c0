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

//! # The protocol endpoints
//!
//! [Actor] is the HTTP face of relaypub: hand it a request to an inbox or outbox & it will either
//! handle it completely or tell you it wasn't an ActivityPub request at all. The four endpoints
//! each return:
//!
//! - `Ok(None)`: not a protocol request (a browser asking for HTML, say); nothing was done &
//!   the caller is free to handle the request some other way
//! - `Ok(Some(response))`: handled; write `response`
//! - `Err(err)`: handled, but something went wrong on our side; write a 500 & log `err`
//!
//! [make_router] wraps all that up as an [axum] [Router] for applications that don't need to
//! interleave their own handling.

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use http::{header::LOCATION, request::Parts, Method, Response, StatusCode};
use opentelemetry::KeyValue;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, error};
use url::Url;

use crate::{
    ap_entities::Object,
    define_metric,
    http::{
        activity_response, error_response, is_protocol_get, is_protocol_post, status_response,
        ErrorResponseBody,
    },
    metrics::Sort,
    protocol::{self, Authentication},
    side_effect_actor::{self, SideEffectActor},
    storage,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Application hook failed: {source}"))]
    Application { source: protocol::Error },
    #[snafu(display("Failed to form a response: {source}"))]
    Http { source: crate::http::Error },
    #[snafu(display("Couldn't form an IRI from the request path {path}: {source}"))]
    Iri {
        path: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("The posted activity was never assigned an id"))]
    MissingId { backtrace: Backtrace },
    #[snafu(display("Failed to build a response: {source}"))]
    Response {
        source: http::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    SideEffects { source: side_effect_actor::Error },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Actor                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "inbox.posts",      inbox_posts,      Sort::IntegralCounter }
define_metric! { "inbox.rejections", inbox_rejections, Sort::IntegralCounter }
define_metric! { "outbox.posts",     outbox_posts,     Sort::IntegralCounter }
define_metric! { "objects.served",   objects_served,   Sort::IntegralCounter }

/// Serves the inboxes & outboxes of every actor on this server
#[derive(Clone, Debug)]
pub struct Actor {
    /// Request paths are resolved against this to produce the IRIs of inboxes, outboxes &c
    origin: Url,
    inner: SideEffectActor,
}

impl Actor {
    pub fn new(origin: Url, inner: SideEffectActor) -> Actor {
        Actor { origin, inner }
    }

    /// Handle a POST to an actor's inbox
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn post_inbox(&self, request: http::Request<Bytes>) -> Result<Option<Response<Bytes>>> {
        let (parts, body) = request.into_parts();
        if !is_protocol_post(&parts) {
            return Ok(None);
        }
        let Some(federating) = self.inner.federating().cloned() else {
            return Ok(Some(status_response(StatusCode::METHOD_NOT_ALLOWED)));
        };
        let inbox = self.iri_for(&parts)?;
        if !self.box_exists(&inbox).await? {
            return Ok(Some(status_response(StatusCode::NOT_FOUND)));
        }
        if let Authentication::Halt(response) = self
            .inner
            .authenticate_post_inbox(&parts, &body)
            .await
            .context(SideEffectsSnafu)?
        {
            inbox_rejections.add(1, &[KeyValue::new("reason", "authentication")]);
            return Ok(Some(response));
        }

        let activity = match Object::from_slice(&body) {
            Ok(activity) => activity,
            Err(err) => {
                debug!("Refusing an unparseable inbox post: {err}");
                return reject(StatusCode::BAD_REQUEST, "Malformed JSON object");
            }
        };
        if !activity.is_activity() {
            return reject(StatusCode::BAD_REQUEST, "Only activities may be posted to an inbox");
        }
        if activity.id().is_none() {
            return reject(StatusCode::BAD_REQUEST, "The activity has no id");
        }

        federating
            .post_inbox_request_body_hook(&parts, &activity)
            .await
            .context(ApplicationSnafu)?;
        if !self
            .inner
            .authorize_post_inbox(&activity)
            .await
            .context(SideEffectsSnafu)?
        {
            return reject(StatusCode::FORBIDDEN, "Forbidden");
        }

        if let Err(err) = self.inner.post_inbox(&inbox, &activity).await {
            return side_effect_failure(err);
        }
        self.inner
            .inbox_forwarding(&inbox, &activity)
            .await
            .context(SideEffectsSnafu)?;
        inbox_posts.add(1, &[]);
        Ok(Some(status_response(StatusCode::OK)))
    }

    /// Handle a GET of an actor's inbox
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn get_inbox(&self, request: http::Request<Bytes>) -> Result<Option<Response<Bytes>>> {
        let (parts, _) = request.into_parts();
        if !is_protocol_get(&parts) {
            return Ok(None);
        }
        let Some(federating) = self.inner.federating().cloned() else {
            return Ok(Some(status_response(StatusCode::METHOD_NOT_ALLOWED)));
        };
        let inbox = self.iri_for(&parts)?;
        if !self.box_exists(&inbox).await? {
            return Ok(Some(status_response(StatusCode::NOT_FOUND)));
        }
        if let Authentication::Halt(response) = self
            .inner
            .authenticate_get_inbox(&parts)
            .await
            .context(SideEffectsSnafu)?
        {
            return Ok(Some(response));
        }
        let page = federating
            .get_inbox(&parts, &inbox)
            .await
            .context(ApplicationSnafu)?;
        self.collection_response(page)
    }

    /// Handle a POST to an actor's outbox
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn post_outbox(&self, request: http::Request<Bytes>) -> Result<Option<Response<Bytes>>> {
        let (parts, body) = request.into_parts();
        if !is_protocol_post(&parts) {
            return Ok(None);
        }
        let Some(social) = self.inner.social().cloned() else {
            return Ok(Some(status_response(StatusCode::METHOD_NOT_ALLOWED)));
        };
        let outbox = self.iri_for(&parts)?;
        if !self.box_exists(&outbox).await? {
            return Ok(Some(status_response(StatusCode::NOT_FOUND)));
        }
        if let Authentication::Halt(response) = self
            .inner
            .authenticate_post_outbox(&parts)
            .await
            .context(SideEffectsSnafu)?
        {
            return Ok(Some(response));
        }

        let object = match Object::from_slice(&body) {
            Ok(object) => object,
            Err(err) => {
                debug!("Refusing an unparseable outbox post: {err}");
                return bad_request("Malformed JSON object");
            }
        };
        if !object.has_known_type() {
            debug!("Refusing an outbox post of type {:?}", object.types());
            return bad_request("Unrecognized object type");
        }
        let mut activity = if object.is_activity() {
            object
        } else {
            self.inner
                .wrap_in_create(&outbox, object)
                .await
                .context(SideEffectsSnafu)?
        };

        social
            .post_outbox_request_body_hook(&parts, &activity)
            .await
            .context(ApplicationSnafu)?;
        let deliverable = match self.inner.post_outbox(&outbox, &mut activity).await {
            Ok(deliverable) => deliverable,
            Err(err) => return side_effect_failure(err),
        };
        let id = activity.id().context(MissingIdSnafu)?;
        if deliverable && self.inner.federating().is_some() {
            self.inner
                .deliver(&outbox, activity)
                .await
                .context(SideEffectsSnafu)?;
        }
        outbox_posts.add(1, &[]);
        Response::builder()
            .status(StatusCode::CREATED)
            .header(LOCATION, id.as_str())
            .body(Bytes::new())
            .context(ResponseSnafu)
            .map(Some)
    }

    /// Handle a GET of an actor's outbox
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn get_outbox(&self, request: http::Request<Bytes>) -> Result<Option<Response<Bytes>>> {
        let (parts, _) = request.into_parts();
        if !is_protocol_get(&parts) {
            return Ok(None);
        }
        let outbox = self.iri_for(&parts)?;
        if !self.box_exists(&outbox).await? {
            return Ok(Some(status_response(StatusCode::NOT_FOUND)));
        }
        if let Authentication::Halt(response) = self
            .inner
            .authenticate_get_outbox(&parts)
            .await
            .context(SideEffectsSnafu)?
        {
            return Ok(Some(response));
        }
        let page = self
            .inner
            .common()
            .get_outbox(&parts, &outbox)
            .await
            .context(ApplicationSnafu)?;
        self.collection_response(page)
    }

    /// Serve any other object stored on this server
    ///
    /// Deleted objects are served as their Tombstones, with a 410. Hidden recipients are never
    /// served.
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn serve_object(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<Option<Response<Bytes>>> {
        let (parts, _) = request.into_parts();
        if !is_protocol_get(&parts) {
            return Ok(None);
        }
        let iri = self.iri_for(&parts)?;
        let db = self.inner.db();
        if !db.owns(&iri).await.context(StorageSnafu)? {
            return Ok(Some(status_response(StatusCode::NOT_FOUND)));
        }
        let mut object = {
            let _guard = db.lock(&iri).await.context(StorageSnafu)?;
            if !db.exists(&iri).await.context(StorageSnafu)? {
                return Ok(Some(status_response(StatusCode::NOT_FOUND)));
            }
            db.get(&iri).await.context(StorageSnafu)?
        };
        object.strip_hidden_recipients();
        let status = if object.is_tombstone() {
            StatusCode::GONE
        } else {
            StatusCode::OK
        };
        objects_served.add(1, &[KeyValue::new("status", status.as_u16().to_string())]);
        activity_response(status, &object, &self.inner.common().now())
            .context(HttpSnafu)
            .map(Some)
    }

    fn iri_for(&self, parts: &Parts) -> Result<Url> {
        let path = parts.uri.path();
        self.origin.join(path).context(IriSnafu { path })
    }
    async fn box_exists(&self, iri: &Url) -> Result<bool> {
        self.inner.db().exists(iri).await.context(StorageSnafu)
    }
    fn collection_response(&self, mut page: Object) -> Result<Option<Response<Bytes>>> {
        page.dedupe_ordered_items();
        activity_response(StatusCode::OK, &page, &self.inner.common().now())
            .context(HttpSnafu)
            .map(Some)
    }
}

fn bad_request(msg: impl Into<String>) -> Result<Option<Response<Bytes>>> {
    error_response(StatusCode::BAD_REQUEST, msg)
        .context(HttpSnafu)
        .map(Some)
}

fn reject(status: StatusCode, msg: impl Into<String>) -> Result<Option<Response<Bytes>>> {
    inbox_rejections.add(1, &[KeyValue::new("reason", status.as_u16().to_string())]);
    error_response(status, msg).context(HttpSnafu).map(Some)
}

/// Side effects fail either because the peer sent something unacceptable (in which case we tell
/// them so) or because of a problem on our end (in which case we don't)
fn side_effect_failure(err: side_effect_actor::Error) -> Result<Option<Response<Bytes>>> {
    match err.status() {
        Some(status) => {
            debug!("Refusing an activity: {err}");
            error_response(status, status.canonical_reason().unwrap_or("Refused"))
                .context(HttpSnafu)
                .map(Some)
        }
        None => Err(Error::SideEffects { source: err }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           axum glue                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Requests bodies beyond this size are refused
const MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    PostInbox,
    GetInbox,
    PostOutbox,
    GetOutbox,
    Object,
}

async fn dispatch(
    actor: &Actor,
    endpoint: Endpoint,
    request: axum::extract::Request,
) -> axum::response::Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(err) => {
            debug!("Refusing a request body: {err}");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorResponseBody {
                    error: "Request body too large".to_owned(),
                },
            )
                .into_response()
        }
    };
    let is_get = parts.method == Method::GET;
    let request = http::Request::from_parts(parts, body);
    let result = match endpoint {
        Endpoint::PostInbox => actor.post_inbox(request).await,
        Endpoint::GetInbox => actor.get_inbox(request).await,
        Endpoint::PostOutbox => actor.post_outbox(request).await,
        Endpoint::GetOutbox => actor.get_outbox(request).await,
        Endpoint::Object => actor.serve_object(request).await,
    };
    match result {
        Ok(Some(response)) => response.map(axum::body::Body::from).into_response(),
        Ok(None) if is_get => StatusCode::NOT_ACCEPTABLE.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("{endpoint:?} failed: {err:#?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponseBody {
                    error: "Internal server error".to_owned(),
                },
            )
                .into_response()
        }
    }
}

async fn post_inbox(
    State(actor): State<Actor>,
    request: axum::extract::Request,
) -> axum::response::Response {
    dispatch(&actor, Endpoint::PostInbox, request).await
}

async fn get_inbox(
    State(actor): State<Actor>,
    request: axum::extract::Request,
) -> axum::response::Response {
    dispatch(&actor, Endpoint::GetInbox, request).await
}

async fn post_outbox(
    State(actor): State<Actor>,
    request: axum::extract::Request,
) -> axum::response::Response {
    dispatch(&actor, Endpoint::PostOutbox, request).await
}

async fn get_outbox(
    State(actor): State<Actor>,
    request: axum::extract::Request,
) -> axum::response::Response {
    dispatch(&actor, Endpoint::GetOutbox, request).await
}

async fn serve_object(
    State(actor): State<Actor>,
    request: axum::extract::Request,
) -> axum::response::Response {
    dispatch(&actor, Endpoint::Object, request).await
}

/// Route `{prefix}/inbox` & `{prefix}/outbox` to `actor`, and everything else to
/// [Actor::serve_object]
///
/// `prefix` is an axum path pattern such as "/users/{username}".
pub fn make_router(actor: Actor, prefix: &str) -> Router {
    Router::new()
        .route(
            &format!("{prefix}/inbox"),
            get(get_inbox).post(post_inbox),
        )
        .route(
            &format!("{prefix}/outbox"),
            get(get_outbox).post(post_outbox),
        )
        .fallback(serve_object)
        .with_state(actor)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::{
        callbacks::Callbacks,
        memory::MemoryDatabase,
        protocol::{CommonBehavior, FederatingProtocol, SocialProtocol},
        storage::Database,
        transport::{fake::FakeTransport, Transport},
    };

    type ProtocolResult<T> = std::result::Result<T, protocol::Error>;

    struct App {
        db: Arc<MemoryDatabase>,
        transport: Arc<FakeTransport>,
        callbacks: Arc<Callbacks>,
    }

    #[async_trait]
    impl CommonBehavior for App {
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
    impl FederatingProtocol for App {
        async fn authenticate_post_inbox(
            &self,
            parts: &Parts,
            _: &[u8],
        ) -> ProtocolResult<Authentication> {
            Ok(if parts.headers.contains_key("x-deny") {
                Authentication::Halt(status_response(StatusCode::UNAUTHORIZED))
            } else {
                Authentication::Proceed
            })
        }
        async fn blocked(&self, _: &[Url]) -> ProtocolResult<bool> {
            Ok(false)
        }
        fn federating_callbacks(&self) -> Arc<Callbacks> {
            self.callbacks.clone()
        }
        fn max_inbox_forwarding_recursion_depth(&self) -> i64 {
            0
        }
        fn max_delivery_recursion_depth(&self) -> i64 {
            0
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
    impl SocialProtocol for App {
        async fn authenticate_post_outbox(&self, _: &Parts) -> ProtocolResult<Authentication> {
            Ok(Authentication::Proceed)
        }
        fn social_callbacks(&self) -> Arc<Callbacks> {
            self.callbacks.clone()
        }
    }

    fn setup(social: bool) -> (Arc<MemoryDatabase>, Arc<App>, Actor) {
        let origin = Url::parse("https://a.example").unwrap();
        let db = Arc::new(MemoryDatabase::new(&origin));
        db.add_actor("alice", None).unwrap();
        let app = Arc::new(App {
            db: db.clone(),
            transport: Arc::new(FakeTransport::new()),
            callbacks: Arc::new(Callbacks::default()),
        });
        let social: Option<Arc<dyn SocialProtocol>> = if social { Some(app.clone()) } else { None };
        let inner = SideEffectActor::new(db.clone(), app.clone(), Some(app.clone()), social);
        (db, app, Actor::new(origin, inner))
    }

    fn post(path: &str, body: serde_json::Value) -> http::Request<Bytes> {
        http::Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/activity+json")
            .body(Bytes::from(body.to_string()))
            .unwrap()
    }

    fn get(path: &str) -> http::Request<Bytes> {
        http::Request::builder()
            .method(Method::GET)
            .uri(path)
            .header("accept", "application/activity+json")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn inbox_posts() {
        let (db, _app, actor) = setup(true);
        let inbox = Url::parse("https://a.example/users/alice/inbox").unwrap();
        let like = json!({
            "type": "Like",
            "id": "https://b.example/likes/1",
            "actor": "https://b.example/users/bob",
            "object": "https://b.example/notes/1"
        });

        // Not ActivityPub: not ours to handle
        let html = http::Request::builder()
            .method(Method::POST)
            .uri("/users/alice/inbox")
            .header("content-type", "text/html")
            .body(Bytes::new())
            .unwrap();
        assert!(actor.post_inbox(html).await.unwrap().is_none());

        for _ in 0..2 {
            let rsp = actor
                .post_inbox(post("/users/alice/inbox", like.clone()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(rsp.status(), StatusCode::OK);
        }
        assert_eq!(db.get_inbox(&inbox).await.unwrap().items().len(), 1);

        for body in [
            json!({"type": "Frobnicate", "id": "https://b.example/f/1", "actor": "https://b.example/users/bob"}),
            json!({"type": "Note", "id": "https://b.example/notes/2"}),
            json!({"type": "Like", "actor": "https://b.example/users/bob"}),
            json!(["not", "an", "object"]),
        ] {
            let rsp = actor
                .post_inbox(post("/users/alice/inbox", body))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(db.get_inbox(&inbox).await.unwrap().items().len(), 1);

        // Shape errors in side effects are the peer's problem
        let rsp = actor
            .post_inbox(post(
                "/users/alice/inbox",
                json!({"type": "Create", "id": "https://b.example/c/1", "actor": "https://b.example/users/bob"}),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        let mut denied = post("/users/alice/inbox", like);
        denied.headers_mut().insert("x-deny", "1".parse().unwrap());
        let rsp = actor.post_inbox(denied).await.unwrap().unwrap();
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);

        let rsp = actor
            .post_inbox(post("/users/nobody/inbox", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn refusals_carry_no_detail() {
        let (_db, _app, actor) = setup(true);
        let error_of = |rsp: Response<Bytes>| {
            serde_json::from_slice::<serde_json::Value>(rsp.body()).unwrap()["error"]
                .as_str()
                .unwrap()
                .to_owned()
        };

        let mut garbage = post("/users/alice/inbox", json!({}));
        *garbage.body_mut() = Bytes::from_static(b"{\"type\": \"Like\", oops");
        let rsp = actor.post_inbox(garbage).await.unwrap().unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(rsp), "Malformed JSON object");

        let rsp = actor
            .post_inbox(post(
                "/users/alice/inbox",
                json!({"type": "Create", "id": "https://b.example/c/2", "actor": "https://b.example/users/bob"}),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        let error = error_of(rsp);
        assert_eq!(error, "Bad Request");
        assert!(!error.contains("object"));

        let rsp = actor
            .post_outbox(post("/users/alice/outbox", json!({"type": "Frobnicate"})))
            .await
            .unwrap()
            .unwrap();
        assert!(!error_of(rsp).contains("Frobnicate"));
    }

    #[tokio::test]
    async fn outbox_posts() {
        let (db, app, actor) = setup(true);
        app.transport.serve(
            &Object::from_value(json!({
                "type": "Person",
                "id": "https://b.example/users/bob",
                "inbox": "https://b.example/users/bob/inbox"
            }))
            .unwrap(),
        );

        let rsp = actor
            .post_outbox(post(
                "/users/alice/outbox",
                json!({"type": "Note", "content": "Hi", "to": ["https://b.example/users/bob"]}),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::CREATED);
        let location = Url::parse(rsp.headers()[LOCATION].to_str().unwrap()).unwrap();
        let create = db.get(&location).await.unwrap();
        assert!(create.has_type("Create"));
        let note = create.references("object")[0].as_inline().unwrap().clone();
        assert_eq!(
            note.iris("attributedTo"),
            vec![Url::parse("https://a.example/users/alice").unwrap()]
        );
        assert_eq!(
            app.transport.delivered_to(),
            vec![Url::parse("https://b.example/users/bob/inbox").unwrap()]
        );

        let rsp = actor
            .post_outbox(post("/users/alice/outbox", json!({"type": "Frobnicate"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        // The outbox serves the Create
        let rsp = actor.get_outbox(get("/users/alice/outbox")).await.unwrap().unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let page = Object::from_slice(rsp.body()).unwrap();
        assert!(page.contains_item(&location));
        assert!(rsp.headers().contains_key("digest"));

        let (_db, _app, actor) = setup(false);
        let rsp = actor
            .post_outbox(post("/users/alice/outbox", json!({"type": "Note"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn objects() {
        let (db, _app, actor) = setup(true);
        let router = make_router(actor, "/users/{username}");
        let note = Url::parse("https://a.example/objects/note").unwrap();
        db.create(
            &Object::from_value(json!({
                "type": "Note",
                "id": note.as_str(),
                "bcc": ["https://b.example/users/bob"]
            }))
            .unwrap(),
        )
        .await
        .unwrap();

        let rsp = router
            .clone()
            .oneshot(get("/objects/note").map(axum::body::Body::from))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(rsp.into_body(), MAX_BODY_SIZE)
            .await
            .unwrap();
        assert!(Object::from_slice(&body).unwrap().get("bcc").is_none());

        db.update(&Object::new("Note").tombstone(&note, &chrono::Utc::now()))
            .await
            .unwrap();
        let rsp = router
            .clone()
            .oneshot(get("/objects/note").map(axum::body::Body::from))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::GONE);

        let rsp = router
            .clone()
            .oneshot(get("/objects/missing").map(axum::body::Body::from))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

        let html = http::Request::builder()
            .uri("/objects/note")
            .header("accept", "text/html")
            .body(axum::body::Body::empty())
            .unwrap();
        let rsp = router.oneshot(html).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_ACCEPTABLE);
    }
}
