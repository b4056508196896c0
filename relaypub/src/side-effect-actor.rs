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

//! # The side-effect actor
//!
//! [Actor](crate::actor::Actor) deals in HTTP: recognizing protocol requests, parsing bodies,
//! choosing status codes. Everything that happens to storage & to peers as a *consequence* of a
//! request happens here, in [SideEffectActor]:
//!
//! - the inbox & outbox bookkeeping (including making inbox delivery idempotent)
//! - dispatching each activity to its side effects, be they relaypub's defaults or the
//!   application's callbacks
//! - inbox forwarding, per [section 7.1.2] of the ActivityPub recommendation
//! - delivery of outbound activities, either through a [DeliveryEngine] (which retries) or
//!   directly through the application's [Transport] (which doesn't)
//!
//! It holds no state of its own beyond handles to its collaborators, so it's cheap to clone and
//! may be shared freely across requests.
//!
//! [section 7.1.2]: https://www.w3.org/TR/activitypub/#inbox-forwarding

use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http::{request::Parts, StatusCode};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};
use url::Url;

use relaypub_shared::is_public;

use crate::{
    ap_entities::{self, normalize_recipients, Object, Reference},
    callbacks::{Callbacks, Resolution},
    delivery::{self, DeliveryEngine, SendFn},
    protocol::{self, Authentication, CommonBehavior, FederatingProtocol, SocialProtocol},
    recipients::{self, RecipientResolver},
    side_effects::{self, Context},
    storage::{self, Database},
    transport::{self, Transport},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Application authentication hook failed: {source}"))]
    Authentication { source: protocol::Error },
    #[snafu(display("Application callback for {kind} failed: {source}"))]
    Callback {
        kind: String,
        source: protocol::Error,
    },
    #[snafu(display("Delivery failed: {source}"))]
    Delivery { source: transport::Error },
    #[snafu(display("Failed to enqueue a delivery: {source}"))]
    Enqueue { source: delivery::Error },
    #[snafu(display("Application hook failed: {source}"))]
    Hook { source: protocol::Error },
    #[snafu(display("The activity has no id"))]
    MissingId { backtrace: snafu::Backtrace },
    #[snafu(display("Failed to obtain a transport: {source}"))]
    NewTransport { source: protocol::Error },
    #[snafu(display("The federating protocol is not enabled"))]
    NotFederating { backtrace: snafu::Backtrace },
    #[snafu(display("The social protocol is not enabled"))]
    NotSocial { backtrace: snafu::Backtrace },
    #[snafu(display("Recipient resolution failed: {source}"))]
    Recipients { source: recipients::Error },
    #[snafu(display("Failed to serialize an activity: {source}"))]
    Serialize { source: ap_entities::Error },
    #[snafu(display("{source}"))]
    SideEffect { source: side_effects::Error },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

impl Error {
    /// The status with which to reply to the peer, for errors that are the peer's fault
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::SideEffect { source } => source.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        SideEffectActor                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Properties along which inbox forwarding looks for objects we own
const FORWARDING_PROPERTIES: [&str; 4] = ["inReplyTo", "object", "target", "tag"];

#[derive(Clone)]
pub struct SideEffectActor {
    db: Arc<dyn Database>,
    common: Arc<dyn CommonBehavior>,
    federating: Option<Arc<dyn FederatingProtocol>>,
    social: Option<Arc<dyn SocialProtocol>>,
    engine: Option<DeliveryEngine>,
}

impl SideEffectActor {
    /// Supply `None` for a sub-protocol the application does not speak
    pub fn new(
        db: Arc<dyn Database>,
        common: Arc<dyn CommonBehavior>,
        federating: Option<Arc<dyn FederatingProtocol>>,
        social: Option<Arc<dyn SocialProtocol>>,
    ) -> SideEffectActor {
        SideEffectActor {
            db,
            common,
            federating,
            social,
            engine: None,
        }
    }
    /// Route deliveries through `engine` rather than straight to the transport
    pub fn with_delivery_engine(mut self, engine: DeliveryEngine) -> SideEffectActor {
        self.engine = Some(engine);
        self
    }
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }
    pub fn common(&self) -> &Arc<dyn CommonBehavior> {
        &self.common
    }
    pub fn federating(&self) -> Option<&Arc<dyn FederatingProtocol>> {
        self.federating.as_ref()
    }
    pub fn social(&self) -> Option<&Arc<dyn SocialProtocol>> {
        self.social.as_ref()
    }
    fn federating_protocol(&self) -> Result<&Arc<dyn FederatingProtocol>> {
        self.federating.as_ref().context(NotFederatingSnafu)
    }
    fn social_protocol(&self) -> Result<&Arc<dyn SocialProtocol>> {
        self.social.as_ref().context(NotSocialSnafu)
    }
    fn context<'a>(&'a self, box_iri: &'a Url) -> Context<'a> {
        Context {
            db: self.db.as_ref(),
            common: self.common.as_ref(),
            box_iri,
        }
    }

    pub async fn authenticate_post_inbox(
        &self,
        request: &Parts,
        body: &[u8],
    ) -> Result<Authentication> {
        self.federating_protocol()?
            .authenticate_post_inbox(request, body)
            .await
            .context(AuthenticationSnafu)
    }
    pub async fn authenticate_get_inbox(&self, request: &Parts) -> Result<Authentication> {
        self.common
            .authenticate_get_inbox(request)
            .await
            .context(AuthenticationSnafu)
    }
    pub async fn authenticate_post_outbox(&self, request: &Parts) -> Result<Authentication> {
        self.social_protocol()?
            .authenticate_post_outbox(request)
            .await
            .context(AuthenticationSnafu)
    }
    pub async fn authenticate_get_outbox(&self, request: &Parts) -> Result<Authentication> {
        self.common
            .authenticate_get_outbox(request)
            .await
            .context(AuthenticationSnafu)
    }

    /// Return true if none of `activity`'s actors is blocked
    ///
    /// An activity with no actors is never authorized.
    pub async fn authorize_post_inbox(&self, activity: &Object) -> Result<bool> {
        let actors = activity.iris("actor");
        if actors.is_empty() {
            debug!("Activity {:?} has no actors", activity.id());
            return Ok(false);
        }
        let blocked = self
            .federating_protocol()?
            .blocked(&actors)
            .await
            .context(HookSnafu)?;
        Ok(!blocked)
    }

    /// Record `activity` in `inbox` & apply its side effects
    ///
    /// An activity already present in the inbox is ignored, so that a peer re-delivering it can't
    /// cause its side effects to be applied twice.
    #[tracing::instrument(skip(self, activity), fields(id = ?activity.id()))]
    pub async fn post_inbox(&self, inbox: &Url, activity: &Object) -> Result<()> {
        let id = activity.id().context(MissingIdSnafu)?;
        {
            let _guard = self.db.lock(inbox).await.context(StorageSnafu)?;
            if self
                .db
                .inbox_contains(inbox, &id)
                .await
                .context(StorageSnafu)?
            {
                debug!("{id} has already been received");
                return Ok(());
            }
            let mut page = self.db.get_inbox(inbox).await.context(StorageSnafu)?;
            page.prepend_item(Reference::Iri(id));
            self.db.set_inbox(&page).await.context(StorageSnafu)?;
        }
        self.dispatch_federating(inbox, activity).await
    }

    async fn dispatch_federating(&self, inbox: &Url, activity: &Object) -> Result<()> {
        let federating = self.federating_protocol()?;
        let callbacks = federating.federating_callbacks();
        let kind = activity.kind();
        let resolution = match &kind {
            Some(kind) => callbacks.resolve(kind),
            None => Resolution::Fallback,
        };
        let name = kind.map(|k| k.to_string()).unwrap_or_default();
        debug!("Resolved inbound {name} to {resolution:?}");
        match resolution {
            Resolution::Custom(hook) => hook(activity.clone())
                .await
                .context(CallbackSnafu { kind: name })?,
            Resolution::OverriddenDefault(hook) => {
                self.federating_default(inbox, activity, &callbacks)
                    .await?;
                hook(activity.clone())
                    .await
                    .context(CallbackSnafu { kind: name })?
            }
            Resolution::Default => {
                self.federating_default(inbox, activity, &callbacks)
                    .await?
            }
            Resolution::Fallback => federating
                .default_callback(activity)
                .await
                .context(HookSnafu)?,
        }
        Ok(())
    }

    async fn federating_default(
        &self,
        inbox: &Url,
        activity: &Object,
        callbacks: &Callbacks,
    ) -> Result<()> {
        let reply = side_effects::federating(&self.context(inbox), activity, callbacks.on_follow())
            .await
            .context(SideEffectSnafu)?;
        if let Some(reply) = reply {
            let outbox = self
                .db
                .outbox_for_inbox(inbox)
                .await
                .context(StorageSnafu)?;
            self.deliver(&outbox, reply).await?;
        }
        Ok(())
    }

    /// Assign ids, apply side effects, & record `activity` in `outbox`
    ///
    /// Returns false if `activity` should not be delivered.
    #[tracing::instrument(skip(self, activity))]
    pub async fn post_outbox(&self, outbox: &Url, activity: &mut Object) -> Result<bool> {
        self.add_new_ids(activity).await?;
        let deliverable = self.dispatch_social(outbox, activity).await?;

        let id = activity.id().context(MissingIdSnafu)?;
        {
            let _guard = self.db.lock(&id).await.context(StorageSnafu)?;
            self.db.create(activity).await.context(StorageSnafu)?;
        }
        {
            let _guard = self.db.lock(outbox).await.context(StorageSnafu)?;
            let mut page = self.db.get_outbox(outbox).await.context(StorageSnafu)?;
            page.prepend_item(Reference::Iri(id.clone()));
            self.db.set_outbox(&page).await.context(StorageSnafu)?;
        }
        debug!("Posted {id} to {outbox}; deliverable: {deliverable}");
        Ok(deliverable)
    }

    async fn dispatch_social(&self, outbox: &Url, activity: &mut Object) -> Result<bool> {
        let social = self.social_protocol()?;
        let callbacks = social.social_callbacks();
        let kind = activity.kind();
        let resolution = match &kind {
            Some(kind) => callbacks.resolve(kind),
            None => Resolution::Fallback,
        };
        let name = kind.map(|k| k.to_string()).unwrap_or_default();
        debug!("Resolved outbound {name} to {resolution:?}");
        let deliverable = match resolution {
            Resolution::Custom(hook) => {
                hook(activity.clone())
                    .await
                    .context(CallbackSnafu { kind: name })?;
                true
            }
            Resolution::OverriddenDefault(hook) => {
                let deliverable = side_effects::social(&self.context(outbox), activity)
                    .await
                    .context(SideEffectSnafu)?;
                hook(activity.clone())
                    .await
                    .context(CallbackSnafu { kind: name })?;
                deliverable
            }
            Resolution::Default => side_effects::social(&self.context(outbox), activity)
                .await
                .context(SideEffectSnafu)?,
            Resolution::Fallback => {
                social.default_callback(activity).await.context(HookSnafu)?;
                true
            }
        };
        Ok(deliverable)
    }

    /// Give `activity` a fresh id, along with its inline objects if it's a Create
    pub async fn add_new_ids(&self, activity: &mut Object) -> Result<()> {
        let id = self.db.new_id(activity).await.context(StorageSnafu)?;
        activity.set_id(&id);
        if activity.has_type("Create") {
            let mut objects = Vec::new();
            for reference in activity.references("object") {
                objects.push(match reference {
                    Reference::Inline(mut object) => {
                        let id = self.db.new_id(&object).await.context(StorageSnafu)?;
                        object.set_id(&id);
                        Reference::Inline(object)
                    }
                    reference => reference,
                });
            }
            activity.set_references("object", &objects);
        }
        Ok(())
    }

    /// Wrap a bare object posted to `outbox` in a Create
    pub async fn wrap_in_create(&self, outbox: &Url, mut object: Object) -> Result<Object> {
        let actor = self
            .db
            .actor_for_outbox(outbox)
            .await
            .context(StorageSnafu)?;
        let mut create = Object::new("Create");
        create.set("actor", json!(actor.as_str()));
        normalize_recipients(&mut create, &mut object);
        create.set_references("object", &[Reference::Inline(object)]);
        Ok(create)
    }

    /// Forward `activity`, just received at `inbox`, to the members of any of our collections to
    /// which it's addressed
    ///
    /// This only happens the first time we see the activity, and only if it references something
    /// we own (so that, e.g., replies to our actors' posts reach their followers). If forwarding
    /// fails, the activity is forgotten again, so that the peer's retry will forward it.
    #[tracing::instrument(skip(self, activity), fields(id = ?activity.id()))]
    pub async fn inbox_forwarding(&self, inbox: &Url, activity: &Object) -> Result<()> {
        let id = activity.id().context(MissingIdSnafu)?;
        {
            let _guard = self.db.lock(&id).await.context(StorageSnafu)?;
            if self.db.exists(&id).await.context(StorageSnafu)? {
                debug!("{id} has been seen before; not forwarding");
                return Ok(());
            }
            self.db.create(activity).await.context(StorageSnafu)?;
        }

        let result = self.forward(inbox, &id, activity).await;
        if let Err(err) = &result {
            warn!("Failed to forward {id} ({err}); forgetting it");
            let _guard = self.db.lock(&id).await.context(StorageSnafu)?;
            self.db.delete(&id).await.context(StorageSnafu)?;
        }
        result
    }

    async fn forward(&self, inbox: &Url, id: &Url, activity: &Object) -> Result<()> {
        let federating = self.federating_protocol()?;
        let mut collections = Vec::new();
        for iri in ["to", "cc", "audience"]
            .iter()
            .flat_map(|prop| activity.iris(prop))
        {
            if is_public(iri.as_str()) || !self.db.owns(&iri).await.context(StorageSnafu)? {
                continue;
            }
            let _guard = self.db.lock(&iri).await.context(StorageSnafu)?;
            if !self.db.exists(&iri).await.context(StorageSnafu)? {
                continue;
            }
            let object = self.db.get(&iri).await.context(StorageSnafu)?;
            if object.is_collection() {
                collections.push(object);
            }
        }
        if collections.is_empty() {
            return Ok(());
        }

        let transport = self
            .common
            .new_transport(inbox)
            .await
            .context(NewTransportSnafu)?;
        let mut visited = HashSet::new();
        if !self
            .references_owned(
                &transport,
                activity.clone(),
                0,
                federating.max_inbox_forwarding_recursion_depth(),
                &mut visited,
            )
            .await?
        {
            debug!("{id} references nothing of ours; not forwarding");
            return Ok(());
        }

        let members = collections
            .iter()
            .flat_map(|c| c.items())
            .filter_map(|r| r.iri())
            .collect::<Vec<Url>>();
        let recipients = federating
            .filter_forwarding(members, activity)
            .await
            .context(HookSnafu)?;
        if recipients.is_empty() {
            return Ok(());
        }
        let resolver = RecipientResolver::new(
            self.db.clone(),
            transport.clone(),
            federating.max_delivery_recursion_depth(),
        );
        let mut seen = HashSet::new();
        let inboxes = resolver
            .resolve_inboxes(recipients.into_iter().map(Reference::Iri).collect())
            .await
            .context(RecipientsSnafu)?
            .into_iter()
            .filter(|inbox| seen.insert(inbox.to_string()))
            .collect::<Vec<Url>>();
        info!("Forwarding {id} to {} inboxes", inboxes.len());
        let payload = activity.to_bytes().context(SerializeSnafu)?;
        self.send(transport, payload, inboxes).await
    }

    /// Return true if `object` references anything we own, through its forwarding properties
    fn references_owned<'a>(
        &'a self,
        transport: &'a Arc<dyn Transport>,
        object: Object,
        depth: i64,
        max_depth: i64,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            if max_depth > 0 && depth > max_depth {
                return Ok(false);
            }
            let references = FORWARDING_PROPERTIES
                .iter()
                .flat_map(|prop| object.references(prop))
                .collect::<Vec<Reference>>();
            for reference in references {
                if let Some(iri) = reference.iri() {
                    if !visited.insert(iri.to_string()) {
                        continue;
                    }
                    if self.db.owns(&iri).await.context(StorageSnafu)? {
                        return Ok(true);
                    }
                }
                let next = match reference {
                    Reference::Inline(object) => object,
                    Reference::Iri(iri) => match transport.dereference(&iri).await {
                        Ok(body) => match Object::from_slice(&body) {
                            Ok(object) => object,
                            Err(err) => {
                                debug!("{iri} is not an object ({err}); skipping");
                                continue;
                            }
                        },
                        Err(err) => {
                            debug!("Couldn't dereference {iri} ({err}); skipping");
                            continue;
                        }
                    },
                };
                if self
                    .references_owned(transport, next, depth + 1, max_depth, visited)
                    .await?
                {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        .boxed()
    }

    /// Deliver `activity` to everyone to whom it's addressed, on behalf of the owner of `outbox`
    #[tracing::instrument(skip(self, activity), fields(id = ?activity.id()))]
    pub async fn deliver(&self, outbox: &Url, mut activity: Object) -> Result<()> {
        let federating = self.federating_protocol()?;
        let transport = self
            .common
            .new_transport(outbox)
            .await
            .context(NewTransportSnafu)?;
        let resolver = RecipientResolver::new(
            self.db.clone(),
            transport.clone(),
            federating.max_delivery_recursion_depth(),
        );
        let recipients = resolver
            .prepare(&mut activity)
            .await
            .context(RecipientsSnafu)?;
        let payload = activity.to_bytes().context(SerializeSnafu)?;
        self.send(transport, payload, recipients).await
    }

    async fn send(
        &self,
        transport: Arc<dyn Transport>,
        payload: Bytes,
        recipients: Vec<Url>,
    ) -> Result<()> {
        if recipients.is_empty() {
            debug!("No recipients");
            return Ok(());
        }
        match &self.engine {
            Some(engine) => {
                let send_fn: SendFn = Arc::new(move |payload: Bytes, to: Url| {
                    let transport = transport.clone();
                    async move { transport.deliver(payload, &to).await }.boxed()
                });
                for to in recipients {
                    engine
                        .enqueue(payload.clone(), to, send_fn.clone())
                        .await
                        .context(EnqueueSnafu)?;
                }
                Ok(())
            }
            None => transport
                .batch_deliver(payload, &recipients)
                .await
                .context(DeliverySnafu),
        }
    }
}

impl std::fmt::Debug for SideEffectActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffectActor")
            .field("federating", &self.federating.is_some())
            .field("social", &self.social.is_some())
            .field("engine", &self.engine.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::{
        ap_entities::ActivityKind,
        callbacks::{Callback, OnFollow},
        memory::MemoryDatabase,
        transport::fake::FakeTransport,
    };

    type ProtocolResult<T> = std::result::Result<T, protocol::Error>;

    struct App {
        transport: Arc<FakeTransport>,
        blocked: Vec<Url>,
        callbacks: Arc<Callbacks>,
        fallbacks: AtomicUsize,
    }

    #[async_trait]
    impl CommonBehavior for App {
        async fn authenticate_get_inbox(&self, _: &Parts) -> ProtocolResult<Authentication> {
            Ok(Authentication::Proceed)
        }
        async fn authenticate_get_outbox(&self, _: &Parts) -> ProtocolResult<Authentication> {
            Ok(Authentication::Proceed)
        }
        async fn get_outbox(&self, _: &Parts, _: &Url) -> ProtocolResult<Object> {
            Ok(Object::collection("OrderedCollection", None))
        }
        async fn new_transport(&self, _: &Url) -> ProtocolResult<Arc<dyn Transport>> {
            Ok(self.transport.clone())
        }
    }

    #[async_trait]
    impl FederatingProtocol for App {
        async fn authenticate_post_inbox(
            &self,
            _: &Parts,
            _: &[u8],
        ) -> ProtocolResult<Authentication> {
            Ok(Authentication::Proceed)
        }
        async fn blocked(&self, actors: &[Url]) -> ProtocolResult<bool> {
            Ok(actors.iter().any(|a| self.blocked.contains(a)))
        }
        fn federating_callbacks(&self) -> Arc<Callbacks> {
            self.callbacks.clone()
        }
        async fn default_callback(&self, _: &Object) -> ProtocolResult<()> {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
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
        async fn get_inbox(&self, _: &Parts, _: &Url) -> ProtocolResult<Object> {
            Ok(Object::collection("OrderedCollection", None))
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

    struct Fixture {
        db: Arc<MemoryDatabase>,
        app: Arc<App>,
        alice: Object,
        actor: SideEffectActor,
        likes: Arc<AtomicUsize>,
    }

    fn fixture(on_follow: OnFollow) -> Fixture {
        let db = Arc::new(MemoryDatabase::new(&Url::parse("https://a.example").unwrap()));
        let alice = db.add_actor("alice", None).unwrap();
        let likes = Arc::new(AtomicUsize::new(0));
        let counter = likes.clone();
        let callbacks = Callbacks::new(
            vec![Callback::Wrapped(
                ActivityKind::Like,
                Arc::new(move |_: Object| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), protocol::Error>(()) }.boxed()
                }),
            )],
            on_follow,
        )
        .unwrap();
        let app = Arc::new(App {
            transport: Arc::new(FakeTransport::new()),
            blocked: vec![Url::parse("https://evil.example/users/mallory").unwrap()],
            callbacks: Arc::new(callbacks),
            fallbacks: AtomicUsize::new(0),
        });
        let actor = SideEffectActor::new(
            db.clone(),
            app.clone(),
            Some(app.clone()),
            Some(app.clone()),
        );
        Fixture {
            db,
            app,
            alice,
            actor,
            likes,
        }
    }

    fn object(value: serde_json::Value) -> Object {
        Object::from_value(value).unwrap()
    }

    fn serve_remote_actor(transport: &FakeTransport, id: &str) {
        transport.serve(&object(json!({
            "type": "Person",
            "id": id,
            "inbox": format!("{id}/inbox")
        })));
    }

    #[tokio::test]
    async fn inbox_delivery_is_idempotent() {
        let f = fixture(OnFollow::DoNothing);
        let inbox = f.alice.iri("inbox").unwrap();
        let note = Url::parse("https://a.example/objects/note").unwrap();
        f.db.create(&object(json!({"type": "Note", "id": note.as_str()})))
            .await
            .unwrap();
        let like = object(json!({
            "type": "Like",
            "id": "https://b.example/likes/1",
            "actor": "https://b.example/users/bob",
            "object": note.as_str()
        }));

        f.actor.post_inbox(&inbox, &like).await.unwrap();
        f.actor.post_inbox(&inbox, &like).await.unwrap();

        assert_eq!(f.db.get_inbox(&inbox).await.unwrap().items().len(), 1);
        assert_eq!(f.likes.load(Ordering::SeqCst), 1);

        // Unknown types fall through to the application
        let listen = object(json!({
            "type": "Listen",
            "id": "https://b.example/listens/1",
            "actor": "https://b.example/users/bob",
            "object": "https://b.example/songs/1"
        }));
        f.actor.post_inbox(&inbox, &listen).await.unwrap();
        assert_eq!(f.app.fallbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorization() {
        let f = fixture(OnFollow::DoNothing);
        let by = |actor: serde_json::Value| {
            object(json!({"type": "Like", "id": "https://x.example/1", "actor": actor}))
        };
        assert!(f
            .actor
            .authorize_post_inbox(&by(json!("https://b.example/users/bob")))
            .await
            .unwrap());
        assert!(!f
            .actor
            .authorize_post_inbox(&by(json!([
                "https://b.example/users/bob",
                {"type": "Person", "id": "https://evil.example/users/mallory"}
            ])))
            .await
            .unwrap());
        assert!(!f
            .actor
            .authorize_post_inbox(&object(json!({"type": "Like", "id": "https://x.example/2"})))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn outbox_posts() {
        let f = fixture(OnFollow::DoNothing);
        let outbox = f.alice.iri("outbox").unwrap();
        let alice = f.alice.id().unwrap();
        serve_remote_actor(&f.app.transport, "https://b.example/users/bob");

        let note = object(json!({
            "type": "Note",
            "content": "Hello, world",
            "to": ["https://b.example/users/bob"],
            "bcc": ["https://b.example/users/bob"]
        }));
        let mut create = f.actor.wrap_in_create(&outbox, note).await.unwrap();
        assert_eq!(create.iris("actor"), vec![alice.clone()]);
        assert_eq!(create.iris("to"), vec![Url::parse("https://b.example/users/bob").unwrap()]);

        assert!(f.actor.post_outbox(&outbox, &mut create).await.unwrap());
        let id = create.id().unwrap();
        assert!(f.db.owns(&id).await.unwrap());
        let note = create.references("object")[0].as_inline().unwrap().clone();
        assert!(f.db.owns(&note.id().unwrap()).await.unwrap());
        assert_eq!(note.iris("attributedTo"), vec![alice.clone()]);
        assert_eq!(
            f.db.get_outbox(&outbox).await.unwrap().items()[0].iri(),
            Some(id.clone())
        );

        f.actor.deliver(&outbox, create).await.unwrap();
        let delivered = f.app.transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].0,
            Url::parse("https://b.example/users/bob/inbox").unwrap()
        );
        let sent = Object::from_slice(&delivered[0].1).unwrap();
        assert!(sent.get("bcc").is_none());
        assert!(sent.get("@context").is_some());

        let mut block = object(json!({
            "type": "Block",
            "actor": alice.as_str(),
            "object": "https://b.example/users/bob",
            "to": ["https://b.example/users/bob"]
        }));
        assert!(!f.actor.post_outbox(&outbox, &mut block).await.unwrap());
        assert!(f.db.exists(&block.id().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn follows_are_answered() {
        let f = fixture(OnFollow::AutomaticallyAccept);
        let inbox = f.alice.iri("inbox").unwrap();
        serve_remote_actor(&f.app.transport, "https://b.example/users/bob");
        let follow = object(json!({
            "type": "Follow",
            "id": "https://b.example/follows/1",
            "actor": "https://b.example/users/bob",
            "object": f.alice.id().unwrap().as_str()
        }));
        f.actor.post_inbox(&inbox, &follow).await.unwrap();
        let delivered = f.app.transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].0,
            Url::parse("https://b.example/users/bob/inbox").unwrap()
        );
        assert!(Object::from_slice(&delivered[0].1)
            .unwrap()
            .has_type("Accept"));
    }

    #[tokio::test]
    async fn replies_are_forwarded_once() {
        let f = fixture(OnFollow::DoNothing);
        let inbox = f.alice.iri("inbox").unwrap();
        let followers = f.alice.iri("followers").unwrap();
        serve_remote_actor(&f.app.transport, "https://c.example/users/carol");
        f.db
            .update(&{
                let mut collection = f.db.get(&followers).await.unwrap();
                collection.append_item(Reference::Iri(
                    Url::parse("https://c.example/users/carol").unwrap(),
                ));
                collection
            })
            .await
            .unwrap();
        let note = Url::parse("https://a.example/objects/note").unwrap();
        f.db.create(&object(json!({"type": "Note", "id": note.as_str()})))
            .await
            .unwrap();

        let reply = object(json!({
            "type": "Create",
            "id": "https://b.example/activities/reply",
            "actor": "https://b.example/users/bob",
            "cc": [followers.as_str()],
            "object": {
                "type": "Note",
                "id": "https://b.example/notes/reply",
                "inReplyTo": note.as_str()
            }
        }));
        f.actor.inbox_forwarding(&inbox, &reply).await.unwrap();
        assert_eq!(
            f.app.transport.delivered_to(),
            vec![Url::parse("https://c.example/users/carol/inbox").unwrap()]
        );
        f.actor.inbox_forwarding(&inbox, &reply).await.unwrap();
        assert_eq!(f.app.transport.delivered_to().len(), 1);

        // Nothing of ours is referenced, so nothing is forwarded
        let unrelated = object(json!({
            "type": "Create",
            "id": "https://b.example/activities/unrelated",
            "actor": "https://b.example/users/bob",
            "cc": [followers.as_str()],
            "object": {"type": "Note", "id": "https://b.example/notes/unrelated"}
        }));
        f.actor.inbox_forwarding(&inbox, &unrelated).await.unwrap();
        assert_eq!(f.app.transport.delivered_to().len(), 1);
    }

    #[tokio::test]
    async fn failed_forwards_are_retried() {
        let f = fixture(OnFollow::DoNothing);
        let inbox = f.alice.iri("inbox").unwrap();
        let followers = f.alice.iri("followers").unwrap();
        // carol can't be dereferenced (yet)
        f.db
            .update(&{
                let mut collection = f.db.get(&followers).await.unwrap();
                collection.append_item(Reference::Iri(
                    Url::parse("https://c.example/users/carol").unwrap(),
                ));
                collection
            })
            .await
            .unwrap();
        let note = Url::parse("https://a.example/objects/note").unwrap();
        f.db.create(&object(json!({"type": "Note", "id": note.as_str()})))
            .await
            .unwrap();
        let reply = object(json!({
            "type": "Create",
            "id": "https://b.example/activities/reply",
            "actor": "https://b.example/users/bob",
            "cc": [followers.as_str()],
            "object": {
                "type": "Note",
                "id": "https://b.example/notes/reply",
                "inReplyTo": note.as_str()
            }
        }));

        assert!(f.actor.inbox_forwarding(&inbox, &reply).await.is_err());
        assert!(!f.db.exists(&reply.id().unwrap()).await.unwrap());
        assert!(f.app.transport.delivered_to().is_empty());

        // The peer tries again, & this time carol's reachable
        serve_remote_actor(&f.app.transport, "https://c.example/users/carol");
        f.actor.inbox_forwarding(&inbox, &reply).await.unwrap();
        assert_eq!(
            f.app.transport.delivered_to(),
            vec![Url::parse("https://c.example/users/carol/inbox").unwrap()]
        );
        assert!(f.db.exists(&reply.id().unwrap()).await.unwrap());
    }
}
