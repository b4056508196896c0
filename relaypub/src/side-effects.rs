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

//! # Default side effects
//!
//! The behaviour ActivityPub prescribes for each of the twelve activity types relaypub knows
//! about, once for activities arriving in an inbox ([federating]) and once for activities posted
//! to an outbox ([social]).
//!
//! Each default takes the storage locks it needs around the reads & writes it makes, and no
//! others. In particular nothing is held across a call to [federating] or [social].

use std::collections::HashSet;

use http::StatusCode;
use serde_json::json;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::debug;
use url::Url;

use crate::{
    ap_entities::{self, normalize_recipients, ActivityKind, Object, Reference},
    callbacks::OnFollow,
    protocol::{self, CommonBehavior},
    storage::{self, Database, LockGuard},
    transport,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Application hook failed: {source}"))]
    Application { source: protocol::Error },
    #[snafu(display("Failed to dereference {iri}: {source}"))]
    Dereference { iri: Url, source: transport::Error },
    #[snafu(display("{iri} did not name a JSON object: {source}"))]
    Document {
        iri: Url,
        source: ap_entities::Error,
    },
    #[snafu(display("An object lacks an id"))]
    MissingId { backtrace: Backtrace },
    #[snafu(display("{iri} is not owned by this server"))]
    NotOwned { iri: Url, backtrace: Backtrace },
    #[snafu(display("The activity's objects must be inline"))]
    ObjectNotInline { backtrace: Backtrace },
    #[snafu(display("The activity has no object"))]
    ObjectRequired { backtrace: Backtrace },
    #[snafu(display("{iri} may not be modified by an activity from another origin"))]
    OriginMismatch { iri: Url, backtrace: Backtrace },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("The activity has no target"))]
    TargetRequired { backtrace: Backtrace },
    #[snafu(display("The Undo's actors did not perform the activity being undone"))]
    UndoNotAuthorized { backtrace: Backtrace },
}

impl Error {
    /// The HTTP status with which to reply when this error results from a peer's request, if any;
    /// `None` means "this is our problem"
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::MissingId { .. }
            | Error::ObjectNotInline { .. }
            | Error::ObjectRequired { .. }
            | Error::TargetRequired { .. } => Some(StatusCode::BAD_REQUEST),
            Error::OriginMismatch { .. } | Error::UndoNotAuthorized { .. } => {
                Some(StatusCode::FORBIDDEN)
            }
            Error::NotOwned { .. } => Some(StatusCode::NOT_FOUND),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Context                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything a default side effect may touch
pub struct Context<'a> {
    pub db: &'a dyn Database,
    pub common: &'a dyn CommonBehavior,
    /// The inbox (for [federating]) or outbox (for [social]) on which the activity arrived
    pub box_iri: &'a Url,
}

impl Context<'_> {
    async fn lock(&self, iri: &Url) -> Result<LockGuard> {
        self.db.lock(iri).await.context(StorageSnafu)
    }
    async fn owns(&self, iri: &Url) -> Result<bool> {
        self.db.owns(iri).await.context(StorageSnafu)
    }
    /// Retrieve `iri` from storage if it's there
    async fn stored(&self, iri: &Url) -> Result<Option<Object>> {
        let _guard = self.lock(iri).await?;
        if self.db.exists(iri).await.context(StorageSnafu)? {
            Ok(Some(self.db.get(iri).await.context(StorageSnafu)?))
        } else {
            Ok(None)
        }
    }
    /// Retrieve `iri` from storage if we own it, from its owner otherwise
    async fn fetch(&self, iri: &Url) -> Result<Object> {
        if self.owns(iri).await? {
            let _guard = self.lock(iri).await?;
            return self.db.get(iri).await.context(StorageSnafu);
        }
        let body = self
            .common
            .new_transport(self.box_iri)
            .await
            .context(ApplicationSnafu)?
            .dereference(iri)
            .await
            .context(DereferenceSnafu { iri: iri.clone() })?;
        Object::from_slice(&body).context(DocumentSnafu { iri: iri.clone() })
    }
    async fn create(&self, object: &Object) -> Result<()> {
        let id = object.id().context(MissingIdSnafu)?;
        let _guard = self.lock(&id).await?;
        self.db.create(object).await.context(StorageSnafu)
    }
    /// Read-modify-write the collection at `iri`
    async fn update_collection<F>(&self, iri: &Url, f: F) -> Result<()>
    where
        F: FnOnce(&mut Object) + Send,
    {
        let _guard = self.lock(iri).await?;
        let mut collection = self.db.get(iri).await.context(StorageSnafu)?;
        f(&mut collection);
        self.db.update(&collection).await.context(StorageSnafu)
    }
    /// Add `items` to the collection held in `property` on the (owned) object `iri`, creating the
    /// collection inline if the object has none
    async fn add_to_object_collection(
        &self,
        iri: &Url,
        property: &str,
        items: &[Url],
    ) -> Result<()> {
        let guard = self.lock(iri).await?;
        if !self.db.exists(iri).await.context(StorageSnafu)? {
            return Ok(());
        }
        let mut object = self.db.get(iri).await.context(StorageSnafu)?;
        let mut collection = match object.references(property).into_iter().next() {
            Some(Reference::Iri(collection)) => {
                drop(guard);
                if self.owns(&collection).await? {
                    self.update_collection(&collection, |c| append_all(c, items))
                        .await?;
                }
                return Ok(());
            }
            Some(Reference::Inline(collection)) => collection,
            None => Object::collection("OrderedCollection", None),
        };
        append_all(&mut collection, items);
        object.set(property, collection.into_value());
        self.db.update(&object).await.context(StorageSnafu)
    }
}

fn append_all(collection: &mut Object, items: &[Url]) {
    for item in items {
        collection.append_item(Reference::Iri(item.clone()));
    }
}

fn required_objects(activity: &Object) -> Result<Vec<Reference>> {
    let objects = activity.references("object");
    ensure!(!objects.is_empty(), ObjectRequiredSnafu);
    Ok(objects)
}

fn object_iris(objects: &[Reference]) -> Result<Vec<Url>> {
    objects
        .iter()
        .map(|r| r.iri().context(MissingIdSnafu))
        .collect()
}

fn inline_objects(objects: Vec<Reference>) -> Result<Vec<Object>> {
    objects
        .into_iter()
        .map(|r| match r {
            Reference::Inline(object) => Ok(object),
            Reference::Iri(_) => ObjectNotInlineSnafu.fail(),
        })
        .collect()
}

/// Objects may only be modified by activities originating on the same host
fn check_origin(activity: &Object, iri: &Url) -> Result<()> {
    let activity_host = activity.id().and_then(|id| id.host_str().map(str::to_owned));
    ensure!(
        activity_host.is_some() && activity_host.as_deref() == iri.host_str(),
        OriginMismatchSnafu { iri: iri.clone() }
    );
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     shared by both protocols                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn add(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    change_targets(ctx, activity, true).await
}

async fn remove(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    change_targets(ctx, activity, false).await
}

/// Add or remove the activity's objects to or from each owned collection among its targets
async fn change_targets(ctx: &Context<'_>, activity: &Object, adding: bool) -> Result<()> {
    let objects = object_iris(&required_objects(activity)?)?;
    let targets = activity.iris("target");
    ensure!(!targets.is_empty(), TargetRequiredSnafu);
    for target in targets {
        if !ctx.owns(&target).await? {
            debug!("Ignoring un-owned target {target}");
            continue;
        }
        let _guard = ctx.lock(&target).await?;
        if !ctx.db.exists(&target).await.context(StorageSnafu)? {
            continue;
        }
        let mut collection = ctx.db.get(&target).await.context(StorageSnafu)?;
        if !collection.is_collection() {
            debug!("{target} is not a collection");
            continue;
        }
        let mut changed = false;
        for object in &objects {
            if adding {
                if ctx
                    .common
                    .can_add(object, &target)
                    .await
                    .context(ApplicationSnafu)?
                {
                    collection.append_item(Reference::Iri(object.clone()));
                    changed = true;
                }
            } else if ctx
                .common
                .can_remove(object, &target)
                .await
                .context(ApplicationSnafu)?
            {
                changed |= collection.remove_item(object);
            }
        }
        if changed {
            ctx.db.update(&collection).await.context(StorageSnafu)?;
        }
    }
    Ok(())
}

/// Every actor of the Undo must be an actor of each activity being undone
async fn undo(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let objects = required_objects(activity)?;
    let undoers = activity.iris("actor");
    ensure!(!undoers.is_empty(), UndoNotAuthorizedSnafu);
    for reference in objects {
        let undone = match reference {
            Reference::Inline(object) => object,
            Reference::Iri(iri) => ctx.fetch(&iri).await?,
        };
        let actors = undone.iris("actor").into_iter().collect::<HashSet<Url>>();
        ensure!(
            undoers.iter().all(|a| actors.contains(a)),
            UndoNotAuthorizedSnafu
        );
    }
    Ok(())
}

async fn tombstone_all(ctx: &Context<'_>, iris: &[Url]) -> Result<()> {
    for iri in iris {
        let _guard = ctx.lock(iri).await?;
        if ctx.db.exists(iri).await.context(StorageSnafu)? {
            let object = ctx.db.get(iri).await.context(StorageSnafu)?;
            ctx.db
                .update(&object.tombstone(iri, &ctx.common.now()))
                .await
                .context(StorageSnafu)?;
            debug!("Tombstoned {iri}");
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     the federating protocol                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Apply the default side effects for `activity`, just received at `ctx.box_iri`
///
/// If the inbox's actor is to reply (by accepting or rejecting a Follow, e.g.), the reply is
/// returned; it has been stored & added to the actor's outbox, but not delivered.
pub async fn federating(
    ctx: &Context<'_>,
    activity: &Object,
    on_follow: OnFollow,
) -> Result<Option<Object>> {
    match activity.kind() {
        Some(ActivityKind::Create) => create_inbound(ctx, activity).await?,
        Some(ActivityKind::Update) => update_inbound(ctx, activity).await?,
        Some(ActivityKind::Delete) => delete_inbound(ctx, activity).await?,
        Some(ActivityKind::Follow) => return follow_inbound(ctx, activity, on_follow).await,
        Some(ActivityKind::Accept) => accept_inbound(ctx, activity).await?,
        Some(ActivityKind::Reject) => (),
        Some(ActivityKind::Add) => add(ctx, activity).await?,
        Some(ActivityKind::Remove) => remove(ctx, activity).await?,
        Some(ActivityKind::Like) => like_inbound(ctx, activity).await?,
        Some(ActivityKind::Announce) => announce_inbound(ctx, activity).await?,
        Some(ActivityKind::Undo) => undo(ctx, activity).await?,
        Some(ActivityKind::Block) => {
            required_objects(activity)?;
        }
        Some(ActivityKind::Unknown(_)) | None => (),
    }
    Ok(None)
}

async fn create_inbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    for reference in required_objects(activity)? {
        let object = match reference {
            Reference::Inline(object) => object,
            Reference::Iri(iri) => ctx.fetch(&iri).await?,
        };
        ctx.create(&object).await?;
    }
    Ok(())
}

async fn update_inbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let objects = inline_objects(required_objects(activity)?)?;
    for object in &objects {
        check_origin(activity, &object.id().context(MissingIdSnafu)?)?;
    }
    for object in objects {
        let id = object.id().context(MissingIdSnafu)?;
        let _guard = ctx.lock(&id).await?;
        ctx.db.update(&object).await.context(StorageSnafu)?;
    }
    Ok(())
}

async fn delete_inbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let iris = object_iris(&required_objects(activity)?)?;
    for iri in &iris {
        check_origin(activity, iri)?;
    }
    tombstone_all(ctx, &iris).await
}

async fn follow_inbound(
    ctx: &Context<'_>,
    activity: &Object,
    on_follow: OnFollow,
) -> Result<Option<Object>> {
    let objects = object_iris(&required_objects(activity)?)?;
    if on_follow == OnFollow::DoNothing {
        return Ok(None);
    }
    let mut owned = false;
    for object in &objects {
        if ctx.owns(object).await? {
            owned = true;
            break;
        }
    }
    if !owned {
        return Ok(None);
    }

    let me = ctx
        .db
        .actor_for_inbox(ctx.box_iri)
        .await
        .context(StorageSnafu)?;
    let followers = activity.iris("actor");
    let accept = on_follow == OnFollow::AutomaticallyAccept;
    if accept {
        let collection = ctx
            .db
            .followers(&me)
            .await
            .context(StorageSnafu)?
            .id()
            .context(MissingIdSnafu)?;
        ctx.update_collection(&collection, |c| append_all(c, &followers))
            .await?;
    }

    let mut reply = Object::new(if accept { "Accept" } else { "Reject" });
    reply.set("actor", json!(me.as_str()));
    reply.set_references("object", &[Reference::Inline(activity.clone())]);
    reply.set_references(
        "to",
        &followers
            .iter()
            .cloned()
            .map(Reference::Iri)
            .collect::<Vec<Reference>>(),
    );
    let id = ctx.db.new_id(&reply).await.context(StorageSnafu)?;
    reply.set_id(&id);
    ctx.create(&reply).await?;

    let outbox = ctx
        .db
        .outbox_for_inbox(ctx.box_iri)
        .await
        .context(StorageSnafu)?;
    {
        let _guard = ctx.lock(&outbox).await?;
        let mut page = ctx.db.get_outbox(&outbox).await.context(StorageSnafu)?;
        page.prepend_item(Reference::Iri(id.clone()));
        ctx.db.set_outbox(&page).await.context(StorageSnafu)?;
    }
    debug!("Replying to Follow with {id}");
    Ok(Some(reply))
}

async fn accept_inbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let me = ctx
        .db
        .actor_for_inbox(ctx.box_iri)
        .await
        .context(StorageSnafu)?;
    let accepters = activity.iris("actor");
    for reference in activity.references("object") {
        let follow = match reference {
            Reference::Inline(object) => Some(object),
            Reference::Iri(iri) => ctx.stored(&iri).await?,
        };
        match follow {
            Some(follow) if follow.has_type("Follow") && follow.iris("actor").contains(&me) => {
                let collection = ctx
                    .db
                    .following(&me)
                    .await
                    .context(StorageSnafu)?
                    .id()
                    .context(MissingIdSnafu)?;
                ctx.update_collection(&collection, |c| append_all(c, &accepters))
                    .await?;
            }
            _ => debug!("Accept of something other than our Follow; ignoring"),
        }
    }
    Ok(())
}

async fn like_inbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let actors = activity.iris("actor");
    for object in object_iris(&required_objects(activity)?)? {
        if ctx.owns(&object).await? {
            ctx.add_to_object_collection(&object, "likes", &actors)
                .await?;
        }
    }
    Ok(())
}

async fn announce_inbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let id = activity.id().context(MissingIdSnafu)?;
    for object in object_iris(&required_objects(activity)?)? {
        if ctx.owns(&object).await? {
            ctx.add_to_object_collection(&object, "shares", std::slice::from_ref(&id))
                .await?;
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the social protocol                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Apply the default side effects for `activity`, just posted to `ctx.box_iri`
///
/// `activity` may be modified along the way. Returns false if the activity is not to be
/// delivered.
pub async fn social(ctx: &Context<'_>, activity: &mut Object) -> Result<bool> {
    match activity.kind() {
        Some(ActivityKind::Create) => create_outbound(ctx, activity).await?,
        Some(ActivityKind::Update) => update_outbound(ctx, activity).await?,
        Some(ActivityKind::Delete) => {
            tombstone_all(ctx, &object_iris(&required_objects(activity)?)?).await?
        }
        Some(ActivityKind::Follow) => {
            required_objects(activity)?;
        }
        Some(ActivityKind::Add) => add(ctx, activity).await?,
        Some(ActivityKind::Remove) => remove(ctx, activity).await?,
        Some(ActivityKind::Like) => like_outbound(ctx, activity).await?,
        Some(ActivityKind::Undo) => undo(ctx, activity).await?,
        Some(ActivityKind::Block) => {
            required_objects(activity)?;
            debug!("Blocks are never delivered");
            return Ok(false);
        }
        Some(ActivityKind::Accept)
        | Some(ActivityKind::Reject)
        | Some(ActivityKind::Announce)
        | Some(ActivityKind::Unknown(_))
        | None => (),
    }
    Ok(true)
}

async fn create_outbound(ctx: &Context<'_>, activity: &mut Object) -> Result<()> {
    let actors = activity.iris("actor");
    let mut objects = Vec::new();
    for reference in required_objects(activity)? {
        match reference {
            Reference::Inline(mut object) => {
                for actor in &actors {
                    object.append_iri("attributedTo", actor);
                }
                normalize_recipients(activity, &mut object);
                ctx.create(&object).await?;
                objects.push(Reference::Inline(object));
            }
            reference => objects.push(reference),
        }
    }
    activity.set_references("object", &objects);
    Ok(())
}

async fn update_outbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    for update in inline_objects(required_objects(activity)?)? {
        let id = update.id().context(MissingIdSnafu)?;
        ensure!(ctx.owns(&id).await?, NotOwnedSnafu { iri: id.clone() });
        let _guard = ctx.lock(&id).await?;
        let mut stored = ctx.db.get(&id).await.context(StorageSnafu)?;
        for (property, value) in update.as_map() {
            if property == "id" {
                continue;
            }
            if value.is_null() {
                stored.remove(property);
            } else {
                stored.set(property, value.clone());
            }
        }
        ctx.db.update(&stored).await.context(StorageSnafu)?;
    }
    Ok(())
}

async fn like_outbound(ctx: &Context<'_>, activity: &Object) -> Result<()> {
    let objects = object_iris(&required_objects(activity)?)?;
    let me = ctx
        .db
        .actor_for_outbox(ctx.box_iri)
        .await
        .context(StorageSnafu)?;
    let liked = ctx
        .db
        .liked(&me)
        .await
        .context(StorageSnafu)?
        .id()
        .context(MissingIdSnafu)?;
    ctx.update_collection(&liked, |c| append_all(c, &objects))
        .await
}
