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

//! # In-memory storage
//!
//! A [Database] implementation that keeps everything in process memory. It's what `relaypubd` runs
//! on & what the integration tests use; it's not meant for anything with users.
//!
//! Every object (actors & their collections included) lives in one map keyed by IRI. The server
//! owns every IRI whose origin matches the origin the database was created with.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use serde_json::json;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{
    ap_entities::Object,
    storage::{self, Database, IriLocks, LockGuard},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{iri} is not the inbox or outbox of any local actor"))]
    NoActor { iri: Url, backtrace: Backtrace },
    #[snafu(display("{actor} has no {property} collection"))]
    NoCollection {
        actor: Url,
        property: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Objects must have an id in order to be stored"))]
    NoId { backtrace: Backtrace },
    #[snafu(display("No object found at {iri}"))]
    NotFound { iri: Url, backtrace: Backtrace },
    #[snafu(display("Failed to form a local IRI: {source}"))]
    UrlParse {
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         MemoryDatabase                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
struct Boxes {
    actor: Url,
    inbox: Url,
    outbox: Url,
}

#[derive(Debug)]
pub struct MemoryDatabase {
    origin: Url,
    objects: RwLock<HashMap<String, Object>>,
    boxes: RwLock<Vec<Boxes>>,
    locks: IriLocks,
}

impl MemoryDatabase {
    /// Create an empty database owning everything under `origin` (e.g. "https://relaypub.example")
    pub fn new(origin: &Url) -> MemoryDatabase {
        MemoryDatabase {
            origin: origin.clone(),
            objects: RwLock::new(HashMap::new()),
            boxes: RwLock::new(Vec::new()),
            locks: IriLocks::new(),
        }
    }
    pub fn origin(&self) -> &Url {
        &self.origin
    }
    fn local(&self, path: &str) -> Result<Url> {
        self.origin.join(path).context(UrlParseSnafu)
    }
    /// Create a local actor named `username`, along with its inbox, outbox, followers, following &
    /// liked collections; return the new actor
    pub fn add_actor(&self, username: &str, public_key_pem: Option<&str>) -> Result<Object> {
        let id = self.local(&format!("/users/{username}"))?;
        let inbox = self.local(&format!("/users/{username}/inbox"))?;
        let outbox = self.local(&format!("/users/{username}/outbox"))?;
        let followers = self.local(&format!("/users/{username}/followers"))?;
        let following = self.local(&format!("/users/{username}/following"))?;
        let liked = self.local(&format!("/users/{username}/liked"))?;

        let mut actor = Object::new("Person");
        actor.set_id(&id);
        actor.set("preferredUsername", json!(username));
        actor.set("inbox", json!(inbox.as_str()));
        actor.set("outbox", json!(outbox.as_str()));
        actor.set("followers", json!(followers.as_str()));
        actor.set("following", json!(following.as_str()));
        actor.set("liked", json!(liked.as_str()));
        if let Some(pem) = public_key_pem {
            actor.set(
                "publicKey",
                json!({
                    "id": format!("{id}#main-key"),
                    "owner": id.as_str(),
                    "publicKeyPem": pem,
                }),
            );
        }

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        for iri in [&inbox, &outbox, &followers, &following, &liked] {
            objects.insert(
                iri.to_string(),
                Object::collection("OrderedCollection", Some(iri)),
            );
        }
        objects.insert(id.to_string(), actor.clone());
        self.boxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Boxes {
                actor: id.clone(),
                inbox,
                outbox,
            });
        debug!("Created local actor {id}");
        Ok(actor)
    }
    /// Look up a local actor by username
    pub fn actor(&self, username: &str) -> Option<Object> {
        let id = self.local(&format!("/users/{username}")).ok()?;
        self.read(&id).ok()
    }
    fn read(&self, iri: &Url) -> Result<Object> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(iri.as_str())
            .cloned()
            .context(NotFoundSnafu { iri: iri.clone() })
    }
    fn write(&self, object: &Object) -> Result<()> {
        let id = object.id().context(NoIdSnafu)?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), object.clone());
        Ok(())
    }
    fn boxes_for(&self, pred: impl Fn(&Boxes) -> bool, iri: &Url) -> Result<Boxes> {
        self.boxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|b| pred(b))
            .cloned()
            .context(NoActorSnafu { iri: iri.clone() })
    }
    fn actor_collection(&self, actor: &Url, property: &str) -> Result<Object> {
        let collection = self
            .read(actor)?
            .iri(property)
            .context(NoCollectionSnafu {
                actor: actor.clone(),
                property: property.to_owned(),
            })?;
        self.read(&collection)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn lock(&self, id: &Url) -> StdResult<LockGuard, storage::Error> {
        Ok(self.locks.lock(id).await)
    }
    async fn inbox_contains(&self, inbox: &Url, id: &Url) -> StdResult<bool, storage::Error> {
        Ok(self
            .read(inbox)
            .map_err(storage::Error::new)?
            .contains_item(id))
    }
    async fn get_inbox(&self, inbox: &Url) -> StdResult<Object, storage::Error> {
        self.read(inbox).map_err(storage::Error::new)
    }
    async fn set_inbox(&self, inbox: &Object) -> StdResult<(), storage::Error> {
        self.write(inbox).map_err(storage::Error::new)
    }
    async fn owns(&self, id: &Url) -> StdResult<bool, storage::Error> {
        Ok(id.origin() == self.origin.origin())
    }
    async fn actor_for_outbox(&self, outbox: &Url) -> StdResult<Url, storage::Error> {
        self.boxes_for(|b| &b.outbox == outbox, outbox)
            .map(|b| b.actor)
            .map_err(storage::Error::new)
    }
    async fn actor_for_inbox(&self, inbox: &Url) -> StdResult<Url, storage::Error> {
        self.boxes_for(|b| &b.inbox == inbox, inbox)
            .map(|b| b.actor)
            .map_err(storage::Error::new)
    }
    async fn outbox_for_inbox(&self, inbox: &Url) -> StdResult<Url, storage::Error> {
        self.boxes_for(|b| &b.inbox == inbox, inbox)
            .map(|b| b.outbox)
            .map_err(storage::Error::new)
    }
    async fn exists(&self, id: &Url) -> StdResult<bool, storage::Error> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id.as_str()))
    }
    async fn get(&self, id: &Url) -> StdResult<Object, storage::Error> {
        self.read(id).map_err(storage::Error::new)
    }
    async fn create(&self, object: &Object) -> StdResult<(), storage::Error> {
        self.write(object).map_err(storage::Error::new)
    }
    async fn update(&self, object: &Object) -> StdResult<(), storage::Error> {
        self.write(object).map_err(storage::Error::new)
    }
    async fn delete(&self, id: &Url) -> StdResult<(), storage::Error> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id.as_str());
        Ok(())
    }
    async fn get_outbox(&self, outbox: &Url) -> StdResult<Object, storage::Error> {
        self.read(outbox).map_err(storage::Error::new)
    }
    async fn set_outbox(&self, outbox: &Object) -> StdResult<(), storage::Error> {
        self.write(outbox).map_err(storage::Error::new)
    }
    async fn new_id(&self, _object: &Object) -> StdResult<Url, storage::Error> {
        self.local(&format!("/objects/{}", Uuid::new_v4()))
            .map_err(storage::Error::new)
    }
    async fn followers(&self, actor: &Url) -> StdResult<Object, storage::Error> {
        self.actor_collection(actor, "followers")
            .map_err(storage::Error::new)
    }
    async fn following(&self, actor: &Url) -> StdResult<Object, storage::Error> {
        self.actor_collection(actor, "following")
            .map_err(storage::Error::new)
    }
    async fn liked(&self, actor: &Url) -> StdResult<Object, storage::Error> {
        self.actor_collection(actor, "liked")
            .map_err(storage::Error::new)
    }
}
