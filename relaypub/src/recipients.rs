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

//! # Recipient resolution
//!
//! An activity is addressed to actors & collections (followers, mostly) but delivered to inboxes.
//! [RecipientResolver] bridges the gap: it dereferences each addressee, collecting actors' inboxes
//! & descending into collections, then drops the sender & the Public collection from the result.

use std::{collections::HashSet, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use snafu::{ResultExt, Snafu};
use tracing::debug;
use url::Url;

use relaypub_shared::is_public;

use crate::{
    ap_entities::{self, Object, Reference, RECIPIENT_PROPERTIES},
    storage::{self, Database},
    transport::{self, Transport},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to dereference {iri}: {source}"))]
    Dereference { iri: Url, source: transport::Error },
    #[snafu(display("{iri} did not name a JSON object: {source}"))]
    Document {
        iri: Url,
        source: ap_entities::Error,
    },
    #[snafu(display("While resolving {iri}, {source}"))]
    Storage { iri: Url, source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       RecipientResolver                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Expands addressees into inboxes
///
/// `max_depth` bounds how far into nested collections resolution will descend: references named
/// directly by the activity are at depth zero, the members of a collection are one deeper than the
/// collection itself, and a collection's pages are at the collection's own depth. Zero or less means "no bound", which is safe in that no IRI is ever visited
/// twice in one resolution.
#[derive(Clone)]
pub struct RecipientResolver {
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    max_depth: i64,
}

impl RecipientResolver {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        max_depth: i64,
    ) -> RecipientResolver {
        RecipientResolver {
            db,
            transport,
            max_depth,
        }
    }
    /// Work out where `activity` should go, and strip its hidden recipients
    ///
    /// Returns the inboxes of everyone to whom `activity` is addressed, less the Public collection
    /// & the activity's own `actor`s & `attributedTo`s, each inbox appearing once, in the order in
    /// which it was first found. On return, neither `activity` nor any object it carries inline
    /// has a `bto` or `bcc`.
    #[tracing::instrument(skip_all)]
    pub async fn prepare(&self, activity: &mut Object) -> Result<Vec<Url>> {
        let senders = ["actor", "attributedTo"]
            .iter()
            .flat_map(|prop| activity.references(prop))
            .collect::<Vec<Reference>>();
        let mut ignore = senders
            .iter()
            .filter_map(Reference::iri)
            .map(|iri| iri.to_string())
            .collect::<HashSet<String>>();
        ignore.extend(
            self.resolve_inboxes(senders)
                .await?
                .into_iter()
                .map(|iri| iri.to_string()),
        );

        let receivers = RECIPIENT_PROPERTIES
            .iter()
            .flat_map(|prop| activity.references(prop))
            .filter(|r| match r.iri() {
                Some(iri) => !is_public(iri.as_str()) && !ignore.contains(iri.as_str()),
                None => true,
            })
            .collect::<Vec<Reference>>();

        let mut seen = HashSet::new();
        let recipients = self
            .resolve_inboxes(receivers)
            .await?
            .into_iter()
            .filter(|inbox| !ignore.contains(inbox.as_str()) && seen.insert(inbox.to_string()))
            .collect::<Vec<Url>>();

        activity.strip_hidden_recipients();
        debug!("Resolved {} recipients", recipients.len());
        Ok(recipients)
    }
    /// Resolve `refs` to the inboxes they denote, with duplicates
    pub async fn resolve_inboxes(&self, refs: Vec<Reference>) -> Result<Vec<Url>> {
        let mut visited = HashSet::new();
        self.resolve(refs, 0, &mut visited).await
    }
    fn resolve<'a>(
        &'a self,
        refs: Vec<Reference>,
        depth: i64,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<Vec<Url>>> {
        async move {
            if self.max_depth > 0 && depth > self.max_depth {
                debug!("Not descending past depth {}", self.max_depth);
                return Ok(Vec::new());
            }
            let mut inboxes = Vec::new();
            for reference in refs {
                if let Some(iri) = reference.iri() {
                    if is_public(iri.as_str()) || !visited.insert(iri.to_string()) {
                        continue;
                    }
                }
                let object = self.obtain(reference).await?;
                if object.is_collection() {
                    inboxes.extend(self.resolve(object.items(), depth + 1, visited).await?);
                    // Pages continue the collection; they're no deeper than it is.
                    let mut pages = object.references("first");
                    pages.extend(object.references("next"));
                    inboxes.extend(self.resolve(pages, depth, visited).await?);
                } else if let Some(inbox) = object.iri("inbox") {
                    inboxes.push(inbox);
                } else {
                    debug!("{:?} is neither an actor nor a collection", object.id());
                }
            }
            Ok(inboxes)
        }
        .boxed()
    }
    /// Get hold of the object `reference` names, wherever it lives
    async fn obtain(&self, reference: Reference) -> Result<Object> {
        let iri = match reference {
            Reference::Inline(object) => return Ok(object),
            Reference::Iri(iri) => iri,
        };
        if self.db.owns(&iri).await.context(StorageSnafu { iri: iri.clone() })? {
            let _guard = self
                .db
                .lock(&iri)
                .await
                .context(StorageSnafu { iri: iri.clone() })?;
            self.db
                .get(&iri)
                .await
                .context(StorageSnafu { iri: iri.clone() })
        } else {
            let body = self
                .transport
                .dereference(&iri)
                .await
                .context(DereferenceSnafu { iri: iri.clone() })?;
            Object::from_slice(&body).context(DocumentSnafu { iri })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    use crate::{memory::MemoryDatabase, transport::fake::FakeTransport};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn remote_actor(transport: &FakeTransport, id: &str) -> Object {
        let actor = Object::from_value(json!({
            "type": "Person",
            "id": id,
            "inbox": format!("{id}/inbox"),
        }))
        .unwrap();
        transport.serve(&actor);
        actor
    }

    fn remote_collection(transport: &FakeTransport, id: &str, items: &[&str]) {
        transport.serve(
            &Object::from_value(json!({
                "type": "OrderedCollection",
                "id": id,
                "orderedItems": items,
            }))
            .unwrap(),
        );
    }

    async fn fixture(
        max_depth: i64,
    ) -> (Arc<MemoryDatabase>, Arc<FakeTransport>, RecipientResolver) {
        let db = Arc::new(MemoryDatabase::new(&url("https://a.example")));
        let transport = Arc::new(FakeTransport::new());
        let resolver = RecipientResolver::new(db.clone(), transport.clone(), max_depth);
        (db, transport, resolver)
    }

    #[tokio::test]
    async fn public_and_sender_are_excluded() {
        let (db, transport, resolver) = fixture(0).await;
        let alice = db.add_actor("alice", None).unwrap();
        remote_actor(&transport, "https://b.example/users/bob");
        remote_actor(&transport, "https://c.example/users/carol");

        // alice's followers include bob... & alice herself
        let followers = alice.iri("followers").unwrap();
        let mut collection = db.get(&followers).await.unwrap();
        collection.append_item(Reference::Iri(url("https://b.example/users/bob")));
        collection.append_item(Reference::Iri(alice.id().unwrap()));
        db.update(&collection).await.unwrap();

        let mut activity = Object::from_value(json!({
            "type": "Create",
            "id": "https://a.example/objects/1",
            "actor": alice.id().unwrap().as_str(),
            "to": ["https://www.w3.org/ns/activitystreams#Public", followers.as_str()],
            "cc": ["as:Public", "https://b.example/users/bob", "https://c.example/users/carol"],
            "bcc": ["https://c.example/users/carol"],
            "object": {
                "type": "Note",
                "content": "Hello",
                "bto": ["https://c.example/users/carol"],
                "bcc": ["https://c.example/users/carol"],
            },
        }))
        .unwrap();

        let recipients = resolver.prepare(&mut activity).await.unwrap();
        assert_eq!(
            recipients,
            vec![
                url("https://b.example/users/bob/inbox"),
                url("https://c.example/users/carol/inbox"),
            ]
        );
        assert!(activity.get("bcc").is_none());
        assert!(activity.get("bto").is_none());
        assert!(activity.get("cc").is_some());
        let payload = String::from_utf8(activity.to_bytes().unwrap().to_vec()).unwrap();
        assert!(!payload.contains("\"bcc\""));
        assert!(!payload.contains("\"bto\""));
        assert!(payload.contains("Hello"));
    }

    #[tokio::test]
    async fn nested_collections_respect_max_depth() {
        let (_db, transport, resolver) = fixture(1).await;
        remote_actor(&transport, "https://b.example/users/bob");
        remote_actor(&transport, "https://b.example/users/dave");
        remote_collection(
            &transport,
            "https://b.example/groups/outer",
            &["https://b.example/users/bob", "https://b.example/groups/inner"],
        );
        remote_collection(
            &transport,
            "https://b.example/groups/inner",
            &["https://b.example/users/dave"],
        );

        let inboxes = resolver
            .resolve_inboxes(vec![Reference::Iri(url("https://b.example/groups/outer"))])
            .await
            .unwrap();
        assert_eq!(inboxes, vec![url("https://b.example/users/bob/inbox")]);

        // Unbounded, dave is reached through the inner collection
        let resolver = RecipientResolver::new(resolver.db.clone(), resolver.transport.clone(), 0);
        let inboxes = resolver
            .resolve_inboxes(vec![Reference::Iri(url("https://b.example/groups/outer"))])
            .await
            .unwrap();
        assert_eq!(
            inboxes,
            vec![
                url("https://b.example/users/bob/inbox"),
                url("https://b.example/users/dave/inbox"),
            ]
        );
    }

    #[tokio::test]
    async fn paging_does_not_count_toward_max_depth() {
        let (_db, transport, resolver) = fixture(1).await;
        for name in ["bob", "dave", "erin"] {
            remote_actor(&transport, &format!("https://b.example/users/{name}"));
        }
        transport.serve(
            &Object::from_value(json!({
                "type": "OrderedCollection",
                "id": "https://b.example/users/bob/followers",
                "totalItems": 2,
                "first": "https://b.example/users/bob/followers?page=1",
            }))
            .unwrap(),
        );
        transport.serve(
            &Object::from_value(json!({
                "type": "OrderedCollectionPage",
                "id": "https://b.example/users/bob/followers?page=1",
                "orderedItems": ["https://b.example/users/dave"],
                "next": "https://b.example/users/bob/followers?page=2",
            }))
            .unwrap(),
        );
        transport.serve(
            &Object::from_value(json!({
                "type": "OrderedCollectionPage",
                "id": "https://b.example/users/bob/followers?page=2",
                "orderedItems": ["https://b.example/users/erin"],
            }))
            .unwrap(),
        );

        let inboxes = resolver
            .resolve_inboxes(vec![Reference::Iri(url(
                "https://b.example/users/bob/followers",
            ))])
            .await
            .unwrap();
        assert_eq!(
            inboxes,
            vec![
                url("https://b.example/users/dave/inbox"),
                url("https://b.example/users/erin/inbox"),
            ]
        );
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let (_db, transport, resolver) = fixture(-1).await;
        remote_actor(&transport, "https://b.example/users/bob");
        remote_collection(
            &transport,
            "https://b.example/groups/a",
            &["https://b.example/groups/b", "https://b.example/users/bob"],
        );
        remote_collection(
            &transport,
            "https://b.example/groups/b",
            &["https://b.example/groups/a", "https://b.example/users/bob"],
        );
        let inboxes = resolver
            .resolve_inboxes(vec![Reference::Iri(url("https://b.example/groups/a"))])
            .await
            .unwrap();
        assert_eq!(inboxes, vec![url("https://b.example/users/bob/inbox")]);
    }

    #[tokio::test]
    async fn dereference_failures_fail_the_call() {
        let (_db, _transport, resolver) = fixture(0).await;
        let mut activity = Object::from_value(json!({
            "type": "Like",
            "actor": "https://a.example/users/nobody",
            "to": ["https://z.example/users/missing"],
        }))
        .unwrap();
        assert!(resolver.prepare(&mut activity).await.is_err());
    }
}
