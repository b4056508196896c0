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

//! # ActivityPub Entities
//!
//! ## Introduction
//!
//! [ActivityPub] messages are [ActivityStreams] documents, which are in turn [JSON-LD]. There are
//! two ways to handle them: the "strict" approach (expand the JSON-LD against its schemae, validate
//! it, then map it onto a typed vocabulary) and the "loose" approach (treat the document as plain
//! JSON and pick out the properties we care about by name).
//!
//! [ActivityPub]: https://www.w3.org/TR/activitypub/
//! [ActivityStreams]: https://www.w3.org/TR/activitystreams-vocabulary
//! [JSON-LD]: https://www.w3.org/TR/json-ld/#the-context
//!
//! relaypub takes the loose approach, and goes a step further than usual: it doesn't attempt to
//! define a struct per entity at all. A protocol runtime needs very little of the vocabulary (ids,
//! types, addressing, `object`/`target`, collection items) and must otherwise preserve whatever an
//! application or a peer put into a document, extensions included. So an [Object] is just a JSON
//! map with typed accessors for the properties the runtime reads & writes.
//!
//! ## References
//!
//! Nearly any property in ActivityStreams may hold a single value or an array of values, and each
//! value may be an IRI, an inline object, or a `Link` whose `href` is the IRI. [Object::references]
//! flattens all that into a list of [Reference]s.

use std::{collections::HashSet, fmt::Display, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;
use url::Url;

use relaypub_shared::{ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to deserialize an ActivityStreams object: {source}"))]
    FromJson {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize an ActivityStreams object: {source}"))]
    ToJson {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Vocabulary                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The addressing properties, in the order in which they're conventionally listed
pub const RECIPIENT_PROPERTIES: [&str; 5] = ["to", "bto", "cc", "bcc", "audience"];

lazy_static! {
    /// Every activity type defined by the ActivityStreams vocabulary
    static ref ACTIVITY_TYPES: HashSet<&'static str> = HashSet::from([
        "Accept", "Add", "Announce", "Arrive", "Block", "Create", "Delete", "Dislike", "Flag",
        "Follow", "Ignore", "Invite", "Join", "Leave", "Like", "Listen", "Move", "Offer",
        "Question", "Read", "Reject", "Remove", "TentativeAccept", "TentativeReject", "Travel",
        "Undo", "Update", "View",
    ]);
    static ref COLLECTION_TYPES: HashSet<&'static str> = HashSet::from([
        "Collection", "OrderedCollection", "CollectionPage", "OrderedCollectionPage",
    ]);
    static ref LINK_TYPES: HashSet<&'static str> = HashSet::from(["Link", "Mention"]);
    /// The remaining core & extended types: actors & plain objects
    static ref OBJECT_TYPES: HashSet<&'static str> = HashSet::from([
        "Application", "Group", "Organization", "Person", "Service", "Article", "Audio",
        "Document", "Event", "Image", "Note", "Object", "Page", "Place", "Profile",
        "Relationship", "Tombstone", "Video",
    ]);
}

/// The activity kinds for which the runtime supplies default side effects
///
/// Everything else (including every other ActivityStreams activity type) is carried as
/// [ActivityKind::Unknown], which is resolved against application-supplied callbacks.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ActivityKind {
    Accept,
    Add,
    Announce,
    Block,
    Create,
    Delete,
    Follow,
    Like,
    Reject,
    Remove,
    Undo,
    Update,
    Unknown(String),
}

impl ActivityKind {
    /// All kinds with library defaults
    pub const DEFAULTED: [ActivityKind; 12] = [
        ActivityKind::Accept,
        ActivityKind::Add,
        ActivityKind::Announce,
        ActivityKind::Block,
        ActivityKind::Create,
        ActivityKind::Delete,
        ActivityKind::Follow,
        ActivityKind::Like,
        ActivityKind::Reject,
        ActivityKind::Remove,
        ActivityKind::Undo,
        ActivityKind::Update,
    ];

    pub fn has_default(&self) -> bool {
        !matches!(self, ActivityKind::Unknown(_))
    }

    pub fn name(&self) -> &str {
        match self {
            ActivityKind::Accept => "Accept",
            ActivityKind::Add => "Add",
            ActivityKind::Announce => "Announce",
            ActivityKind::Block => "Block",
            ActivityKind::Create => "Create",
            ActivityKind::Delete => "Delete",
            ActivityKind::Follow => "Follow",
            ActivityKind::Like => "Like",
            ActivityKind::Reject => "Reject",
            ActivityKind::Remove => "Remove",
            ActivityKind::Undo => "Undo",
            ActivityKind::Update => "Update",
            ActivityKind::Unknown(name) => name,
        }
    }
}

impl Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<&str> for ActivityKind {
    fn from(s: &str) -> Self {
        match s {
            "Accept" => ActivityKind::Accept,
            "Add" => ActivityKind::Add,
            "Announce" => ActivityKind::Announce,
            "Block" => ActivityKind::Block,
            "Create" => ActivityKind::Create,
            "Delete" => ActivityKind::Delete,
            "Follow" => ActivityKind::Follow,
            "Like" => ActivityKind::Like,
            "Reject" => ActivityKind::Reject,
            "Remove" => ActivityKind::Remove,
            "Undo" => ActivityKind::Undo,
            "Update" => ActivityKind::Update,
            other => ActivityKind::Unknown(other.to_owned()),
        }
    }
}

/// Return true if `name` is an ActivityStreams activity type
pub fn is_activity_type(name: &str) -> bool {
    ACTIVITY_TYPES.contains(name)
}

/// Return true if `name` is any type defined by the ActivityStreams vocabulary
pub fn is_known_type(name: &str) -> bool {
    ACTIVITY_TYPES.contains(name)
        || COLLECTION_TYPES.contains(name)
        || LINK_TYPES.contains(name)
        || OBJECT_TYPES.contains(name)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Reference                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single value of an ActivityStreams property that refers to another object
#[derive(Clone, Debug, PartialEq)]
pub enum Reference {
    Iri(Url),
    Inline(Object),
}

impl Reference {
    /// The IRI this reference names; for inline objects, that's their `id` (if they have one)
    pub fn iri(&self) -> Option<Url> {
        match self {
            Reference::Iri(url) => Some(url.clone()),
            Reference::Inline(object) => object.id(),
        }
    }
    pub fn as_inline(&self) -> Option<&Object> {
        match self {
            Reference::Iri(_) => None,
            Reference::Inline(object) => Some(object),
        }
    }
    pub fn is_inline(&self) -> bool {
        matches!(self, Reference::Inline(_))
    }
    fn from_value(value: &Value) -> Option<Reference> {
        match value {
            Value::String(text) => Url::parse(text).ok().map(Reference::Iri),
            Value::Object(map) => {
                let object = Object(map.clone());
                if object.types().iter().any(|t| LINK_TYPES.contains(t.as_str())) {
                    object
                        .get_str("href")
                        .and_then(|href| Url::parse(href).ok())
                        .map(Reference::Iri)
                } else {
                    Some(Reference::Inline(object))
                }
            }
            _ => None,
        }
    }
    pub fn to_value(&self) -> Value {
        match self {
            Reference::Iri(url) => Value::String(url.to_string()),
            Reference::Inline(object) => Value::Object(object.0.clone()),
        }
    }
}

impl From<Url> for Reference {
    fn from(url: Url) -> Self {
        Reference::Iri(url)
    }
}

impl From<Object> for Reference {
    fn from(object: Object) -> Self {
        Reference::Inline(object)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Object                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An ActivityStreams object of any type, activities, actors & collections included
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Object(Map<String, Value>);

impl Object {
    /// Create a new, empty [Object] of type `type_name`
    pub fn new(type_name: &str) -> Object {
        let mut map = Map::new();
        map.insert("type".to_owned(), Value::String(type_name.to_owned()));
        Object(map)
    }
    /// Parse a document; the top-level value must be a JSON object
    pub fn from_slice(bytes: &[u8]) -> Result<Object> {
        serde_json::from_slice::<Object>(bytes).context(FromJsonSnafu)
    }
    pub fn from_value(value: Value) -> Result<Object> {
        serde_json::from_value::<Object>(value).context(FromJsonSnafu)
    }
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.0.get(property)
    }
    pub fn get_str(&self, property: &str) -> Option<&str> {
        self.0.get(property).and_then(Value::as_str)
    }
    pub fn set(&mut self, property: &str, value: Value) {
        self.0.insert(property.to_owned(), value);
    }
    pub fn remove(&mut self, property: &str) -> Option<Value> {
        self.0.remove(property)
    }
    pub fn id(&self) -> Option<Url> {
        self.get_str("id").and_then(|text| Url::parse(text).ok())
    }
    /// Remove `bto` & `bcc` from this object & from any objects carried inline in its `object`
    pub fn strip_hidden_recipients(&mut self) {
        fn strip(map: &mut Map<String, Value>) {
            map.remove("bto");
            map.remove("bcc");
        }
        strip(&mut self.0);
        match self.0.get_mut("object") {
            Some(Value::Object(map)) => strip(map),
            Some(Value::Array(values)) => values
                .iter_mut()
                .filter_map(Value::as_object_mut)
                .for_each(strip),
            _ => (),
        }
    }
    pub fn set_id(&mut self, id: &Url) {
        self.set("id", Value::String(id.to_string()));
    }
    /// The values of the `type` property, which may be a string or an array thereof
    pub fn types(&self) -> Vec<String> {
        match self.0.get("type") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
    pub fn has_type(&self, type_name: &str) -> bool {
        self.types().iter().any(|t| t == type_name)
    }
    /// The activity kind of this object; the first recognized activity type wins
    pub fn kind(&self) -> Option<ActivityKind> {
        let types = self.types();
        types
            .iter()
            .find(|t| is_activity_type(t))
            .or_else(|| types.first())
            .map(|t| ActivityKind::from(t.as_str()))
    }
    /// Return true if any of this object's types is defined by ActivityStreams
    pub fn has_known_type(&self) -> bool {
        self.types().iter().any(|t| is_known_type(t))
    }
    pub fn is_activity(&self) -> bool {
        self.types().iter().any(|t| is_activity_type(t))
    }
    pub fn is_collection(&self) -> bool {
        self.types()
            .iter()
            .any(|t| COLLECTION_TYPES.contains(t.as_str()))
    }
    /// Anything with an inbox can receive activities, which is all that matters to us
    pub fn is_actor(&self) -> bool {
        self.0.contains_key("inbox")
    }
    pub fn is_tombstone(&self) -> bool {
        self.has_type("Tombstone")
    }
    /// All the references held in `property`
    pub fn references(&self, property: &str) -> Vec<Reference> {
        match self.0.get(property) {
            Some(Value::Array(values)) => values.iter().filter_map(Reference::from_value).collect(),
            Some(value) => Reference::from_value(value).into_iter().collect(),
            None => Vec::new(),
        }
    }
    /// The IRIs of all the references held in `property`; inline objects lacking an `id` are skipped
    pub fn iris(&self, property: &str) -> Vec<Url> {
        self.references(property)
            .iter()
            .filter_map(Reference::iri)
            .collect()
    }
    /// The first IRI in `property`, if any
    pub fn iri(&self, property: &str) -> Option<Url> {
        self.iris(property).into_iter().next()
    }
    pub fn set_references(&mut self, property: &str, references: &[Reference]) {
        self.set(
            property,
            Value::Array(references.iter().map(Reference::to_value).collect()),
        );
    }
    /// Add `iri` to `property` unless it's already there
    pub fn append_iri(&mut self, property: &str, iri: &Url) {
        let mut refs = self.references(property);
        if !refs.iter().any(|r| r.iri().as_ref() == Some(iri)) {
            refs.push(Reference::Iri(iri.clone()));
            self.set_references(property, &refs);
        }
    }
    fn items_key(&self) -> &'static str {
        if self.0.contains_key("orderedItems")
            || self.has_type("OrderedCollection")
            || self.has_type("OrderedCollectionPage")
        {
            "orderedItems"
        } else {
            "items"
        }
    }
    /// The members of this collection (or collection page)
    pub fn items(&self) -> Vec<Reference> {
        self.references(self.items_key())
    }
    /// Replace the members of this collection, keeping `totalItems` in sync
    pub fn set_items(&mut self, items: &[Reference]) {
        let key = self.items_key();
        self.set_references(key, items);
        self.set("totalItems", json!(items.len()));
    }
    /// Add `item` at the front of this collection (the newest-first convention for inboxes &
    /// outboxes)
    pub fn prepend_item(&mut self, item: Reference) {
        let mut items = self.items();
        items.insert(0, item);
        self.set_items(&items);
    }
    /// Add `item` at the end of this collection, unless an item with the same IRI is present
    pub fn append_item(&mut self, item: Reference) {
        let mut items = self.items();
        let iri = item.iri();
        if iri.is_none() || !items.iter().any(|i| i.iri() == iri) {
            items.push(item);
            self.set_items(&items);
        }
    }
    /// Remove every item naming `iri`; return true if anything was removed
    pub fn remove_item(&mut self, iri: &Url) -> bool {
        let items = self.items();
        let before = items.len();
        let items = items
            .into_iter()
            .filter(|i| i.iri().as_ref() != Some(iri))
            .collect::<Vec<Reference>>();
        let removed = items.len() != before;
        if removed {
            self.set_items(&items);
        }
        removed
    }
    pub fn contains_item(&self, iri: &Url) -> bool {
        self.items().iter().any(|i| i.iri().as_ref() == Some(iri))
    }
    /// Remove duplicate entries from `orderedItems`, keeping the first occurrence of each IRI
    ///
    /// Entries without any identity are kept as-is.
    pub fn dedupe_ordered_items(&mut self) {
        if let Some(Value::Array(values)) = self.0.get("orderedItems") {
            let mut seen = HashSet::new();
            let deduped = values
                .iter()
                .filter(|v| match Reference::from_value(v).and_then(|r| r.iri()) {
                    Some(iri) => seen.insert(iri.to_string()),
                    None => true,
                })
                .cloned()
                .collect::<Vec<Value>>();
            self.set("orderedItems", Value::Array(deduped));
        }
    }
    /// Serialize this object as a JSON-LD document, adding the ActivityStreams `@context` if it's
    /// not already present
    pub fn to_jld(&self) -> Value {
        let mut map = self.0.clone();
        if !map.contains_key("@context") {
            map.insert(
                "@context".to_owned(),
                json!([ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT]),
            );
        }
        Value::Object(map)
    }
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(&self.to_jld())
            .context(ToJsonSnafu)?
            .pipe(Bytes::from)
            .pipe(Ok)
    }
    /// Produce a Tombstone to stand in for `self` after deletion
    pub fn tombstone(&self, id: &Url, deleted: &DateTime<Utc>) -> Object {
        let mut tombstone = Object::new("Tombstone");
        tombstone.set_id(id);
        let former = self.types();
        if !former.is_empty() {
            tombstone.set(
                "formerType",
                match former.len() {
                    1 => Value::String(former[0].clone()),
                    _ => json!(former),
                },
            );
        }
        for property in ["published", "updated"] {
            if let Some(value) = self.get(property) {
                tombstone.set(property, value.clone());
            }
        }
        tombstone.set(
            "deleted",
            Value::String(deleted.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        tombstone
    }
    /// Build an empty collection of type `type_name` ("Collection" or "OrderedCollection")
    pub fn collection(type_name: &str, id: Option<&Url>) -> Object {
        let mut collection = Object::new(type_name);
        if let Some(id) = id {
            collection.set_id(id);
        }
        collection.set_items(&[]);
        collection
    }
}

impl FromStr for Object {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Object::from_slice(s.as_bytes())
    }
}

/// Copy addressing between an activity & its object
///
/// For each of `to`, `bto`, `cc`, `bcc` & `audience`, whichever side is empty receives the values of
/// the other, so that both are addressed identically when first distributed. `published` is
/// treated the same way.
pub fn normalize_recipients(activity: &mut Object, object: &mut Object) {
    for property in RECIPIENT_PROPERTIES.iter().chain(["published"].iter()) {
        let on_activity = activity.get(property).filter(|v| !is_empty(v)).cloned();
        let on_object = object.get(property).filter(|v| !is_empty(v)).cloned();
        match (on_activity, on_object) {
            (Some(value), None) => object.set(property, value),
            (None, Some(value)) => activity.set(property, value),
            _ => (),
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(values) => values.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A Follow, as sent by Mastodon 4.3
    const MASTODON_FOLLOW: &str = r#"{
  "@context": "https://www.w3.org/ns/activitystreams",
  "id": "https://mastodon.social/8cb2fd1d-f5d8-4b5b-9d93-9bbb8d3a4c70",
  "type": "Follow",
  "actor": "https://mastodon.social/users/sp1ff",
  "object": "https://relaypub.example/users/alice"
}"#;

    /// A Create with an inline Note, trimmed from a Pleroma fixture
    const PLEROMA_CREATE: &str = r#"{
  "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
  "actor": "https://pleroma.example/users/lain",
  "cc": ["https://pleroma.example/users/lain/followers"],
  "id": "https://pleroma.example/activities/e4b2b7a1",
  "object": {
    "attributedTo": "https://pleroma.example/users/lain",
    "cc": ["https://pleroma.example/users/lain/followers"],
    "content": "hello, fediverse",
    "id": "https://pleroma.example/objects/8a4e9d23",
    "published": "2025-01-03T17:34:47Z",
    "tag": [{"href": "https://relaypub.example/users/alice", "name": "@alice", "type": "Mention"}],
    "to": ["https://www.w3.org/ns/activitystreams#Public"],
    "type": "Note"
  },
  "published": "2025-01-03T17:34:47Z",
  "to": ["https://www.w3.org/ns/activitystreams#Public"],
  "type": "Create"
}"#;

    #[test]
    fn follow_fixture() {
        let follow = MASTODON_FOLLOW.parse::<Object>().unwrap();
        assert_eq!(follow.kind(), Some(ActivityKind::Follow));
        assert!(follow.is_activity());
        assert_eq!(
            follow.iri("actor").unwrap().as_str(),
            "https://mastodon.social/users/sp1ff"
        );
        assert_eq!(
            follow.iris("object"),
            vec![Url::parse("https://relaypub.example/users/alice").unwrap()]
        );
    }

    #[test]
    fn create_fixture() {
        let create = PLEROMA_CREATE.parse::<Object>().unwrap();
        assert_eq!(create.kind(), Some(ActivityKind::Create));
        let objects = create.references("object");
        assert_eq!(objects.len(), 1);
        let note = objects[0].as_inline().unwrap();
        assert!(note.has_type("Note"));
        assert!(!note.is_activity());
        assert_eq!(
            note.id().unwrap().as_str(),
            "https://pleroma.example/objects/8a4e9d23"
        );
        // Mentions are links, so the tag resolves to the mentioned actor's IRI
        assert_eq!(
            note.iris("tag"),
            vec![Url::parse("https://relaypub.example/users/alice").unwrap()]
        );
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(Object::from_slice(b"[1, 2, 3]").is_err());
        assert!(Object::from_slice(b"\"Create\"").is_err());
        assert!(Object::from_slice(b"{not json").is_err());
    }

    #[test]
    fn unknown_kinds() {
        let listen = Object::from_value(json!({"type": "Listen"})).unwrap();
        assert!(listen.is_activity());
        assert_eq!(listen.kind(), Some(ActivityKind::Unknown("Listen".to_owned())));
        assert!(!listen.kind().unwrap().has_default());

        let multi = Object::from_value(json!({"type": ["toot:Emoji", "Like"]})).unwrap();
        assert_eq!(multi.kind(), Some(ActivityKind::Like));
        assert_eq!(ActivityKind::from("Undo").to_string(), "Undo");

        assert!(Object::new("Note").has_known_type());
        assert!(!Object::new("Note").is_activity());
        assert!(!Object::new("Frobnicate").has_known_type());
    }

    #[test]
    fn dedupe() {
        let mut page = Object::from_value(json!({
            "type": "OrderedCollectionPage",
            "orderedItems": ["https://a.example/1", {"id": "https://a.example/1"}, "https://a.example/2"]
        }))
        .unwrap();
        page.dedupe_ordered_items();
        assert_eq!(
            page.get("orderedItems").unwrap(),
            &json!(["https://a.example/1", "https://a.example/2"])
        );

        let mut page = Object::from_value(json!({
            "type": "OrderedCollectionPage",
            "orderedItems": ["https://a.example/1", "https://a.example/2"]
        }))
        .unwrap();
        page.dedupe_ordered_items();
        assert_eq!(
            page.get("orderedItems").unwrap(),
            &json!(["https://a.example/1", "https://a.example/2"])
        );
    }

    #[test]
    fn collections() {
        let id = Url::parse("https://relaypub.example/users/alice/followers").unwrap();
        let mut followers = Object::collection("OrderedCollection", Some(&id));
        let bob = Url::parse("https://b.example/users/bob").unwrap();
        followers.append_item(Reference::Iri(bob.clone()));
        followers.append_item(Reference::Iri(bob.clone()));
        assert_eq!(followers.get("totalItems").unwrap(), &json!(1));
        assert!(followers.contains_item(&bob));
        assert!(followers.remove_item(&bob));
        assert!(!followers.contains_item(&bob));
        assert_eq!(followers.get("totalItems").unwrap(), &json!(0));
    }

    #[test]
    fn tombstones() {
        let note = Object::from_value(json!({
            "type": "Note",
            "id": "https://relaypub.example/objects/1",
            "published": "2025-01-03T17:34:47Z",
            "content": "gone soon"
        }))
        .unwrap();
        let deleted = DateTime::parse_from_rfc3339("2025-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tomb = note.tombstone(&note.id().unwrap(), &deleted);
        assert!(tomb.is_tombstone());
        assert_eq!(tomb.get_str("formerType"), Some("Note"));
        assert_eq!(tomb.get_str("published"), Some("2025-01-03T17:34:47Z"));
        assert_eq!(tomb.get_str("deleted"), Some("2025-02-01T00:00:00Z"));
        assert!(tomb.get("content").is_none());
    }

    #[test]
    fn recipients_normalized() {
        let mut create = Object::new("Create");
        let mut note = Object::from_value(json!({
            "type": "Note",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "bcc": ["https://b.example/users/bob"],
            "published": "2025-01-03T17:34:47Z"
        }))
        .unwrap();
        create.set("cc", json!(["https://c.example/users/carol"]));
        normalize_recipients(&mut create, &mut note);
        assert_eq!(create.get("to"), note.get("to"));
        assert_eq!(create.get("bcc"), note.get("bcc"));
        assert_eq!(create.get("cc"), note.get("cc"));
        assert_eq!(create.get_str("published"), Some("2025-01-03T17:34:47Z"));
        assert!(create.get("audience").is_none());

        // ...but hidden recipients don't survive distribution, on either side
        create.set("object", json!([note.into_value(), "https://a.example/notes/2"]));
        create.strip_hidden_recipients();
        assert!(create.get("bcc").is_none());
        let object = create.get("object").unwrap().as_array().unwrap();
        assert!(object[0].get("bcc").is_none());
        assert!(object[0].get("to").is_some());
        assert_eq!(object[1], "https://a.example/notes/2");
    }

    #[test]
    fn jld() {
        let note = Object::new("Note");
        let jld = note.to_jld();
        assert_eq!(
            jld.get("@context").unwrap(),
            &json!([
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ])
        );
        let follow = MASTODON_FOLLOW.parse::<Object>().unwrap();
        assert_eq!(
            follow.to_jld().get("@context").unwrap(),
            &json!("https://www.w3.org/ns/activitystreams")
        );
    }
}
