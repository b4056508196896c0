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

//! End-to-end tests of the ActivityPub endpoints
//!
//! Each test works with its own local actor(s) & its own mock peers, so they may run concurrently
//! against a single [Instance].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{header::LOCATION, Method, StatusCode};
use libtest_mimic::Failed;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tap::Pipe;
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use relaypub::{
    authn::private_key_from_pem,
    client::Signer,
    transport::{self, HttpSigTransport, Transport},
};
use relaypub_shared::{ACTIVITY_JSON, ACTIVITY_STREAMS_CONTEXT};

use crate::server::Instance;

/// Mount a remote actor named `name` on `peer`, with an inbox that accepts `deliveries` POSTs;
/// return the actor's ID
async fn remote_actor(peer: &MockServer, name: &str, deliveries: u64) -> Result<Url, Failed> {
    let id = Url::parse(&format!("{}/users/{name}", peer.uri()))?;
    let inbox = Url::parse(&format!("{}/users/{name}/inbox", peer.uri()))?;
    Mock::given(method("GET"))
        .and(path(format!("/users/{name}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", ACTIVITY_JSON)
                .set_body_json(json!({
                    "@context": ACTIVITY_STREAMS_CONTEXT,
                    "id": id.as_str(),
                    "type": "Person",
                    "preferredUsername": name,
                    "inbox": inbox.as_str(),
                })),
        )
        .mount(peer)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{name}/inbox")))
        .respond_with(ResponseTemplate::new(202))
        .expect(deliveries)
        .mount(peer)
        .await;
    Ok(id)
}

const TEST_KEY: &str = include_str!("../../relaypub/tests/data/test-key.pem");
const TEST_PUB_KEY: &str = include_str!("../../relaypub/tests/data/test-key.pub.pem");

/// Mount a remote actor named `name` on `peer`, with the test key as its public key; return the
/// actor's ID
async fn signing_actor(peer: &MockServer, name: &str) -> Result<Url, Failed> {
    let id = Url::parse(&format!("{}/users/{name}", peer.uri()))?;
    Mock::given(method("GET"))
        .and(path(format!("/users/{name}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", ACTIVITY_JSON)
                .set_body_json(json!({
                    "@context": [ACTIVITY_STREAMS_CONTEXT, "https://w3id.org/security/v1"],
                    "id": id.as_str(),
                    "type": "Person",
                    "preferredUsername": name,
                    "inbox": format!("{id}/inbox"),
                    "publicKey": {
                        "id": format!("{id}#main-key"),
                        "owner": id.as_str(),
                        "publicKeyPem": TEST_PUB_KEY,
                    },
                })),
        )
        .mount(peer)
        .await;
    Ok(id)
}

/// The POSTs `peer` has received at `inbox_path`
async fn deliveries(peer: &MockServer, inbox_path: &str) -> Vec<Value> {
    peer.received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.method == Method::POST && request.url.path() == inbox_path)
        .filter_map(|request| serde_json::from_slice::<Value>(&request.body).ok())
        .collect()
}

/// Wait up to `timeout` for `peer` to have received `n` POSTs at `inbox_path`
async fn await_deliveries(
    peer: &MockServer,
    inbox_path: &str,
    n: usize,
    timeout: Duration,
) -> Vec<Value> {
    let start = Instant::now();
    loop {
        let received = deliveries(peer, inbox_path).await;
        if received.len() >= n || start.elapsed() > timeout {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn post(url: &Url, body: &Value) -> Result<reqwest::Response, Failed> {
    reqwest::Client::new()
        .post(url.clone())
        .header(CONTENT_TYPE, ACTIVITY_JSON)
        .body(body.to_string())
        .send()
        .await?
        .pipe(Ok)
}

async fn get(url: &Url) -> Result<Value, Failed> {
    let response = reqwest::Client::new()
        .get(url.clone())
        .header(ACCEPT, ACTIVITY_JSON)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK, "GET {url}");
    Ok(response.json::<Value>().await?)
}

fn ordered_items(collection: &Value) -> Vec<Value> {
    collection["orderedItems"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

/// Delivering the same activity to an inbox twice results in one inbox entry, and one run of the
/// application's callback
pub async fn idempotent_inbox_post(instance: Arc<Instance>) -> Result<(), Failed> {
    instance.add_actor("ingrid")?;
    let inbox = instance.inbox("ingrid")?;
    let like = json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": "https://remote.example/likes/1",
        "type": "Like",
        "actor": "https://remote.example/users/bob",
        "object": "https://remote.example/notes/1",
    });

    assert_eq!(post(&inbox, &like).await?.status(), StatusCode::OK);
    assert_eq!(post(&inbox, &like).await?.status(), StatusCode::OK);

    let items = ordered_items(&get(&inbox).await?);
    assert_eq!(1, items.len());
    assert_eq!(1, instance.app.likes());
    Ok(())
}

/// A Note posted bare to an outbox is wrapped in a Create, attributed to the outbox's owner,
/// persisted & delivered once to each remote inbox
pub async fn bare_note_is_created_and_delivered(instance: Arc<Instance>) -> Result<(), Failed> {
    let alice = instance.add_actor("alice")?;
    let outbox = instance.outbox("alice")?;
    let peer1 = MockServer::start().await;
    let peer2 = MockServer::start().await;
    let bob = remote_actor(&peer1, "bob", 1).await?;
    let carol = remote_actor(&peer2, "carol", 1).await?;

    let rsp = post(
        &outbox,
        &json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Note",
            "content": "Hello, world",
            "to": [bob.as_str()],
            "cc": [carol.as_str()],
        }),
    )
    .await?;
    assert_eq!(rsp.status(), StatusCode::CREATED);
    let location = rsp
        .headers()
        .get(LOCATION)
        .ok_or_else(|| Failed::from("no Location header"))?
        .to_str()?
        .pipe(Url::parse)?;

    let create = get(&location).await?;
    assert_eq!(create["type"], "Create");
    assert_eq!(create["actor"], alice.as_str());
    let note = match &create["object"] {
        Value::String(iri) => get(&Url::parse(iri)?).await?,
        Value::Array(objects) if objects.len() == 1 => objects[0].clone(),
        note => note.clone(),
    };
    assert_eq!(note["type"], "Note");
    assert_eq!(note["attributedTo"], alice.as_str());

    let items = ordered_items(&get(&outbox).await?);
    assert!(items
        .iter()
        .any(|item| item == location.as_str() || item["id"] == location.as_str()));

    for (peer, inbox_path) in [(&peer1, "/users/bob/inbox"), (&peer2, "/users/carol/inbox")] {
        let received = await_deliveries(peer, inbox_path, 1, Duration::from_secs(5)).await;
        assert_eq!(1, received.len(), "deliveries to {inbox_path}");
        assert_eq!(received[0]["type"], "Create");
        assert_eq!(received[0]["id"], location.as_str());
        assert!(received[0].get("bto").is_none() && received[0].get("bcc").is_none());
    }
    // Nothing further should trickle in.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(1, deliveries(&peer1, "/users/bob/inbox").await.len());
    assert_eq!(1, deliveries(&peer2, "/users/carol/inbox").await.len());
    Ok(())
}

/// An inbox POST of something that isn't an activity is refused, and leaves no trace
pub async fn unrecognized_type_is_rejected(instance: Arc<Instance>) -> Result<(), Failed> {
    instance.add_actor("ursula")?;
    let inbox = instance.inbox("ursula")?;

    let rsp = post(
        &inbox,
        &json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": "https://remote.example/frobs/1",
            "type": "Frobnicate",
            "actor": "https://remote.example/users/bob",
        }),
    )
    .await?;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert!(ordered_items(&get(&inbox).await?).is_empty());
    Ok(())
}

/// Blocks are recorded, but never delivered to the blockee
pub async fn blocks_are_not_delivered(instance: Arc<Instance>) -> Result<(), Failed> {
    instance.add_actor("bertha")?;
    let outbox = instance.outbox("bertha")?;
    let peer = MockServer::start().await;
    let mallory = remote_actor(&peer, "mallory", 0).await?;

    let rsp = post(
        &outbox,
        &json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Block",
            "object": mallory.as_str(),
            "to": [mallory.as_str()],
        }),
    )
    .await?;
    assert_eq!(rsp.status(), StatusCode::CREATED);
    let location = rsp
        .headers()
        .get(LOCATION)
        .ok_or_else(|| Failed::from("no Location header"))?
        .to_str()?
        .pipe(Url::parse)?;
    assert_eq!(get(&location).await?["type"], "Block");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(deliveries(&peer, "/users/mallory/inbox").await.is_empty());
    Ok(())
}

/// Requests that aren't ActivityPub requests, or that name an actor we don't have, are turned away
pub async fn boxes_are_guarded(instance: Arc<Instance>) -> Result<(), Failed> {
    instance.add_actor("gerda")?;

    // Wrong Content-Type
    let rsp = reqwest::Client::new()
        .post(instance.inbox("gerda")?)
        .header(CONTENT_TYPE, "text/plain")
        .body("hello")
        .send()
        .await?;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

    // No such actor
    let rsp = post(
        &instance.inbox("nobody")?,
        &json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": "https://remote.example/likes/2",
            "type": "Like",
            "actor": "https://remote.example/users/bob",
            "object": "https://remote.example/notes/2",
        }),
    )
    .await?;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    Ok(())
}

/// A validly signed delivery is only accepted on behalf of the key's owner
pub async fn signers_speak_only_for_themselves(instance: Arc<Instance>) -> Result<(), Failed> {
    instance.add_actor("sigrid")?;
    let inbox = instance.inbox("sigrid")?;
    let peer = MockServer::start().await;
    let mallory = signing_actor(&peer, "mallory").await?;
    let bob = remote_actor(&peer, "bob", 0).await?;
    let transport = HttpSigTransport::new(
        "relaypub-test",
        Some(Arc::new(Signer::new(
            &format!("{mallory}#main-key"),
            private_key_from_pem(TEST_KEY)?,
        ))),
    )?;
    let announce = |actor: &Url, n: usize| {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": format!("{}/announces/{n}", peer.uri()),
            "type": "Announce",
            "actor": actor.as_str(),
            "object": "https://remote.example/notes/1",
        })
        .to_string()
        .pipe(Bytes::from)
    };

    // mallory puts words in bob's mouth
    match transport.deliver(announce(&bob, 1), &inbox).await {
        Err(transport::Error::Status { status, .. }) => assert_eq!(status, StatusCode::FORBIDDEN),
        other => return Err(format!("expected a 403, got {other:?}").into()),
    }
    assert!(ordered_items(&get(&inbox).await?).is_empty());

    // mallory speaks for herself
    transport.deliver(announce(&mallory, 2), &inbox).await?;
    assert_eq!(1, ordered_items(&get(&inbox).await?).len());
    Ok(())
}
