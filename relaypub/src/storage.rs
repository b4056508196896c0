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

//! # storage
//!
//! Abstractions for the relaypub storage layer.
//!
//! relaypub doesn't persist anything itself; the application supplies a [Database]. The runtime
//! only asks that each operation be atomic on its own, and that [Database::lock] give it exclusive
//! access to a given IRI for the duration of a read-modify-write sequence.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use url::Url;

use crate::ap_entities::Object;

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// A held lock on one IRI; the lock is released when this is dropped
///
/// Backends may hold whatever they like in here (a mutex guard, a lease on a distributed lock...).
pub struct LockGuard {
    _inner: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn new(inner: impl Send + Sync + 'static) -> LockGuard {
        LockGuard {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockGuard")
    }
}

/// Per-IRI async mutexes, for backends that don't have a locking primitive of their own
///
/// Entries are created on demand (so locking an IRI that names nothing succeeds) and pruned once
/// nobody holds or awaits them.
#[derive(Debug, Default)]
pub struct IriLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IriLocks {
    pub fn new() -> IriLocks {
        IriLocks::default()
    }
    pub async fn lock(&self, iri: &Url) -> LockGuard {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks
                .entry(iri.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        LockGuard::new(mutex.lock_owned().await)
    }
}

/// The persistence operations the protocol runtime needs
///
/// Collection-valued results (inboxes, outboxes, followers &c) are returned as ActivityStreams
/// `OrderedCollection`s or `OrderedCollectionPage`s.
#[async_trait]
pub trait Database: Send + Sync {
    /// Take exclusive access to `id`, whether or not anything by that IRI exists
    async fn lock(&self, id: &Url) -> Result<LockGuard, Error>;
    /// Return true if the inbox at `inbox` already holds the activity `id`
    async fn inbox_contains(&self, inbox: &Url, id: &Url) -> Result<bool, Error>;
    /// Retrieve (the latest page of) an inbox
    async fn get_inbox(&self, inbox: &Url) -> Result<Object, Error>;
    /// Persist an inbox page previously retrieved with [Database::get_inbox]
    async fn set_inbox(&self, inbox: &Object) -> Result<(), Error>;
    /// Return true if this server is the authority for `id`
    async fn owns(&self, id: &Url) -> Result<bool, Error>;
    async fn actor_for_outbox(&self, outbox: &Url) -> Result<Url, Error>;
    async fn actor_for_inbox(&self, inbox: &Url) -> Result<Url, Error>;
    async fn outbox_for_inbox(&self, inbox: &Url) -> Result<Url, Error>;
    async fn exists(&self, id: &Url) -> Result<bool, Error>;
    async fn get(&self, id: &Url) -> Result<Object, Error>;
    async fn create(&self, object: &Object) -> Result<(), Error>;
    async fn update(&self, object: &Object) -> Result<(), Error>;
    async fn delete(&self, id: &Url) -> Result<(), Error>;
    async fn get_outbox(&self, outbox: &Url) -> Result<Object, Error>;
    async fn set_outbox(&self, outbox: &Object) -> Result<(), Error>;
    /// Mint a fresh IRI for `object`, which is about to be created on this server
    async fn new_id(&self, object: &Object) -> Result<Url, Error>;
    async fn followers(&self, actor: &Url) -> Result<Object, Error>;
    async fn following(&self, actor: &Url) -> Result<Object, Error>;
    async fn liked(&self, actor: &Url) -> Result<Object, Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn iri_locks_are_exclusive() {
        let locks = Arc::new(IriLocks::new());
        let a = Url::parse("https://relaypub.example/objects/a").unwrap();
        let b = Url::parse("https://relaypub.example/objects/b").unwrap();

        let guard = locks.lock(&a).await;
        // A different IRI is unaffected...
        let _other = tokio::time::timeout(Duration::from_millis(50), locks.lock(&b))
            .await
            .unwrap();
        // ...but the same IRI blocks until the guard is dropped
        let contended = {
            let locks = locks.clone();
            let a = a.clone();
            tokio::spawn(async move { locks.lock(&a).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished());
        drop(guard);
        let _guard = tokio::time::timeout(Duration::from_secs(1), contended)
            .await
            .unwrap()
            .unwrap();
    }
}
