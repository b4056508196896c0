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

//! # Application hooks
//!
//! ActivityPub is really two protocols: the federating (server-to-server) protocol, spoken through
//! actors' inboxes, and the social (client-to-server) protocol, spoken through their outboxes. An
//! application may implement either or both. The behaviour they share (authenticating reads,
//! serving outboxes, creating transports) lives in [CommonBehavior].
//!
//! Each trait is the application's half of the contract; relaypub's half is in
//! [Actor](crate::actor::Actor).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::request::Parts;
use url::Url;

use crate::{ap_entities::Object, callbacks::Callbacks, transport::Transport};

/// An error returned by application code
///
/// relaypub never inspects these beyond logging them.
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

type Result<T> = std::result::Result<T, Error>;

/// The outcome of an authentication hook
#[derive(Debug)]
pub enum Authentication {
    /// Carry on processing the request
    Proceed,
    /// Stop here, and reply with this response (a 401 or 403, typically)
    Halt(http::Response<Bytes>),
}

#[async_trait]
pub trait CommonBehavior: Send + Sync {
    async fn authenticate_get_inbox(&self, request: &Parts) -> Result<Authentication>;
    async fn authenticate_get_outbox(&self, request: &Parts) -> Result<Authentication>;
    /// Return the outbox at `outbox` (or the page thereof `request` names)
    async fn get_outbox(&self, request: &Parts, outbox: &Url) -> Result<Object>;
    /// Return a [Transport] acting on behalf of the actor owning the inbox or outbox `box_iri`
    async fn new_transport(&self, box_iri: &Url) -> Result<Arc<dyn Transport>>;
    /// May `object` be added to the collection `target`?
    async fn can_add(&self, _object: &Url, _target: &Url) -> Result<bool> {
        Ok(true)
    }
    /// May `object` be removed from the collection `target`?
    async fn can_remove(&self, _object: &Url, _target: &Url) -> Result<bool> {
        Ok(true)
    }
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait]
pub trait FederatingProtocol: Send + Sync {
    /// Called on every inbound activity before anything else is done with it; useful for (e.g.)
    /// stashing it for use by later hooks
    async fn post_inbox_request_body_hook(&self, _request: &Parts, _activity: &Object) -> Result<()> {
        Ok(())
    }
    /// Authenticate an inbound POST; `body` is the raw request body
    async fn authenticate_post_inbox(&self, request: &Parts, body: &[u8]) -> Result<Authentication>;
    /// Return true if any of `actors` is blocked
    async fn blocked(&self, actors: &[Url]) -> Result<bool>;
    fn federating_callbacks(&self) -> Arc<Callbacks>;
    /// Handle an inbound activity for which no other callback applies
    async fn default_callback(&self, _activity: &Object) -> Result<()> {
        Ok(())
    }
    /// Zero or less means "unbounded"
    fn max_inbox_forwarding_recursion_depth(&self) -> i64;
    /// Zero or less means "unbounded"
    fn max_delivery_recursion_depth(&self) -> i64;
    /// Trim `potential_recipients` of an activity being forwarded
    async fn filter_forwarding(
        &self,
        potential_recipients: Vec<Url>,
        activity: &Object,
    ) -> Result<Vec<Url>>;
    /// Return the inbox at `inbox` (or the page thereof `request` names)
    async fn get_inbox(&self, request: &Parts, inbox: &Url) -> Result<Object>;
}

#[async_trait]
pub trait SocialProtocol: Send + Sync {
    async fn post_outbox_request_body_hook(&self, _request: &Parts, _activity: &Object) -> Result<()> {
        Ok(())
    }
    async fn authenticate_post_outbox(&self, request: &Parts) -> Result<Authentication>;
    fn social_callbacks(&self) -> Arc<Callbacks>;
    /// Handle an outbound activity for which no other callback applies
    async fn default_callback(&self, _activity: &Object) -> Result<()> {
        Ok(())
    }
}
