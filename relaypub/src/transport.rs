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

//! # Authenticated transport
//!
//! Everything relaypub sends to, or fetches from, a peer goes through a [Transport]. The stock
//! implementation, [HttpSigTransport], signs each request on behalf of a local actor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use http::{
    header::{ACCEPT, CONTENT_TYPE},
    Method, StatusCode,
};
use snafu::{ensure, ResultExt, Snafu};
use tower::ServiceExt;
use tracing::{debug, info};
use url::Url;

use relaypub_shared::{service, ACTIVITY_PUB_MEDIA_TYPES, LD_JSON_PROFILE};

use crate::{
    authn::sha_256_digest,
    client::{self, make_client, Client, Signer},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{} of {} deliveries failed", failures.len(), attempted))]
    Batch {
        attempted: usize,
        failures: Vec<(Url, Error)>,
    },
    #[snafu(display("Failed to build an HTTP client: {source}"))]
    Client { source: client::Error },
    #[snafu(display("While requesting {iri}, {source}"))]
    Request { iri: Url, source: service::Error },
    #[snafu(display("Failed to form a request to {iri}: {source}"))]
    RequestBuild { iri: Url, source: http::Error },
    #[snafu(display("{iri} responded with status {status}"))]
    Status { iri: Url, status: StatusCode },
    #[snafu(display("Transport failure: {source}"))]
    Other {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    /// Wrap an application-defined error for use from a custom [Transport]
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Other {
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Transport                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the document at `iri`; anything other than a 200 is an error
    async fn dereference(&self, iri: &Url) -> Result<Bytes>;
    /// POST `body` to the inbox at `to`; any 2xx status counts as success
    async fn deliver(&self, body: Bytes, to: &Url) -> Result<()>;
    /// Deliver `body` to every inbox in `recipients` concurrently
    ///
    /// Every delivery is attempted; if any fail, the failures are collected into a single
    /// [Error::Batch].
    async fn batch_deliver(&self, body: Bytes, recipients: &[Url]) -> Result<()> {
        let results =
            join_all(recipients.iter().map(|to| self.deliver(body.clone(), to))).await;
        let failures = recipients
            .iter()
            .zip(results)
            .filter_map(|(to, result)| result.err().map(|err| (to.clone(), err)))
            .collect::<Vec<(Url, Error)>>();
        ensure!(
            failures.is_empty(),
            BatchSnafu {
                attempted: recipients.len(),
                failures
            }
        );
        Ok(())
    }
}

/// A [Transport] that signs each request with a draft-cavage HTTP signature
#[derive(Clone)]
pub struct HttpSigTransport {
    client: Client,
}

impl HttpSigTransport {
    /// Build a transport sending on behalf of whoever owns `signer`; pass `None` for unsigned
    /// requests
    pub fn new(user_agent: &str, signer: Option<Arc<Signer>>) -> Result<HttpSigTransport> {
        Ok(HttpSigTransport {
            client: make_client(user_agent, signer).context(ClientSnafu)?,
        })
    }
    pub fn with_client(client: Client) -> HttpSigTransport {
        HttpSigTransport { client }
    }
    async fn send(&self, iri: &Url, request: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
        self.client
            .clone()
            .oneshot(request)
            .await
            .context(RequestSnafu { iri: iri.clone() })
    }
}

#[async_trait]
impl Transport for HttpSigTransport {
    #[tracing::instrument(skip(self))]
    async fn dereference(&self, iri: &Url) -> Result<Bytes> {
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(iri.as_str())
            .header(ACCEPT, ACTIVITY_PUB_MEDIA_TYPES.join(", "))
            .body(Bytes::new())
            .context(RequestBuildSnafu { iri: iri.clone() })?;
        let response = self.send(iri, request).await?;
        ensure!(
            response.status() == StatusCode::OK,
            StatusSnafu {
                iri: iri.clone(),
                status: response.status()
            }
        );
        debug!("Dereferenced {iri}");
        Ok(response.into_body())
    }
    #[tracing::instrument(skip(self, body))]
    async fn deliver(&self, body: Bytes, to: &Url) -> Result<()> {
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(to.as_str())
            .header(CONTENT_TYPE, LD_JSON_PROFILE)
            .header("digest", sha_256_digest(&body))
            .body(body)
            .context(RequestBuildSnafu { iri: to.clone() })?;
        let response = self.send(to, request).await?;
        ensure!(
            response.status().is_success(),
            StatusSnafu {
                iri: to.clone(),
                status: response.status()
            }
        );
        info!("Delivered to {to}");
        Ok(())
    }
}


/// An in-memory [Transport] for unit tests: serves canned documents & records deliveries
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    use std::{collections::HashMap, sync::Mutex};

    use crate::ap_entities::Object;

    #[derive(Debug, Default)]
    pub struct FakeTransport {
        documents: Mutex<HashMap<String, Bytes>>,
        delivered: Mutex<Vec<(Url, Bytes)>>,
    }

    impl FakeTransport {
        pub fn new() -> FakeTransport {
            FakeTransport::default()
        }
        /// Make `object` available for dereferencing at its `id`
        pub fn serve(&self, object: &Object) {
            self.documents.lock().unwrap().insert(
                object.id().unwrap().to_string(),
                object.to_bytes().unwrap(),
            );
        }
        pub fn delivered(&self) -> Vec<(Url, Bytes)> {
            self.delivered.lock().unwrap().clone()
        }
        pub fn delivered_to(&self) -> Vec<Url> {
            self.delivered().into_iter().map(|(to, _)| to).collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn dereference(&self, iri: &Url) -> Result<Bytes> {
            self.documents
                .lock()
                .unwrap()
                .get(iri.as_str())
                .cloned()
                .ok_or_else(|| Error::Status {
                    iri: iri.clone(),
                    status: StatusCode::NOT_FOUND,
                })
        }
        async fn deliver(&self, body: Bytes, to: &Url) -> Result<()> {
            self.delivered.lock().unwrap().push((to.clone(), body));
            Ok(())
        }
    }
}
