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

//! # relaypub as an HTTP client
//!
//! [make_client] assembles the [tower] stack behind every outbound request: it fills in `Host` &
//! `Date`, signs the request on behalf of a local actor, sets the `User-Agent`, and counts requests &
//! responses by host & status class. Bodies are [Bytes] in both directions.

use std::{
    fmt::Debug,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{
    header::{DATE, HOST, USER_AGENT},
    HeaderName, HeaderValue,
};
use opentelemetry::KeyValue;
use picky::key::PrivateKey;
use pin_project::pin_project;
use snafu::{ResultExt, Snafu};
use tap::Pipe;
use tower::{util::BoxCloneSyncService, Layer, Service, ServiceBuilder};
use tower_http::set_header::SetRequestHeaderLayer;
use tracing::{debug, error, Level};

use relaypub_shared::service::{self, ReqwestServiceLayer};

use crate::{authn::compute_signature, define_metric};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{user_agent} is not a valid User-Agent: {source}"))]
    UserAgent {
        user_agent: String,
        source: http::header::InvalidHeaderValue,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The type of HTTP client [make_client] produces
pub type Client = BoxCloneSyncService<http::Request<Bytes>, http::Response<Bytes>, service::Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       InstrumentedService                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "client.requests",                client_requests,                Sort::IntegralCounter }
define_metric! { "client.errors",                  client_errors,                  Sort::IntegralCounter }
define_metric! { "client.responses.informational", client_responses_informational, Sort::IntegralCounter }
define_metric! { "client.responses.success",       client_responses_success,       Sort::IntegralCounter }
define_metric! { "client.responses.redirect",      client_responses_redirect,      Sort::IntegralCounter }
define_metric! { "client.responses.client_error",  client_responses_client_error,  Sort::IntegralCounter }
define_metric! { "client.responses.server_error",  client_responses_server_error,  Sort::IntegralCounter }
define_metric! { "client.responses.unknown",       client_responses_unknown,       Sort::IntegralCounter }

/// A [Future] wrapping a request in flight that logs & counts its outcome
#[pin_project]
pub struct InstrumentedServiceFuture<InnerFut> {
    host: String,
    span: tracing::Span,
    #[pin]
    inner: InnerFut,
}

impl<RspBody, E, InnerFut> Future for InstrumentedServiceFuture<InnerFut>
where
    InnerFut: Future<Output = std::result::Result<http::Response<RspBody>, E>>,
    E: std::error::Error,
{
    type Output = std::result::Result<http::Response<RspBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.span.enter();
        let rsp = match this.inner.poll(cx) {
            Poll::Ready(rsp) => rsp,
            Poll::Pending => return Poll::Pending,
        };
        let host = KeyValue::new("host", this.host.clone());
        match &rsp {
            Ok(rsp) => {
                match rsp.status().as_u16() {
                    100..=199 => client_responses_informational.deref(),
                    200..=299 => client_responses_success.deref(),
                    300..=399 => client_responses_redirect.deref(),
                    400..=499 => client_responses_client_error.deref(),
                    500..=599 => client_responses_server_error.deref(),
                    _ => client_responses_unknown.deref(),
                }
                .add(1, &[host]);
                debug!("{} responded with status {}", this.host, rsp.status());
            }
            Err(err) => {
                error!("While sending a request to {}, got {}", this.host, err);
                client_errors.add(1, &[host]);
            }
        }
        Poll::Ready(rsp)
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedService<S> {
    inner: S,
}

impl<S, ReqBody, RspBody> Service<http::Request<ReqBody>> for InstrumentedService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<RspBody>>,
    S::Error: std::error::Error,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = InstrumentedServiceFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let host = request.uri().host().unwrap_or("localhost").to_owned();
        let span = tracing::span!(Level::DEBUG, "relaypub-client-call", host = %host);
        debug!("{} {}", request.method(), request.uri());
        client_requests.add(1, &[KeyValue::new("host", host.clone())]);
        InstrumentedServiceFuture {
            host,
            span,
            inner: self.inner.call(request),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedLayer;

impl<S> Layer<S> for InstrumentedLayer {
    type Service = InstrumentedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentedService { inner }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        request headers                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The key with which outbound requests are signed on behalf of a local actor
pub struct Signer {
    key_id: String,
    private_key: PrivateKey,
}

impl Signer {
    pub fn new(key_id: &str, private_key: PrivateKey) -> Signer {
        Signer {
            key_id: key_id.to_owned(),
            private_key,
        }
    }
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
    fn sign<B>(&self, request: &http::Request<B>) -> Option<HeaderValue> {
        compute_signature(request, &self.key_id, &self.private_key)
            .inspect_err(|err| error!("Failed to sign a request to {}: {err}", request.uri()))
            .ok()
    }
}

impl Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signer {{ key_id: {} }}", self.key_id)
    }
}

fn add_date<B>(_request: &http::Request<B>) -> Option<HeaderValue> {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
        .pipe(|date| HeaderValue::from_str(&date).ok())
}

// Take care to include the port, if present.
fn add_host<B>(request: &http::Request<B>) -> Option<HeaderValue> {
    request
        .uri()
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
}

/// Build the [tower] [Service] used for all outbound ActivityPub traffic
///
/// Requests pass through, in order:
///
/// ```text
///     Host (if absent) -> Date (if absent) -> Signature (if a signer was given)
///         -> User-Agent -> instrumentation -> reqwest
/// ```
///
/// Signing comes after Host & Date since the signature covers both. Callers sending a body must
/// set `Content-Type` & `Digest` themselves.
pub fn make_client(user_agent: &str, signer: Option<Arc<Signer>>) -> Result<Client> {
    let user_agent = HeaderValue::from_str(user_agent).context(UserAgentSnafu {
        user_agent: user_agent.to_owned(),
    })?;
    let sign = move |request: &http::Request<Bytes>| {
        signer.as_ref().and_then(|signer| signer.sign(request))
    };

    ServiceBuilder::new()
        .layer(SetRequestHeaderLayer::if_not_present(
            HOST,
            add_host as for<'a> fn(&'a http::Request<Bytes>) -> Option<HeaderValue>,
        ))
        .layer(SetRequestHeaderLayer::if_not_present(
            DATE,
            add_date as for<'a> fn(&'a http::Request<Bytes>) -> Option<HeaderValue>,
        ))
        .layer(SetRequestHeaderLayer::if_not_present(
            HeaderName::from_static("signature"),
            sign,
        ))
        .layer(SetRequestHeaderLayer::overriding(USER_AGENT, user_agent))
        .layer(InstrumentedLayer)
        .layer(ReqwestServiceLayer)
        .service(reqwest::Client::new())
        .pipe(BoxCloneSyncService::new)
        .pipe(Ok)
}
