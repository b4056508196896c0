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

//! Client-Side tower Services
//!
//! # Introduction
//!
//! Every outbound request relaypub makes (dereferencing a remote actor, delivering an activity to
//! a peer's inbox) wants the same treatment: Host & Date headers, an HTTP signature, a User-Agent,
//! and some instrumentation. On the server side that's what [tower] middleware is for, and
//! [tower-http] supplies most of the layers we need. The catch is that [tower-http] speaks the
//! [http] crate's request & response types while [reqwest], the client we actually want to use,
//! has its own.
//!
//! [ReqwestService] closes the gap: it wraps any [Service] that speaks [reqwest] and presents one
//! that speaks [http], with bodies modelled as [Bytes]. Stack whatever [tower-http] layers you like
//! on top of it.
//!
//! [tower-http]: https://docs.rs/tower-http/latest/tower_http/index.html
//!
//! This module also holds [RateLimit], the configuration type for outbound rate limiting.

use std::{
    error::Error as StdError,
    num::NonZeroU32,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use governor::Quota;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tower::Service;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While waiting for the response body, {source}"))]
    Body {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert an http request to a reqwest request: {source}"))]
    Conversion {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{num} requests per {duration:?} is not a valid rate limit"))]
    InvalidRateLimit {
        num: u32,
        duration: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("The wrapped service speaking reqwest errored-out on poll_ready: {source:?}"))]
    PollReady {
        source: Box<dyn StdError + Send + Sync>,
    },
    #[snafu(display("The reqwest service reported an error: {source}"))]
    Reqwest {
        source: Box<dyn StdError + Send + Sync>,
    },
    #[snafu(display("When building an http response, {source}"))]
    Response {
        source: http::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ReqwestService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Wrap a [tower] [Service] that deals in [reqwest] requests & responses so as to produce one that
/// works in terms of [http] requests & responses
#[derive(Clone, Debug)]
pub struct ReqwestService<S> {
    inner: S,
}

impl<S> ReqwestService<S> {
    pub fn new(inner: S) -> ReqwestService<S> {
        ReqwestService { inner }
    }
}

/// Read a [reqwest::Response] into an [http::Response] carrying the entire body
async fn into_http_response(rsp: reqwest::Response) -> Result<http::Response<Bytes>> {
    let builder = rsp.headers().iter().fold(
        http::Response::builder()
            .status(rsp.status())
            .version(rsp.version()),
        |builder, (name, value)| builder.header(name, value),
    );
    builder
        .body(rsp.bytes().await.context(BodySnafu)?)
        .context(ResponseSnafu)
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for ReqwestService<S>
where
    ReqBody: Into<reqwest::Body>,
    S: Service<reqwest::Request, Response = reqwest::Response>,
    S::Error: StdError + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = http::Response<Bytes>;
    type Error = Error;
    // convert, await the inner service, then await the body
    type Future = BoxFuture<'static, Result<http::Response<Bytes>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map(|res| res.map_err(|err| PollReadySnafu.into_error(Box::new(err))))
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        match reqwest::Request::try_from(request) {
            Ok(request) => {
                let fut = self.inner.call(request);
                async move {
                    let rsp = fut
                        .await
                        .map_err(|err| ReqwestSnafu.into_error(Box::new(err)))?;
                    into_http_response(rsp).await
                }
                .boxed()
            }
            Err(err) => future::ready(Err(ConversionSnafu.into_error(err))).boxed(),
        }
    }
}

/// A [tower::Layer] producing [ReqwestService]s
#[derive(Clone, Debug, Default)]
pub struct ReqwestServiceLayer;

impl<S> tower::Layer<S> for ReqwestServiceLayer {
    type Service = ReqwestService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReqwestService::new(inner)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          rate limits                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Express a rate limit in terms of requests per duration
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RateLimit {
    pub num: u32,
    pub duration: Duration,
}

impl RateLimit {
    /// Express this rate limit as a [governor] [Quota]; `num` requests may burst at once, after
    /// which cells are replenished at one per `duration / num`
    pub fn quota(&self) -> Result<Quota> {
        let burst = NonZeroU32::new(self.num).context(InvalidRateLimitSnafu {
            num: self.num,
            duration: self.duration,
        })?;
        Quota::with_period(self.duration / self.num)
            .context(InvalidRateLimitSnafu {
                num: self.num,
                duration: self.duration,
            })
            .map(|quota| quota.allow_burst(burst))
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            num: 10,
            duration: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tower::{Layer, ServiceExt};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn rate_limit_quotas() {
        let quota = RateLimit::default().quota().unwrap();
        assert_eq!(quota.burst_size().get(), 10);
        assert_eq!(quota.replenish_interval(), Duration::from_millis(100));

        assert!(RateLimit {
            num: 0,
            duration: Duration::from_secs(1)
        }
        .quota()
        .is_err());
        assert!(RateLimit {
            num: 3,
            duration: Duration::ZERO
        }
        .quota()
        .is_err());
    }

    #[tokio::test]
    async fn reqwest_service_smoke() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-relaypub", "yes")
                    .set_body_string("world"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let service = ReqwestServiceLayer.layer(reqwest::Client::new());
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("{}/hello", mock_server.uri()))
            .body(Bytes::new())
            .unwrap();
        let rsp = service.oneshot(request).await.unwrap();
        assert_eq!(rsp.status(), http::StatusCode::OK);
        assert_eq!(rsp.headers().get("x-relaypub").unwrap(), "yes");
        assert_eq!(rsp.body().as_ref(), b"world");
    }
}
