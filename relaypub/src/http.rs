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

//! HTTP odds & ends shared by the protocol endpoints

use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{
    header::{ACCEPT, CONTENT_TYPE, DATE},
    request::Parts,
    Method, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use relaypub_shared::{is_activity_pub_media_type, LD_JSON_PROFILE};

use crate::{ap_entities::Object, authn::sha_256_digest};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to serialize a response body: {source}"))]
    Body { source: crate::ap_entities::Error },
    #[snafu(display("Failed to build a response: {source}"))]
    Build { source: http::Error },
    #[snafu(display("Failed to serialize an error response: {source}"))]
    ErrorBody { source: serde_json::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// A serializable struct for use in HTTP error responses
///
/// Peers get this much & no more: the detail stays in our logs.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Format `dt` per RFC 9110's IMF-fixdate
pub fn imf_fixdate(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Return true if `parts` describes a POST of an ActivityPub document
pub fn is_protocol_post(parts: &Parts) -> bool {
    parts.method == Method::POST
        && parts
            .headers
            .get_all(CONTENT_TYPE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(is_activity_pub_media_type)
}

/// Return true if `parts` describes a GET asking for an ActivityPub document
pub fn is_protocol_get(parts: &Parts) -> bool {
    parts.method == Method::GET
        && parts
            .headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(is_activity_pub_media_type)
}

/// A response with no body
pub fn status_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

/// A response with an [ErrorResponseBody]
pub fn error_response(status: StatusCode, error: impl Into<String>) -> Result<Response<Bytes>> {
    let body = serde_json::to_vec(&ErrorResponseBody {
        error: error.into(),
    })
    .context(ErrorBodySnafu)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))
        .context(BuildSnafu)
}

/// A response carrying `object` as JSON-LD, with Content-Type, Date & Digest headers
pub fn activity_response(
    status: StatusCode,
    object: &Object,
    now: &DateTime<Utc>,
) -> Result<Response<Bytes>> {
    let body = object.to_bytes().context(BodySnafu)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, LD_JSON_PROFILE)
        .header(DATE, imf_fixdate(now))
        .header("digest", sha_256_digest(&body))
        .body(body)
        .context(BuildSnafu)
}
