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

//! # relaypub-shared
//!
//! Names & types needed by more than one relaypub crate: the ActivityPub media types, the
//! ActivityStreams `@context` & "Public" collection IRIs, and the client-side [tower] plumbing in
//! [service].

use lazy_static::lazy_static;
use url::Url;

pub mod service;

/// The profiled JSON-LD media type the ActivityPub [recommendation] says servers must accept & produce
///
/// [recommendation]: https://www.w3.org/TR/activitypub/#server-to-server-interactions
pub const LD_JSON_PROFILE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// The short-hand media type most of the Fediverse actually sends
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Both ActivityPub media types, in order of preference
pub const ACTIVITY_PUB_MEDIA_TYPES: [&str; 2] = [LD_JSON_PROFILE, ACTIVITY_JSON];

/// The ActivityStreams JSON-LD context
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// The security vocabulary context (needed for `publicKey`)
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

lazy_static! {
    /// The special "Public" collection; addressing an activity to it makes it world-readable, but
    /// nothing is ever delivered *to* it.
    pub static ref PUBLIC: Url =
        Url::parse("https://www.w3.org/ns/activitystreams#Public").unwrap(/* known good */);
}

/// Return true if `text` names the Public collection
///
/// Implementations are permitted to use the compacted forms "as:Public" & "Public" in place of the
/// full IRI, so we check for all three.
pub fn is_public(text: &str) -> bool {
    text == PUBLIC.as_str() || text == "as:Public" || text == "Public"
}

/// Return true if an HTTP `Content-Type` or `Accept` header value names an ActivityPub media type
///
/// Whitespace is normalized first, since peers vary in whether they put a space after the `;`.
/// Matching is by containment so that an `Accept` header listing several types still matches.
pub fn is_activity_pub_media_type(header: &str) -> bool {
    let normalized = header
        .split(';')
        .map(str::trim)
        .collect::<Vec<&str>>()
        .join("; ");
    ACTIVITY_PUB_MEDIA_TYPES
        .iter()
        .any(|media_type| normalized.contains(media_type))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn media_types() {
        assert!(is_activity_pub_media_type("application/activity+json"));
        assert!(is_activity_pub_media_type(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(is_activity_pub_media_type(
            "application/ld+json;profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(is_activity_pub_media_type(
            "text/html, application/activity+json;q=0.9"
        ));
        assert!(!is_activity_pub_media_type("application/json"));
        assert!(!is_activity_pub_media_type("application/ld+json"));
    }

    #[test]
    fn public() {
        assert!(is_public("https://www.w3.org/ns/activitystreams#Public"));
        assert!(is_public("as:Public"));
        assert!(is_public("Public"));
        assert!(!is_public("https://example.com/users/public"));
    }
}
