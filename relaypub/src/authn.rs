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

//! # HTTP signatures & digests
//!
//! ActivityPub peers authenticate one another with HTTP signatures. The version in wide use across
//! the Fediverse is "[draft cavage]" (not the later [RFC 9421], which nobody seems to speak), which
//! in turn covers the body through the [RFC-3230] `Digest` header.
//!
//! [draft cavage]: https://datatracker.ietf.org/doc/html/draft-cavage-http-signatures-12
//! [RFC 9421]: https://www.rfc-editor.org/rfc/rfc9421.html
//! [RFC-3230]: https://datatracker.ietf.org/doc/html/rfc3230
//!
//! This module produces & checks both. [verify_delivery] goes one step further for inbound
//! deliveries: it dereferences the `keyId` to find the key & its owner. Whether that owner may
//! speak for a given activity is [attributable_to]'s call; a valid signature on its own only says
//! *somebody* sent the request.

use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, HeaderValue};
use itertools::Itertools;
use picky::{
    hash::HashAlgorithm,
    http::{
        http_signature::{Header, HttpSigAlgorithm, HttpSignatureBuilder},
        HttpSignature,
    },
    key::{PrivateKey, PublicKey},
    signature::SignatureAlgorithm,
};
use serde_json::Value;
use sha2::Digest;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tap::Pipe;
use url::Url;

use crate::{
    ap_entities::{self, Object},
    transport::{self, Transport},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The signature keyId {key_id} is not an IRI: {source}"))]
    BadKeyId {
        key_id: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Signature verification failed: {source}"))]
    BadSignature {
        source: picky::http::http_signature::HttpSignatureError,
    },
    #[snafu(display("Computed digest {computed} did not match the reported digest {reported}"))]
    ContentDigest {
        computed: String,
        reported: String,
        backtrace: Backtrace,
    },
    #[snafu(display("(created) or (expires) covered without a usable parameter"))]
    CreatedExpires { backtrace: Backtrace },
    #[snafu(display("The Date header {date} is too far from the current time"))]
    DateSkew { date: String, backtrace: Backtrace },
    #[snafu(display("The Date header couldn't be parsed"))]
    DateParse { backtrace: Backtrace },
    #[snafu(display("The document holding {key_id} couldn't be parsed: {source}"))]
    KeyDocument {
        key_id: Url,
        source: ap_entities::Error,
    },
    #[snafu(display("Failed to retrieve the key {key_id}: {source}"))]
    KeyFetch {
        key_id: Url,
        source: transport::Error,
    },
    #[snafu(display("The request body is not covered by the signature"))]
    MissingContentDigest { backtrace: Backtrace },
    #[snafu(display("In order to sign a request, it must contain a {name} header"))]
    MissingHeader {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("No owner on this host could be found for the key {key_id}"))]
    NoKeyOwner { key_id: Url, backtrace: Backtrace },
    #[snafu(display("No public key could be found at {key_id}"))]
    NoPublicKey { key_id: Url, backtrace: Backtrace },
    #[snafu(display("Exactly one Signature header expected"))]
    OneSignature { backtrace: Backtrace },
    #[snafu(display("Exactly one SHA-256 Digest header expected"))]
    OneContentDigest { backtrace: Backtrace },
    #[snafu(display("Failed to parse a PEM-encoded key: {source}"))]
    Pem {
        source: picky::key::KeyError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to form an HTTP signature: {source}"))]
    Signature {
        source: picky::http::http_signature::HttpSignatureError,
    },
    #[snafu(display("Failed to parse the Signature header: {source}"))]
    SignatureParse {
        source: picky::http::http_signature::HttpSignatureError,
    },
    #[snafu(display("The generated value was not a valid header value: {source}"))]
    ToHeaderValue {
        source: http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
    #[snafu(display("A header value was not valid UTF-8: {source}"))]
    ToStr {
        source: http::header::ToStrError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// How far a signed request's `Date` may stray from our clock
pub const MAX_DATE_SKEW: chrono::Duration = chrono::Duration::hours(12);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            digests                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Compute the value of a `Digest` header for `body`
pub fn sha_256_digest(body: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64_STANDARD.encode(hasher.finalize().as_slice()))
}

/// Compute the SHA-256 digest of `body` and compare it to the `Digest` header in `headers`
///
/// The algorithm name is case-insensitive; the base64 value is not.
pub fn check_sha_256_content_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let reported = headers
        .get_all("digest")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| value.to_lowercase().starts_with("sha-256="))
        .exactly_one()
        .map_err(|_| OneContentDigestSnafu.build())?;

    let computed = sha_256_digest(body);
    ensure!(
        computed[8..] == reported[8..],
        ContentDigestSnafu {
            computed,
            reported: reported.to_owned(),
        }
    );
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        signing requests                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn private_key_from_pem(pem: &str) -> Result<PrivateKey> {
    PrivateKey::from_pem_str(pem).context(PemSnafu)
}

pub fn public_key_from_pem(pem: &str) -> Result<PublicKey> {
    PublicKey::from_pem_str(pem).context(PemSnafu)
}

/// Copy the method, URI & headers of `request` into a fresh [http::request::Parts]
fn parts_of<B>(request: &http::Request<B>) -> http::request::Parts {
    let (mut parts, _) = http::Request::new(()).into_parts();
    parts.method = request.method().clone();
    parts.uri = request.uri().clone();
    parts.version = request.version();
    parts.headers = request.headers().clone();
    parts
}

/// Compute a draft-cavage `Signature` header value for `request`
///
/// The signature always covers `(request-target)`, `host` & `date`, which must therefore be present.
/// Requests carrying a body must also carry `digest` & `content-type`, both of which are covered.
pub fn compute_signature<B>(
    request: &http::Request<B>,
    key_id: &str,
    private_key: &PrivateKey,
) -> Result<HeaderValue> {
    let parts = parts_of(request);
    ensure!(
        parts.headers.contains_key(header::HOST),
        MissingHeaderSnafu { name: "Host" }
    );
    ensure!(
        parts.headers.contains_key(header::DATE),
        MissingHeaderSnafu { name: "Date" }
    );

    let http_signature = if parts.headers.contains_key("digest") {
        ensure!(
            parts.headers.contains_key(header::CONTENT_TYPE),
            MissingHeaderSnafu {
                name: "Content-Type"
            }
        );
        HttpSignatureBuilder::new()
            .key_id(key_id)
            .signature_method(
                private_key,
                SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA2_256),
            )
            // `picky::http::http_request::HttpRequest` is implemented for `http::request::Parts`
            // under the `http_trait_impl` feature
            .generate_signing_string_using_http_request(&parts)
            .request_target()
            .http_header(header::HOST.as_str())
            .http_header(header::DATE.as_str())
            .http_header("digest")
            .http_header(header::CONTENT_TYPE.as_str())
            .build()
            .context(SignatureSnafu)?
    } else {
        HttpSignatureBuilder::new()
            .key_id(key_id)
            .signature_method(
                private_key,
                SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA2_256),
            )
            .generate_signing_string_using_http_request(&parts)
            .request_target()
            .http_header(header::HOST.as_str())
            .http_header(header::DATE.as_str())
            .build()
            .context(SignatureSnafu)?
    };

    HeaderValue::from_str(&http_signature.to_string()).context(ToHeaderValueSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      verifying requests                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Parse the `Signature` header on an inbound request
///
/// Mastodon sends a `Signature` header rather than `Authorization: Signature ...` as the draft
/// describes; like everyone else, we follow Mastodon.
pub fn parse_signature(headers: &HeaderMap) -> Result<HttpSignature> {
    headers
        .get_all("signature")
        .iter()
        .exactly_one()
        .map_err(|_| OneSignatureSnafu.build())?
        .to_str()
        .context(ToStrSnafu)?
        .parse::<HttpSignature>()
        .context(SignatureParseSnafu)
}

/// The key ID named by a parsed signature, as an IRI
pub fn key_id(http_signature: &HttpSignature) -> Result<Url> {
    Url::parse(&http_signature.key_id).context(BadKeyIdSnafu {
        key_id: http_signature.key_id.clone(),
    })
}

/// Draft cavage section 2.3, item 2: `(created)` & `(expires)` may not be covered when the
/// algorithm is `rsa*`, `hmac*` or `ecdsa*`, and require the corresponding signature parameter.
pub fn enforce_cavage_2_3_2_3(http_signature: &HttpSignature) -> Result<()> {
    let restricted = match &http_signature.algorithm {
        Some(HttpSigAlgorithm::Known(SignatureAlgorithm::RsaPkcs1v15(_)))
        | Some(HttpSigAlgorithm::Known(SignatureAlgorithm::Ecdsa(_))) => true,
        Some(HttpSigAlgorithm::Custom(name)) => {
            name.starts_with("rsa") || name.starts_with("hmac") || name.starts_with("ecdsa")
        }
        _ => false,
    };
    let covers = |h: &Header| http_signature.headers.contains(h);
    ensure!(
        !covers(&Header::Created) || (!restricted && http_signature.created.is_some()),
        CreatedExpiresSnafu
    );
    ensure!(
        !covers(&Header::Expires) || (!restricted && http_signature.expires.is_some()),
        CreatedExpiresSnafu
    );
    Ok(())
}

fn check_date(headers: &HeaderMap, now: &DateTime<Utc>) -> Result<()> {
    let date = headers
        .get(header::DATE)
        .context(MissingHeaderSnafu { name: "Date" })?
        .to_str()
        .context(ToStrSnafu)?;
    let then = DateTime::parse_from_rfc2822(date)
        .map_err(|_| DateParseSnafu.build())?
        .with_timezone(&Utc);
    ensure!(
        (*now - then).abs() <= MAX_DATE_SKEW,
        DateSkewSnafu {
            date: date.to_owned()
        }
    );
    Ok(())
}

/// Verify the HTTP signature on an inbound request against `public_key`
///
/// `http_signature` should be the result of [parse_signature] on the same request. A non-empty body
/// must be covered by a `digest` header that matches it.
pub fn verify_signature(
    parts: &http::request::Parts,
    body: &[u8],
    http_signature: &HttpSignature,
    public_key: &PublicKey,
    now: &DateTime<Utc>,
) -> Result<()> {
    enforce_cavage_2_3_2_3(http_signature)?;
    check_date(&parts.headers, now)?;
    if !body.is_empty() {
        ensure!(
            http_signature
                .headers
                .iter()
                .any(|h| h == &Header::Name("digest".to_owned())),
            MissingContentDigestSnafu
        );
        check_sha_256_content_digest(&parts.headers, body)?;
    }
    http_signature
        .verifier()
        .signature_method(
            public_key,
            SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA2_256),
        )
        .generate_signing_string_using_http_request(parts)
        .now(now.timestamp() as u64)
        .verify()
        .context(BadSignatureSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      inbound deliveries                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The key that signed an inbound request, and the actor to whom it belongs
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedKey {
    pub key_id: Url,
    pub owner: Url,
}

/// The `publicKey` entry in `document` describing `key_id`
fn key_entry<'a>(key_id: &Url, document: &'a Object) -> Option<&'a Value> {
    match document.get("publicKey")? {
        Value::Array(keys) => keys
            .iter()
            .find(|key| key.get("id").and_then(Value::as_str) == Some(key_id.as_str())),
        key => Some(key),
    }
}

fn public_key_pem<'a>(key_id: &Url, document: &'a Object) -> Option<&'a str> {
    document
        .get_str("publicKeyPem")
        .or_else(|| key_entry(key_id, document)?.get("publicKeyPem")?.as_str())
}

/// The actor owning `key_id`, as described by `document` (the document to which `key_id` refers)
///
/// That's the `owner` of a standalone key document, else the `owner` of the matching `publicKey`,
/// else the actor whose document it is. An owner on a different host from the key is never
/// believed.
pub fn key_owner(key_id: &Url, document: &Object) -> Option<Url> {
    let owner = match document.get_str("owner") {
        Some(owner) => Url::parse(owner).ok()?,
        None => key_entry(key_id, document)
            .and_then(|key| key.get("owner"))
            .and_then(Value::as_str)
            .and_then(|owner| Url::parse(owner).ok())
            .or_else(|| document.id())?,
    };
    (owner.host_str() == key_id.host_str()).then_some(owner)
}

fn without_fragment(iri: &Url) -> Url {
    let mut iri = iri.clone();
    iri.set_fragment(None);
    iri
}

/// True if the owner of a signing key may speak for `activity`
///
/// Every one of the activity's actors must be `owner`, and the activity's id (if any) must live on
/// `owner`'s host.
pub fn attributable_to(owner: &Url, activity: &Object) -> bool {
    let owner = without_fragment(owner);
    let actors = activity.iris("actor");
    !actors.is_empty()
        && actors.iter().all(|actor| without_fragment(actor) == owner)
        && activity
            .id()
            .map(|id| id.host_str() == owner.host_str())
            .unwrap_or(true)
}

/// Verify the signature on an inbound delivery, fetching the signing key through `transport`
pub async fn verify_delivery(
    transport: &dyn Transport,
    parts: &http::request::Parts,
    body: &[u8],
    now: &DateTime<Utc>,
) -> Result<VerifiedKey> {
    let http_signature = parse_signature(&parts.headers)?;
    let key_id = key_id(&http_signature)?;
    let document = transport
        .dereference(&without_fragment(&key_id))
        .await
        .context(KeyFetchSnafu {
            key_id: key_id.clone(),
        })?;
    let document = Object::from_slice(&document).context(KeyDocumentSnafu {
        key_id: key_id.clone(),
    })?;
    let public_key = public_key_pem(&key_id, &document)
        .context(NoPublicKeySnafu {
            key_id: key_id.clone(),
        })?
        .pipe(public_key_from_pem)?;
    let owner = key_owner(&key_id, &document).context(NoKeyOwnerSnafu {
        key_id: key_id.clone(),
    })?;
    verify_signature(parts, body, &http_signature, &public_key, now)?;
    Ok(VerifiedKey { key_id, owner })
}

#[cfg(test)]
mod test {
    use super::*;

    use bytes::Bytes;
    use http::Method;
    use serde_json::json;

    use crate::transport::fake::FakeTransport;

    const TEST_KEY: &str = include_str!("../tests/data/test-key.pem");
    const TEST_PUB_KEY: &str = include_str!("../tests/data/test-key.pub.pem");

    fn imf_fixdate(dt: &DateTime<Utc>) -> String {
        dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    fn signed_post(body: &'static [u8], now: &DateTime<Utc>) -> http::Request<Bytes> {
        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri("https://b.example/users/bob/inbox")
            .header(header::HOST, "b.example")
            .header(header::DATE, imf_fixdate(now))
            .header(header::CONTENT_TYPE, relaypub_shared::LD_JSON_PROFILE)
            .header("digest", sha_256_digest(body))
            .body(Bytes::from_static(body))
            .unwrap();
        let key = private_key_from_pem(TEST_KEY).unwrap();
        let signature = compute_signature(
            &request,
            "https://relaypub.example/users/alice#main-key",
            &key,
        )
        .unwrap();
        request.headers_mut().insert("signature", signature);
        request
    }

    #[test]
    fn digests() {
        // echo -n "hello" | openssl dgst -sha256 -binary | base64
        assert_eq!(
            sha_256_digest(b"hello"),
            "SHA-256=LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ="
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            "digest",
            HeaderValue::from_static("sha-256=LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ="),
        );
        assert!(check_sha_256_content_digest(&headers, b"hello").is_ok());
        assert!(check_sha_256_content_digest(&headers, b"goodbye").is_err());
        assert!(check_sha_256_content_digest(&HeaderMap::new(), b"hello").is_err());
    }

    #[test]
    fn sign_and_verify() {
        let now = Utc::now();
        let body: &'static [u8] = br#"{"type":"Follow"}"#;
        let request = signed_post(body, &now);

        let http_signature = parse_signature(request.headers()).unwrap();
        assert_eq!(
            key_id(&http_signature).unwrap().as_str(),
            "https://relaypub.example/users/alice#main-key"
        );
        let public_key = public_key_from_pem(TEST_PUB_KEY).unwrap();
        let (parts, body) = request.into_parts();
        verify_signature(&parts, &body, &http_signature, &public_key, &now).unwrap();

        // Tamper with the body...
        assert!(verify_signature(
            &parts,
            br#"{"type":"Block"}"#,
            &http_signature,
            &public_key,
            &now
        )
        .is_err());
        // or replay it a day later
        assert!(verify_signature(
            &parts,
            &body,
            &http_signature,
            &public_key,
            &(now + chrono::Duration::days(1))
        )
        .is_err());
    }

    #[tokio::test]
    async fn deliveries_are_attributed_to_key_owners() {
        let now = Utc::now();
        let transport = FakeTransport::new();
        transport.serve(
            &Object::from_value(json!({
                "type": "Person",
                "id": "https://relaypub.example/users/alice",
                "inbox": "https://relaypub.example/users/alice/inbox",
                "publicKey": {
                    "id": "https://relaypub.example/users/alice#main-key",
                    "owner": "https://relaypub.example/users/alice",
                    "publicKeyPem": TEST_PUB_KEY
                }
            }))
            .unwrap(),
        );
        let body: &'static [u8] = br#"{"type":"Follow"}"#;
        let (parts, body) = signed_post(body, &now).into_parts();
        let verified = verify_delivery(&transport, &parts, &body, &now).await.unwrap();
        assert_eq!(
            verified.owner,
            Url::parse("https://relaypub.example/users/alice").unwrap()
        );

        let by = |actor: &str, id: &str| {
            Object::from_value(json!({"type": "Like", "id": id, "actor": actor})).unwrap()
        };
        assert!(attributable_to(
            &verified.owner,
            &by(
                "https://relaypub.example/users/alice",
                "https://relaypub.example/likes/1"
            )
        ));
        // A good signature from alice says nothing about bob...
        assert!(!attributable_to(
            &verified.owner,
            &by("https://b.example/users/bob", "https://b.example/likes/1")
        ));
        // ...nor about activities minted elsewhere
        assert!(!attributable_to(
            &verified.owner,
            &by(
                "https://relaypub.example/users/alice",
                "https://b.example/likes/2"
            )
        ));
        assert!(!attributable_to(
            &verified.owner,
            &Object::from_value(json!({"type": "Like"})).unwrap()
        ));

        // Keys claiming owners on other hosts aren't believed
        let forged = Object::from_value(json!({
            "type": "Key",
            "id": "https://evil.example/keys/1",
            "owner": "https://relaypub.example/users/alice",
            "publicKeyPem": TEST_PUB_KEY
        }))
        .unwrap();
        assert!(key_owner(&Url::parse("https://evil.example/keys/1").unwrap(), &forged).is_none());
    }

    #[test]
    fn signing_requires_headers() {
        let request = http::Request::builder()
            .method(Method::GET)
            .uri("https://b.example/users/bob")
            .body(())
            .unwrap();
        let key = private_key_from_pem(TEST_KEY).unwrap();
        assert!(matches!(
            compute_signature(&request, "https://relaypub.example/users/alice#main-key", &key),
            Err(Error::MissingHeader { name: "Host", .. })
        ));
    }
}
