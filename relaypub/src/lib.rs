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

//! # relaypub
//!
//! A server-side runtime for the [ActivityPub] federated protocol.
//!
//! [ActivityPub]: https://www.w3.org/TR/activitypub/
//!
//! # Introduction
//!
//! relaypub does the protocol's bookkeeping so that applications don't have to: it accepts
//! activities at actors' inboxes & outboxes, applies the side effects the recommendation prescribes
//! (following, liking, tombstoning deleted objects &c), forwards & delivers activities to peers,
//! and retries deliveries that fail. Applications plug in their storage (a [storage::Database]),
//! their policies (the traits in [protocol]), and any extra behaviour (the [callbacks]).
//!
//! The entry point is [actor::Actor]; [actor::make_router] mounts it in an [axum] application.

pub mod actor;
#[path = "ap-entities.rs"]
pub mod ap_entities;
pub mod authn;
pub mod callbacks;
pub mod client;
pub mod delivery;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod protocol;
pub mod recipients;
#[path = "side-effect-actor.rs"]
pub mod side_effect_actor;
#[path = "side-effects.rs"]
pub mod side_effects;
pub mod storage;
pub mod transport;
