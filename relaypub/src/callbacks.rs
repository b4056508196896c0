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

//! # Side-effect callbacks
//!
//! relaypub carries default side effects for twelve activity types (see
//! [side_effects](crate::side_effects)). Applications can hook in at two points:
//!
//! - [Callback::Wrapped] runs after the default for one of those twelve
//! - [Callback::Custom] handles some other type altogether (`Listen`, say, or an extension type)
//!
//! Anything matching neither falls through to the protocol's `default_callback`. Attempting to
//! replace a default outright is an error, caught when the [Callbacks] are built.

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::{ensure, Backtrace, Snafu};

use crate::ap_entities::{ActivityKind, Object};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "A custom callback was supplied for {kind}, which has a default; wrap it instead"
    ))]
    Collision { kind: String, backtrace: Backtrace },
    #[snafu(display("Two callbacks were supplied for {kind}"))]
    Duplicate { kind: String, backtrace: Backtrace },
    #[snafu(display("{kind} has no default to wrap"))]
    NoDefault { kind: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// An application-supplied side effect
pub type Hook = Arc<
    dyn Fn(Object) -> BoxFuture<'static, std::result::Result<(), crate::protocol::Error>>
        + Send
        + Sync,
>;

pub enum Callback {
    /// Run after the library's default for this kind
    Wrapped(ActivityKind, Hook),
    /// Handle this activity type, which must not be one with a library default
    Custom(String, Hook),
}

/// What to do with an inbound Follow
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum OnFollow {
    #[default]
    #[serde(rename = "do-nothing")]
    DoNothing,
    #[serde(rename = "automatically-accept")]
    AutomaticallyAccept,
    #[serde(rename = "automatically-reject")]
    AutomaticallyReject,
}

/// How an activity of a given kind is to be handled
pub enum Resolution<'a> {
    /// By an application callback alone
    Custom(&'a Hook),
    /// By the library default, followed by an application callback
    OverriddenDefault(&'a Hook),
    /// By the library default alone
    Default,
    /// By the protocol's `default_callback`
    Fallback,
}

impl std::fmt::Debug for Resolution<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Resolution::Custom(_) => "Custom",
            Resolution::OverriddenDefault(_) => "OverriddenDefault",
            Resolution::Default => "Default",
            Resolution::Fallback => "Fallback",
        })
    }
}

/// A validated set of callbacks for one sub-protocol
#[derive(Default)]
pub struct Callbacks {
    wrapped: HashMap<ActivityKind, Hook>,
    custom: HashMap<String, Hook>,
    on_follow: OnFollow,
}

impl Callbacks {
    pub fn new(callbacks: Vec<Callback>, on_follow: OnFollow) -> Result<Callbacks> {
        let mut wrapped = HashMap::new();
        let mut custom = HashMap::new();
        for callback in callbacks {
            match callback {
                Callback::Wrapped(kind, hook) => {
                    ensure!(
                        kind.has_default(),
                        NoDefaultSnafu {
                            kind: kind.to_string()
                        }
                    );
                    ensure!(
                        !wrapped.contains_key(&kind),
                        DuplicateSnafu {
                            kind: kind.to_string()
                        }
                    );
                    wrapped.insert(kind, hook);
                }
                Callback::Custom(name, hook) => {
                    ensure!(
                        !ActivityKind::from(name.as_str()).has_default(),
                        CollisionSnafu { kind: name }
                    );
                    ensure!(!custom.contains_key(&name), DuplicateSnafu { kind: name });
                    custom.insert(name, hook);
                }
            }
        }
        Ok(Callbacks {
            wrapped,
            custom,
            on_follow,
        })
    }
    pub fn on_follow(&self) -> OnFollow {
        self.on_follow
    }
    pub fn resolve(&self, kind: &ActivityKind) -> Resolution<'_> {
        match kind {
            ActivityKind::Unknown(name) => match self.custom.get(name) {
                Some(hook) => Resolution::Custom(hook),
                None => Resolution::Fallback,
            },
            kind => match self.wrapped.get(kind) {
                Some(hook) => Resolution::OverriddenDefault(hook),
                None => Resolution::Default,
            },
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("wrapped", &self.wrapped.keys().collect::<Vec<_>>())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .field("on_follow", &self.on_follow)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use futures::FutureExt;

    fn hook() -> Hook {
        Arc::new(|_: Object| async { Ok::<(), crate::protocol::Error>(()) }.boxed())
    }

    #[test]
    fn resolution() {
        let callbacks = Callbacks::new(
            vec![
                Callback::Wrapped(ActivityKind::Like, hook()),
                Callback::Custom("Listen".to_owned(), hook()),
            ],
            OnFollow::AutomaticallyAccept,
        )
        .unwrap();

        assert!(matches!(
            callbacks.resolve(&ActivityKind::Like),
            Resolution::OverriddenDefault(_)
        ));
        assert!(matches!(
            callbacks.resolve(&ActivityKind::Create),
            Resolution::Default
        ));
        assert!(matches!(
            callbacks.resolve(&ActivityKind::from("Listen")),
            Resolution::Custom(_)
        ));
        assert!(matches!(
            callbacks.resolve(&ActivityKind::from("Question")),
            Resolution::Fallback
        ));
        assert_eq!(callbacks.on_follow(), OnFollow::AutomaticallyAccept);
    }

    #[test]
    fn bad_configurations() {
        assert!(matches!(
            Callbacks::new(
                vec![Callback::Custom("Follow".to_owned(), hook())],
                OnFollow::DoNothing
            ),
            Err(Error::Collision { kind, .. }) if kind == "Follow"
        ));
        assert!(matches!(
            Callbacks::new(
                vec![
                    Callback::Wrapped(ActivityKind::Undo, hook()),
                    Callback::Wrapped(ActivityKind::Undo, hook())
                ],
                OnFollow::DoNothing
            ),
            Err(Error::Duplicate { .. })
        ));
        assert!(matches!(
            Callbacks::new(
                vec![
                    Callback::Custom("Listen".to_owned(), hook()),
                    Callback::Custom("Listen".to_owned(), hook())
                ],
                OnFollow::DoNothing
            ),
            Err(Error::Duplicate { .. })
        ));
        assert!(matches!(
            Callbacks::new(
                vec![Callback::Wrapped(ActivityKind::from("Listen"), hook())],
                OnFollow::DoNothing
            ),
            Err(Error::NoDefault { .. })
        ));
    }
}
