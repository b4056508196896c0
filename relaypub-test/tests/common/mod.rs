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

use std::{env, sync::Arc};

use futures::future::BoxFuture;
use libtest_mimic::Failed;
use relaypub_test::server::Instance;

/// Test configuration, read from the environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    /// An `EnvFilter` directive; if set, the harness logs to stdout
    pub log: Option<String>,
}

impl Configuration {
    /// Check `RELAYPUB_TEST_LOG`; if defined & non-empty, log at that level
    pub fn new() -> Configuration {
        Configuration {
            log: env::var("RELAYPUB_TEST_LOG")
                .ok()
                .filter(|directive| !directive.is_empty()),
        }
    }
}

/// An end-to-end test; each is handed the running server
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(Arc<Instance>) -> BoxFuture<'static, Result<(), Failed>>,
}

inventory::collect!(Test);
