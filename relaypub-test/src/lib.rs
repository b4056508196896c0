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

//! # The relaypub Integration Tests
//!
//! # Introduction
//!
//! The Rust unit & integration testing framework is oriented toward testing *libraries*; there's no
//! notion of a fixture shared across tests. As with [Fluvio], the approach here is to opt-out of
//! `libharness` & drive the tests ourselves with [libtest-mimic]:
//!
//! ```toml
//! [[test]]
//!     name = "end-to-end"
//!     harness = false
//! ```
//!
//! [Fluvio]: https://github.com/infinyon/fluvio
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! `cargo test` then expects `tests/end-to-end.rs` to contain a `main()` that exits zero if all
//! tests passed, and one else.
//!
//! # Project Structure
//!
//! The tests themselves (along with the in-process server they run against, [server::Instance])
//! live in this library; each is registered with the harness in `tests/`, which is also where the
//! harness' own plumbing (the `Test` struct) lives.
//!
//! Remote peers are played by [wiremock] servers, which lets the tests see exactly what relaypub
//! delivered.
//!
//! [wiremock]: https://docs.rs/wiremock/latest/wiremock/index.html

use libtest_mimic::Failed;
use url::Url;

#[path = "activity-pub.rs"]
pub mod activity_pub;
pub mod server;

/// Hit the healthcheck endpoint; fail on anything other than "GOOD"
pub async fn test_healthcheck(url: Url) -> Result<(), Failed> {
    assert!(
        "GOOD"
            == reqwest::get(url.join("/healthcheck")?)
                .await?
                .text()
                .await?
    );
    Ok(())
}
