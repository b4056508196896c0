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

//! # relaypub metrics
//!
//! relaypub uses [OpenTelemetry] to collect & export metrics. OTel advises that instruments be
//! created once & re-used, which leaves the question of where to keep them. relaypub's answer is
//! to make each one a lazily-initialized static right next to the code that updates it:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! define_metric! { "delivery.successes", delivery_successes, Sort::IntegralCounter }
//! // ...
//! delivery_successes.add(1, &[]);
//! ```
//!
//! The cost of scattering them about is the risk of two instruments accidentally sharing a name.
//! So every [define_metric] invocation also registers the name with David Tolnay's [inventory]
//! crate, and [check_metric_registrations] (called once at startup) will refuse duplicates.
//!
//! Instruments are bound to whatever global meter provider is installed when they're first used,
//! so applications wanting to export metrics should install one before serving requests.
//!
//! [define_metric]: crate::define_metric

use std::collections::HashSet;

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The metric name {name} was used twice"))]
    DuplicateMetric { name: String, backtrace: Backtrace },
}

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
}

/// The type of thing being inventoried
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Fail if any metric name has been registered more than once
pub fn check_metric_registrations() -> Result<usize, Error> {
    let mut names: HashSet<&'static str> = HashSet::new();
    for reg in inventory::iter::<Registration> {
        if !names.insert(reg.name()) {
            return DuplicateMetricSnafu { name: reg.name() }.fail();
        }
    }
    Ok(names.len())
}

/// Define a lazily-created, statically-named OTel instrument & register its name
#[macro_export]
macro_rules! define_metric {
    ($name:literal, $ident:ident, Sort::IntegralCounter) => {
        inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralCounter)
        }
        lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: opentelemetry::metrics::Counter<u64> =
                opentelemetry::global::meter("relaypub").u64_counter($name).build();
        }
    };
}
