// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of popcon.
//
// popcon is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// popcon is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with popcon.  If not,
// see <http://www.gnu.org/licenses/>.

//! # popcon metrics
//!
//! popcon uses [OpenTelemetry] to collect & export metrics. OTel advises us to "Re-use Instruments:
//! Instruments are designed for reuse. Avoid creating new instruments repeatedly." The question is
//! where to keep them without littering the application state with fields of type `Counter<u64>`.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! The answer here is to declare each instrument at its point of use as a lazily-initialized
//! static, and to "register" its name via David Tolnay's [inventory] crate so that we can check,
//! once at startup, that no two instruments were given the same name:
//!
//! ```ignore
//! define_metric! { "version.cache.hits", version_cache_hits, Sort::IntegralCounter }
//! // ...
//! version_cache_hits.add(1, &[]);
//! ```
//!
//! The instruments are built on first use, so [check_metric_names] (and the installation of the
//! global meter provider) must happen before any request is served.

use std::collections::HashSet;

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The type of thing being inventoried
///
/// You generally won't build these by hand; [define_metric](crate::define_metric) submits one for
/// each instrument it declares.
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

/// Panic if any two instruments share a name
///
/// These are logic errors that would be compile-time errors with a richer type system, so I'm
/// following the convention of panicking rather than returning a `Result`.
pub fn check_metric_names() {
    let mut names: HashSet<&'static str> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was used twice", reg.name());
        }
    });
}

/// All the registered metric names, sorted; handy for diagnostics
pub fn metric_names() -> Vec<&'static str> {
    let mut names = IntoIterator::into_iter(inventory::iter::<Registration>)
        .map(|reg| reg.name())
        .collect::<Vec<&'static str>>();
    names.sort();
    names
}

/// Declare an OTel instrument as a lazily-initialized static & register its name
#[macro_export]
macro_rules! define_metric {
    ($name:literal, $ident:ident, Sort::IntegralCounter) => {
        inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralCounter)
        }
        lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: opentelemetry::metrics::Counter<u64> =
                opentelemetry::global::meter("popcon").u64_counter($name).build();
        }
    };
    ($name:literal, $ident:ident, Sort::IntegralGauge) => {
        inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralGauge)
        }
        lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: opentelemetry::metrics::Gauge<u64> =
                opentelemetry::global::meter("popcon").u64_gauge($name).build();
        }
    };
}
