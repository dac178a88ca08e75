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

//! # popcon
//!
//! An edge-deployed endpoint that tells a desktop application what its latest release is, and
//! which counts (anonymously, once per device per day) who's asking: operating system, OS family,
//! client language & client version, by calendar month.
//!
//! The library holds everything; `popcond` just configures it & serves it.

pub mod contest;
pub mod dynamodb;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod popcon;
pub mod releases;
pub mod stats;
pub mod storage;
pub mod user_agent;
pub mod version;
pub mod version_cache;
pub mod votes;
