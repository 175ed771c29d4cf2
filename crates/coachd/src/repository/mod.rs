// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed data access.
//!
//! Repositories own their backing stores exclusively and expose only
//! value-returning methods; no caller ever holds a reference into a
//! store. Each repository is handed the performance monitor at
//! construction and times every method through it.

pub mod audit;
pub mod auth;
pub mod entity;
