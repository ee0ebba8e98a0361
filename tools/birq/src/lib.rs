// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
pub mod balance;
pub mod config;
pub mod control;
pub mod pidfile;
pub mod signals;
pub mod source;
pub mod stats;
