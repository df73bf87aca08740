// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors
pub mod algorithms;
pub mod alignment;
pub mod bruteforce;
pub mod cancel;
pub mod combination;
pub mod digest;
pub mod digest_source;
pub mod error;
pub mod event_log;
pub mod measurement;
pub mod pcr_recovery;
pub mod register;
pub mod reproduce;
pub mod settings;
pub mod vtpm;

#[macro_use]
extern crate static_assertions;
