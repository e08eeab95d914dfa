// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # icelink
//!
//! An async implementation of the ICE protocol (RFC 8445).
//!
//! An [`agent::Agent`] holds one or more [`stream::Stream`]s, each with
//! one or more [`component::Component`]s.  After exchanging credentials
//! and candidates with the remote peer, connectivity checks find a
//! working pair of addresses and data can flow over each component.

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate derivative;

pub mod agent;
pub mod candidate;
pub mod component;
mod conncheck;
pub mod gathering;
pub mod payload;
pub mod socket;
pub mod stream;
pub mod stun;
mod tasks;
pub mod turn;
mod utils;
