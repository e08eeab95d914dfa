// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::SocketAddr;

use async_std::net::UdpSocket;
use futures::future::AbortHandle;
use futures::prelude::*;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use icelink::socket::{StunChannel, UdpSocketChannel};
use icelink::stun::agent::StunAgent;
use icelink::stun::attribute::XorMappedAddress;
use icelink::stun::message::{Message, MessageClass, BINDING};

static TRACING: Lazy<()> = Lazy::new(|| {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
});

pub fn test_init_log() {
    Lazy::force(&TRACING);
}

// in-process stun server answering binding requests with the observed
// source address
pub async fn stund_udp() -> (SocketAddr, AbortHandle) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let agent = StunAgent::new(StunChannel::UdpAny(UdpSocketChannel::new(socket)));
    let addr = agent.channel().local_addr().unwrap();
    let recv = agent.receive_stream();
    let (abortable, abort_handle) = futures::future::abortable(async move {
        futures::pin_mut!(recv);
        while let Some(stun_or_data) = recv.next().await {
            let (msg, _data, from) = match stun_or_data.stun() {
                Some(v) => v,
                None => continue,
            };
            if !msg.has_class(MessageClass::Request) || !msg.has_method(BINDING) {
                continue;
            }
            let mut response = Message::new_success(&msg);
            response
                .add_attribute(
                    XorMappedAddress::new(from, msg.transaction_id())
                        .unwrap()
                        .into(),
                )
                .unwrap();
            response.add_fingerprint().unwrap();
            agent.send_to(response, from).await.unwrap();
        }
    });
    async_std::task::spawn(abortable);
    (addr, abort_handle)
}
