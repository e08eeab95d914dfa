// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Gather candidates on all usable interfaces and print them as SDP
//! lines.  Any arguments are treated as "ip:port" STUN servers.

use async_std::task;
use futures::StreamExt;

use tracing_subscriber::EnvFilter;

use icelink::agent::{Agent, AgentError, AgentMessage};

fn main() -> Result<(), AgentError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    task::block_on(async move {
        let agent = Agent::builder().build();
        for arg in std::env::args().skip(1) {
            agent.add_stun_server_config(&arg)?;
        }

        let stream = agent.add_stream(1, None)?;
        let credentials = stream.local_credentials();
        println!("a=ice-ufrag:{}", credentials.ufrag);
        println!("a=ice-pwd:{}", credentials.passwd);

        let mut messages = agent.message_channel();
        let printer = task::spawn(async move {
            while let Some(msg) = messages.next().await {
                if let AgentMessage::NewLocalCandidate(_component, candidate) = msg {
                    println!("a={}", candidate.to_sdp_string());
                }
            }
        });

        stream.gather_candidates().await?;
        agent.close().await?;
        printer.await;
        Ok(())
    })
}
