// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Local candidate gathering.
//!
//! Binds one UDP socket per usable interface address and produces host,
//! server-reflexive (STUN Binding) and relayed (TURN Allocate) candidates
//! for a component, filtering out redundant ones.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_std::net::UdpSocket;

use futures::prelude::*;
use futures::StreamExt;

use get_if_addrs::get_if_addrs;

use crate::agent::AgentError;
use crate::candidate::{Candidate, CandidateType, TransportType};
use crate::socket::{StunChannel, UdpSocketChannel};
use crate::stun::agent::StunAgent;
use crate::stun::attribute::{XorMappedAddress, XOR_MAPPED_ADDRESS};
use crate::stun::message::{Message, MessageClass, BINDING};
use crate::turn::TurnServer;

async fn bind_in_port_range(
    ip: std::net::IpAddr,
    port_range: Option<(u16, u16)>,
) -> std::io::Result<UdpSocket> {
    match port_range {
        None => UdpSocket::bind(SocketAddr::new(ip, 0)).await,
        Some((min, max)) => {
            for port in min..=max {
                match UdpSocket::bind(SocketAddr::new(ip, port)).await {
                    Ok(socket) => return Ok(socket),
                    Err(_) => continue,
                }
            }
            Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "no free port in the configured range",
            ))
        }
    }
}

/// Produce a bound UDP socket per usable interface address.  A configured
/// port range restricts which local ports may be used.
pub fn iface_udp_sockets(
    port_range: Option<(u16, u16)>,
) -> Result<impl Stream<Item = Result<UdpSocketChannel, std::io::Error>>, AgentError> {
    let mut ifaces = get_if_addrs()?;
    // loopback addresses are only useful when nothing else is available
    if ifaces.iter().any(|iface| !iface.is_loopback()) {
        ifaces.retain(|iface| !iface.is_loopback());
    }

    for _f in ifaces.iter().inspect(|iface| {
        info!("found interface {} address {:?}", iface.name, iface.ip());
    }) {}

    if ifaces.is_empty() {
        return Err(AgentError::NoCandidates);
    }

    Ok(
        futures::stream::iter(ifaces.into_iter()).then(move |iface| async move {
            Ok(UdpSocketChannel::new(
                bind_in_port_range(iface.ip(), port_range).await?,
            ))
        }),
    )
}

#[derive(Debug)]
struct GatherCandidateAddress {
    ctype: CandidateType,
    local_preference: u8,
    address: SocketAddr,
    base: SocketAddr,
    related: Option<SocketAddr>,
}

async fn gather_stun_xor_address(
    local_preference: u8,
    agent: StunAgent,
    stun_server: SocketAddr,
) -> Result<GatherCandidateAddress, AgentError> {
    // unauthenticated binding request to the stun server
    let msg = Message::new_request_method(BINDING);
    let from = agent.channel().local_addr()?;

    let (response, _data, _from) = agent.stun_request_transaction(&msg, stun_server).await?;
    if !response.has_class(MessageClass::Success) {
        return Err(AgentError::ResourceNotFound);
    }

    let attr = response
        .get_attribute(XOR_MAPPED_ADDRESS)
        .ok_or(AgentError::Malformed)?;
    let xor = XorMappedAddress::try_from(attr)?;
    let addr = xor.addr(response.transaction_id());
    debug!("got external address {:?}", addr);
    Ok(GatherCandidateAddress {
        ctype: CandidateType::ServerReflexive,
        local_preference,
        address: addr,
        base: from,
        related: Some(stun_server),
    })
}

async fn gather_turn_relayed_address(
    local_preference: u8,
    agent: StunAgent,
    turn_server: TurnServer,
) -> Result<GatherCandidateAddress, AgentError> {
    let base = agent.channel().local_addr()?;
    let relayed = crate::turn::allocate(&agent, &turn_server).await?;
    Ok(GatherCandidateAddress {
        ctype: CandidateType::Relayed,
        local_preference,
        address: relayed,
        base,
        related: Some(turn_server.addr),
    })
}

fn host_gather_candidate(
    agent: &StunAgent,
    local_preference: u8,
) -> Result<GatherCandidateAddress, AgentError> {
    let local_addr = agent.channel().local_addr()?;
    Ok(GatherCandidateAddress {
        ctype: CandidateType::Host,
        local_preference,
        address: local_addr,
        base: local_addr,
        related: None,
    })
}

/// Produce the candidates for a component from the provided sockets,
/// filtering redundant ones as they appear.  Each candidate is paired with
/// the [`StunAgent`] bound to its base socket.
pub fn gather_component(
    component_id: usize,
    schannels: &[UdpSocketChannel],
    stun_servers: Vec<SocketAddr>,
    turn_servers: Vec<TurnServer>,
) -> Result<impl Stream<Item = (Candidate, StunAgent)>, AgentError> {
    let agents: Vec<_> = schannels
        .iter()
        .map(|schannel| StunAgent::new(StunChannel::UdpAny(schannel.clone())))
        .collect();

    let futures = futures::stream::FuturesUnordered::new();

    for f in agents.iter().enumerate().map(|(i, agent)| {
        futures::future::ready(
            host_gather_candidate(agent, (i * 10) as u8).map(|ga| (ga, agent.clone())),
        )
    }) {
        futures.push(f.boxed());
    }

    for (i, agent) in agents.iter().cloned().enumerate() {
        for stun_server in stun_servers.iter() {
            futures.push(
                {
                    let agent = agent.clone();
                    let stun_server = *stun_server;
                    async move {
                        gather_stun_xor_address((i * 10) as u8, agent.clone(), stun_server)
                            .await
                            .map(move |ga| (ga, agent))
                    }
                }
                .boxed(),
            )
        }
        for turn_server in turn_servers.iter().cloned() {
            futures.push(
                {
                    let agent = agent.clone();
                    async move {
                        gather_turn_relayed_address((i * 10) as u8, agent.clone(), turn_server)
                            .await
                            .map(move |ga| (ga, agent))
                    }
                }
                .boxed(),
            )
        }
    }

    let produced = Arc::new(Mutex::new(Vec::new()));
    Ok(futures.filter_map(move |ga| {
        let produced = produced.clone();
        async move {
            match ga {
                Ok((ga, agent)) => {
                    let priority = Candidate::calculate_priority(
                        ga.ctype,
                        ga.local_preference as u32,
                        component_id,
                    );
                    trace!("candidate {:?}, {:?}", ga, priority);
                    let mut produced = produced.lock().unwrap();
                    let mut builder = Candidate::builder(
                        component_id,
                        ga.ctype,
                        TransportType::Udp,
                        &produced.len().to_string(),
                        ga.address,
                    )
                    .priority(priority)
                    .base_address(ga.base);
                    if let Some(related) = ga.related {
                        builder = builder.related_address(related);
                    }
                    let cand = builder.build();
                    for c in produced.iter() {
                        // ignore candidates that produce the same local/remote
                        // pair of addresses
                        if cand.redundant_with(c) {
                            trace!("redundant {:?}", cand);
                            return None;
                        }
                    }
                    info!("producing {:?}", cand);
                    produced.push(cand.clone());
                    Some((cand, agent))
                }
                Err(e) => {
                    trace!("candidate retrieval error '{:?}'", e);
                    None
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn host_candidates_from_ifaces() {
        init();
        task::block_on(async move {
            let channels: Vec<_> = iface_udp_sockets(None)
                .unwrap()
                .filter_map(|s| async move { s.ok() })
                .collect()
                .await;
            assert!(!channels.is_empty());

            let stream = gather_component(1, &channels, vec![], vec![]).unwrap();
            futures::pin_mut!(stream);
            let mut candidates = vec![];
            while let Some((cand, _agent)) = stream.next().await {
                candidates.push(cand);
            }
            assert!(!candidates.is_empty());
            assert!(candidates
                .iter()
                .all(|c| c.candidate_type == CandidateType::Host));
        });
    }

    #[test]
    fn port_range_respected() {
        init();
        task::block_on(async move {
            let socket = bind_in_port_range("127.0.0.1".parse().unwrap(), Some((40000, 40100)))
                .await
                .unwrap();
            let port = socket.local_addr().unwrap().port();
            assert!((40000..=40100).contains(&port));
        });
    }
}
