// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A single transport flow within a stream.
//!
//! Once connectivity checks select a pair, the component carries
//! application data over it and keeps the path alive with periodic
//! Binding indications.  A path silent for longer than the max-silence
//! window is dropped and the component falls back to `Connecting`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::AbortHandle;
use futures::prelude::*;
use futures::Stream;
use futures_timer::Delay;
use tracing_futures::Instrument;

use crate::agent::{AgentError, AgentMessage};
use crate::candidate::CandidatePair;
use crate::stun::agent::StunAgent;
use crate::stun::message::{Message, BINDING};
use crate::utils::{ChannelBroadcast, DropLogger};

pub const RTP: usize = 1;
pub const RTCP: usize = 2;

// RFC 7675-style consent freshness
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_SILENCE: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct Component {
    pub id: usize,
    broadcast: Arc<ChannelBroadcast<AgentMessage>>,
    inner: Arc<Mutex<ComponentInner>>,
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Component {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentState {
    New,
    Gathering,
    Connecting,
    Connected,
    Failed,
}

impl Component {
    pub(crate) fn new(id: usize, broadcast: Arc<ChannelBroadcast<AgentMessage>>) -> Self {
        Self {
            id,
            broadcast,
            inner: Arc::new(Mutex::new(ComponentInner::new(id))),
        }
    }

    /// Retrieve the current state of a `Component`
    ///
    /// # Examples
    ///
    /// The initial state is `ComponentState::New`
    ///
    /// ```
    /// # use icelink::component::{Component, ComponentState};
    /// # use icelink::agent::Agent;
    /// let agent = Agent::builder().build();
    /// let stream = agent.add_stream(1, None).unwrap();
    /// let component = stream.component(icelink::component::RTP).unwrap();
    /// assert_eq!(component.state(), ComponentState::New);
    /// ```
    pub fn state(&self) -> ComponentState {
        let inner = self.inner.lock().unwrap();
        inner.state
    }

    pub(crate) async fn set_state(&self, state: ComponentState) {
        if let Some(new_state) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.set_state(state) {
                Some(state)
            } else {
                None
            }
        } {
            self.broadcast
                .broadcast(AgentMessage::ComponentStateChange(self.clone(), new_state))
                .await;
        }
    }

    /// Retrieve a Stream that produces data sent to this component from a peer
    pub fn receive_stream(&self) -> impl Stream<Item = Vec<u8>> + Unpin {
        let inner = self.inner.lock().unwrap();
        inner.receive_receive_channel.clone()
    }

    /// Send data to the peer using the selected pair
    #[tracing::instrument(
        name = "component_send",
        level = "debug",
        skip(self, data),
        fields(
            component.id = self.id,
        )
    )]
    pub async fn send(&self, data: &[u8]) -> Result<(), AgentError> {
        let (local_agent, to) = {
            let mut inner = self.inner.lock().unwrap();
            let selected_pair = inner
                .selected_pair
                .as_ref()
                .ok_or(AgentError::ResourceNotFound)?;
            let local_agent = selected_pair.local_stun_agent.clone();
            let to = selected_pair.candidate_pair.remote.address;
            trace!("sending {} bytes to {}", data.len(), to);
            inner.last_sent = Instant::now();
            (local_agent, to)
        };
        local_agent
            .send_data_to(data, to)
            .await
            .map_err(|_| AgentError::SendFailed)?;
        Ok(())
    }

    #[tracing::instrument(
        skip(self, agent),
        fields(
            component.id = self.id,
        )
    )]
    pub(crate) async fn add_recv_agent(&self, agent: StunAgent) -> AbortHandle {
        let sender = self.inner.lock().unwrap().receive_send_channel.clone();
        let weak_inner = Arc::downgrade(&self.inner);
        let broadcast = self.broadcast.clone();
        let component = self.clone();

        debug!("adding");
        let span = debug_span!("component_recv");
        // need to keep some reference to the StunAgent until the task completes
        let mut recv_stream = agent.receive_stream();
        let local_addr = agent.channel().local_addr();
        let component_id = self.id;
        let (abortable, abort_handle) = futures::future::abortable(
            async move {
                let _drop_log = DropLogger::new(&format!(
                    "Dropping component {component_id} receive stream for {local_addr:?}"
                ));
                debug!("started");
                while let Some(stun_or_data) = recv_stream.next().await {
                    // any inbound traffic on this socket counts as path activity
                    if let Some(inner) = weak_inner.upgrade() {
                        inner.lock().unwrap().last_received = Instant::now();
                    } else {
                        break;
                    }
                    if let Some((data, _from)) = stun_or_data.data() {
                        // nobody may be consuming the raw stream, so never block on it
                        if let Err(e) = sender.try_send(data.clone()) {
                            trace!("receive channel not drained: {:?}", e);
                        }
                        broadcast
                            .broadcast(AgentMessage::ReceivedPayload(component.clone(), data))
                            .await;
                    }
                }
                debug!("receive loop exited");
            }
            .instrument(span.or_current()),
        );

        async_std::task::spawn(abortable);

        abort_handle
    }

    pub(crate) async fn set_selected_pair(&self, selected: SelectedPair) {
        let (local_foundation, remote_foundation) = (
            selected.candidate_pair.local.foundation.clone(),
            selected.candidate_pair.remote.foundation.clone(),
        );
        {
            let mut inner = self.inner.lock().unwrap();
            inner.set_selected_pair(selected);
        }
        self.broadcast
            .broadcast(AgentMessage::NewSelectedPair(
                self.clone(),
                local_foundation,
                remote_foundation,
            ))
            .await;
        self.start_keepalive_task();
    }

    pub fn selected_pair(&self) -> Option<CandidatePair> {
        self.inner
            .lock()
            .unwrap()
            .selected_pair
            .clone()
            .map(|selected| selected.candidate_pair)
    }

    fn start_keepalive_task(&self) {
        let weak_inner = Arc::downgrade(&self.inner);
        let component = self.clone();
        let (abortable, abort_handle) = futures::future::abortable(async move {
            loop {
                Delay::new(Duration::from_secs(1)).await;
                let inner = match weak_inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let now = Instant::now();
                enum Action {
                    Nothing,
                    Keepalive(StunAgent, std::net::SocketAddr),
                    Expire,
                }
                let action = {
                    let inner = inner.lock().unwrap();
                    match inner.selected_pair.as_ref() {
                        None => break,
                        Some(selected) => {
                            if now.duration_since(inner.last_received) > MAX_SILENCE {
                                Action::Expire
                            } else if now.duration_since(inner.last_sent) >= KEEPALIVE_INTERVAL {
                                Action::Keepalive(
                                    selected.local_stun_agent.clone(),
                                    selected.candidate_pair.remote.address,
                                )
                            } else {
                                Action::Nothing
                            }
                        }
                    }
                };
                match action {
                    Action::Nothing => (),
                    Action::Keepalive(agent, to) => {
                        let mut msg = Message::new_indication_method(BINDING);
                        let keepalive_failed = msg.add_fingerprint().is_err()
                            || agent.send_to(msg, to).await.is_err();
                        if keepalive_failed {
                            warn!("component keepalive send failed, dropping selected pair");
                            {
                                // this task exits on its own, don't abort it
                                let mut inner = inner.lock().unwrap();
                                inner.selected_pair = None;
                                inner.keepalive_abort = None;
                            }
                            component.set_state(ComponentState::Connecting).await;
                            break;
                        }
                        inner.lock().unwrap().last_sent = Instant::now();
                    }
                    Action::Expire => {
                        warn!("no traffic within the max-silence window, dropping selected pair");
                        {
                            let mut inner = inner.lock().unwrap();
                            inner.selected_pair = None;
                            inner.keepalive_abort = None;
                        }
                        component.set_state(ComponentState::Connecting).await;
                        break;
                    }
                }
            }
        });
        async_std::task::spawn(abortable);
        let old = {
            let mut inner = self.inner.lock().unwrap();
            inner.keepalive_abort.replace(abort_handle)
        };
        if let Some(old) = old {
            old.abort();
        }
    }
}

#[derive(Debug)]
struct ComponentInner {
    id: usize,
    state: ComponentState,
    selected_pair: Option<SelectedPair>,
    last_sent: Instant,
    last_received: Instant,
    keepalive_abort: Option<AbortHandle>,
    receive_send_channel: async_channel::Sender<Vec<u8>>,
    receive_receive_channel: async_channel::Receiver<Vec<u8>>,
}

impl ComponentInner {
    fn new(id: usize) -> Self {
        let (recv_s, recv_r) = async_channel::bounded(16);
        Self {
            id,
            state: ComponentState::New,
            selected_pair: None,
            last_sent: Instant::now(),
            last_received: Instant::now(),
            keepalive_abort: None,
            receive_send_channel: recv_s,
            receive_receive_channel: recv_r,
        }
    }

    #[tracing::instrument(name = "set_component_state", level = "debug", skip(self, state))]
    fn set_state(&mut self, state: ComponentState) -> bool {
        if self.state != state {
            debug!(old_state = ?self.state, new_state = ?state, "setting");
            self.state = state;
            true
        } else {
            false
        }
    }

    #[tracing::instrument(
        skip(self, selected),
        fields(
            component_id = self.id
        )
    )]
    fn set_selected_pair(&mut self, selected: SelectedPair) {
        debug!("setting selected pair {:?}", selected.candidate_pair);
        let now = Instant::now();
        self.last_sent = now;
        self.last_received = now;
        self.selected_pair = Some(selected);
    }

}

#[derive(Debug, Clone)]
pub(crate) struct SelectedPair {
    pub(crate) candidate_pair: CandidatePair,
    pub(crate) local_stun_agent: StunAgent,
}

impl SelectedPair {
    pub(crate) fn new(candidate_pair: CandidatePair, local_stun_agent: StunAgent) -> Self {
        Self {
            candidate_pair,
            local_stun_agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::candidate::*;
    use crate::socket::{StunChannel, UdpConnectionChannel, UdpSocketChannel};
    use async_std::net::UdpSocket;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn initial_state_new() {
        init();
        let a = Agent::builder().build();
        let s = a.add_stream(1, None).unwrap();
        let c = s.component(RTP).unwrap();
        assert_eq!(c.state(), ComponentState::New);
    }

    #[test]
    fn set_state_broadcast() {
        init();
        async_std::task::block_on(async move {
            let a = Arc::new(Agent::builder().build());
            let s = a.add_stream(1, None).unwrap();
            let c = s.component(RTP).unwrap();
            let mut msg_channel = a.message_channel();

            assert_eq!(c.state(), ComponentState::New);
            c.set_state(ComponentState::Connecting).await;
            if let Some(AgentMessage::ComponentStateChange(_, state)) = msg_channel.next().await {
                assert_eq!(state, ComponentState::Connecting);
            }
            // duplicate states ignored
            c.set_state(ComponentState::Connecting).await;
            c.set_state(ComponentState::Connected).await;
            if let Some(AgentMessage::ComponentStateChange(_, state)) = msg_channel.next().await {
                assert_eq!(state, ComponentState::Connected);
            }
        });
    }

    #[test]
    fn send_recv() {
        init();
        async_std::task::block_on(async move {
            let a = Agent::builder().build();
            let s = a.add_stream(1, None).unwrap();
            let send = s.component(RTP).unwrap();

            let local_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let remote_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let remote_channel = UdpSocketChannel::new(remote_socket);
            let local_agent = StunAgent::new(StunChannel::Udp(UdpConnectionChannel::new(
                UdpSocketChannel::new(local_socket),
                remote_channel.local_addr().unwrap(),
            )));

            let local_cand = Candidate::builder(
                RTP,
                CandidateType::Host,
                TransportType::Udp,
                "0",
                local_agent.channel().local_addr().unwrap(),
            )
            .build();
            let remote_cand = Candidate::builder(
                RTP,
                CandidateType::Host,
                TransportType::Udp,
                "0",
                remote_channel.local_addr().unwrap(),
            )
            .build();
            let candidate_pair = CandidatePair::new(local_cand, remote_cand);
            let selected_pair = SelectedPair::new(candidate_pair, local_agent);

            send.set_selected_pair(selected_pair.clone()).await;
            assert_eq!(selected_pair.candidate_pair, send.selected_pair().unwrap());

            let data = vec![3; 4];
            let recv_stream = remote_channel.receive_stream();
            futures::pin_mut!(recv_stream);
            send.send(&data).await.unwrap();
            let (recved, _from) = recv_stream.next().await.unwrap();
            assert_eq!(data, recved);
        });
    }

    #[test]
    fn send_without_selected_pair() {
        init();
        async_std::task::block_on(async move {
            let a = Agent::builder().build();
            let s = a.add_stream(1, None).unwrap();
            let c = s.component(RTP).unwrap();
            assert!(matches!(
                c.send(&[1, 2, 3]).await,
                Err(AgentError::ResourceNotFound)
            ));
        });
    }

    #[test]
    fn muxing_recv() {
        // given two sockets ensure sending to either of them produces the same data
        init();
        async_std::task::block_on(async move {
            let a = Agent::builder().build();
            let s = a.add_stream(1, None).unwrap();
            let send = s.component(RTP).unwrap();

            let socket1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr1 = socket1.local_addr().unwrap();
            let socket2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr2 = socket2.local_addr().unwrap();

            let channel1 = StunChannel::Udp(UdpConnectionChannel::new(
                UdpSocketChannel::new(socket1),
                addr2,
            ));
            let stun1 = StunAgent::new(channel1);
            send.add_recv_agent(stun1.clone()).await;

            let channel2 = StunChannel::Udp(UdpConnectionChannel::new(
                UdpSocketChannel::new(socket2),
                addr1,
            ));
            let stun2 = StunAgent::new(channel2);
            send.add_recv_agent(stun2.clone()).await;

            let mut recv_stream = send.receive_stream();
            let buf = vec![0, 1];
            stun1.send_data_to(&buf, addr2).await.unwrap();
            assert_eq!(&recv_stream.next().await.unwrap(), &buf);
            let buf = vec![2, 3];
            stun2.send_data_to(&buf, addr1).await.unwrap();
            assert_eq!(&recv_stream.next().await.unwrap(), &buf);
        });
    }
}
