// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A media stream and its components.

use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use futures::prelude::*;

use crate::agent::{AgentError, AgentInner, AgentMessage};
use crate::candidate::Candidate;
use crate::component::{Component, ComponentState};
use crate::conncheck::ConnCheckList;
use crate::gathering::{gather_component, iface_udp_sockets};
use crate::stun::message::ShortTermCredentials;
use crate::utils::{random_ice_string, ChannelBroadcast};

/// ICE username fragment and password for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub passwd: String,
}

impl Credentials {
    pub fn new(ufrag: String, passwd: String) -> Self {
        Self { ufrag, passwd }
    }
}

impl From<Credentials> for ShortTermCredentials {
    fn from(cred: Credentials) -> Self {
        ShortTermCredentials {
            password: cred.passwd,
        }
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ufrag, self.passwd)
    }
}

impl FromStr for Credentials {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.split(' ');
        let ufrag = split.next().ok_or(AgentError::ParseFailed)?;
        let passwd = split.next().ok_or(AgentError::ParseFailed)?;
        if split.next().is_some() || ufrag.is_empty() || passwd.is_empty() {
            return Err(AgentError::ParseFailed);
        }
        Ok(Credentials::new(ufrag.to_owned(), passwd.to_owned()))
    }
}

#[derive(Debug)]
pub struct Stream {
    pub id: usize,
    pub(crate) name: Option<String>,
    broadcast: Arc<ChannelBroadcast<AgentMessage>>,
    agent_inner: Weak<Mutex<AgentInner>>,
    pub(crate) checklist: Arc<ConnCheckList>,
    inner: Arc<Mutex<StreamInner>>,
}

#[derive(Debug)]
struct StreamInner {
    components: Vec<Option<Component>>,
    local_credentials: Credentials,
    remote_credentials: Option<Credentials>,
    gathering: bool,
}

impl Stream {
    pub(crate) fn new(
        id: usize,
        name: Option<String>,
        n_components: usize,
        broadcast: Arc<ChannelBroadcast<AgentMessage>>,
        agent_inner: Weak<Mutex<AgentInner>>,
    ) -> Self {
        let components = (1..=n_components)
            .map(|component_id| Some(Component::new(component_id, broadcast.clone())))
            .collect();
        let local_credentials =
            Credentials::new(random_ice_string(8), random_ice_string(24));
        let checklist = Arc::new(ConnCheckList::new());
        checklist.set_local_credentials(local_credentials.clone());
        Self {
            id,
            name,
            broadcast,
            agent_inner,
            checklist,
            inner: Arc::new(Mutex::new(StreamInner {
                components,
                local_credentials,
                remote_credentials: None,
                gathering: false,
            })),
        }
    }

    /// An optional human readable name for this stream.
    pub fn name(&self) -> Option<String> {
        self.name.clone()
    }

    /// Retrieve a [`Component`] by id.  Component ids start at 1.
    pub fn component(&self, component_id: usize) -> Option<Component> {
        if component_id < 1 {
            return None;
        }
        self.inner
            .lock()
            .unwrap()
            .components
            .get(component_id - 1)
            .cloned()
            .flatten()
    }

    /// Add a component to this stream.  The new component takes the lowest
    /// free component id.
    pub fn add_component(&self) -> Result<Component, AgentError> {
        let mut inner = self.inner.lock().unwrap();
        let free_idx = inner.components.iter().position(Option::is_none);
        let component_id = free_idx.unwrap_or(inner.components.len()) + 1;
        let component = Component::new(component_id, self.broadcast.clone());
        match free_idx {
            Some(idx) => inner.components[idx] = Some(component.clone()),
            None => inner.components.push(Some(component.clone())),
        }
        Ok(component)
    }

    /// Remove a component from this stream.  Removing a component that does
    /// not exist is not an error.
    pub fn remove_component(&self, component_id: usize) {
        if component_id < 1 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.components.get_mut(component_id - 1) {
            slot.take();
        }
    }

    pub(crate) fn components(&self) -> Vec<Component> {
        self.inner
            .lock()
            .unwrap()
            .components
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// The local credentials generated for this stream.  They do not change
    /// over the lifetime of the stream.
    pub fn local_credentials(&self) -> Credentials {
        self.inner.lock().unwrap().local_credentials.clone()
    }

    /// The credentials signalled by the remote peer, if set.
    pub fn remote_credentials(&self) -> Option<Credentials> {
        self.inner.lock().unwrap().remote_credentials.clone()
    }

    /// Set the credentials signalled by the remote peer.  May only be
    /// performed once.
    pub fn set_remote_credentials(&self, credentials: Credentials) -> Result<(), AgentError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.remote_credentials.is_some() {
                return Err(AgentError::CredentialsAlreadySet);
            }
            inner.remote_credentials = Some(credentials.clone());
        }
        self.checklist.set_remote_credentials(credentials);
        Ok(())
    }

    /// Add a remote candidate received from the peer for a particular
    /// component.
    pub fn add_remote_candidate(
        &self,
        component_id: usize,
        candidate: Candidate,
    ) -> Result<(), AgentError> {
        if self.component(component_id).is_none() {
            return Err(AgentError::ResourceNotFound);
        }
        self.checklist.add_remote_candidate(component_id, candidate);
        Ok(())
    }

    /// Signal that the remote peer will not provide any further candidates.
    /// Without this a trickle-ice session cannot fail.
    pub fn end_of_remote_candidates(&self) {
        self.checklist.end_of_remote_candidates();
    }

    /// Gather local candidates for every component of this stream.  New
    /// candidates are signalled with [`AgentMessage::NewLocalCandidate`],
    /// completion with [`AgentMessage::GatheringCompleted`].
    pub async fn gather_candidates(&self) -> Result<(), AgentError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.gathering {
                return Err(AgentError::AlreadyInProgress);
            }
            inner.gathering = true;
        }

        let (stun_servers, turn_servers, port_ranges) = {
            let agent_inner = self
                .agent_inner
                .upgrade()
                .ok_or(AgentError::ConnectionClosed)?;
            let agent_inner = agent_inner.lock().unwrap();
            // candidate gathering only operates over UDP sockets
            let stun_servers: Vec<_> = agent_inner
                .stun_servers
                .iter()
                .filter(|(transport, _)| *transport == crate::stun::TransportType::Udp)
                .map(|(_, addr)| *addr)
                .collect();
            (
                stun_servers,
                agent_inner.turn_servers.clone(),
                agent_inner.port_ranges.clone(),
            )
        };

        let mut n_gathered = 0;
        for component in self.components() {
            component.set_state(ComponentState::Gathering).await;

            let port_range = port_ranges.get(&(self.id, component.id)).copied();
            let schannels: Vec<_> = iface_udp_sockets(port_range)?
                .filter_map(|channel| async move {
                    channel
                        .map_err(|e| {
                            warn!("failed to bind socket: {:?}", e);
                            e
                        })
                        .ok()
                })
                .collect()
                .await;

            let gather = gather_component(
                component.id,
                &schannels,
                stun_servers.clone(),
                turn_servers.clone(),
            )?;
            futures::pin_mut!(gather);
            while let Some((candidate, agent)) = gather.next().await {
                n_gathered += 1;
                self.checklist
                    .add_local_candidate(&component, candidate.clone(), agent)
                    .await;
                self.broadcast
                    .broadcast(AgentMessage::NewLocalCandidate(
                        component.clone(),
                        candidate,
                    ))
                    .await;
            }
            self.broadcast
                .broadcast(AgentMessage::GatheringCompleted(component.clone()))
                .await;
        }
        if n_gathered == 0 {
            // every socket failed to bind, e.g. an exhausted port range
            self.mark_gathering_idle();
            return Err(AgentError::NoCandidates);
        }
        Ok(())
    }

    // allows gathering to run again after a component failure
    pub(crate) fn mark_gathering_idle(&self) {
        self.inner.lock().unwrap().gathering = false;
    }

    /// The local candidates gathered so far.
    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.checklist.local_candidates()
    }

    /// The remote candidates received so far.
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.checklist.remote_candidates()
    }
}
