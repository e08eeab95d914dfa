// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The top level ICE agent.
//!
//! An [`Agent`] owns a set of [`Stream`]s, the connectivity check
//! scheduler and the event loop that drives them.  The host application
//! receives [`AgentMessage`] events through [`Agent::message_channel`] and
//! exchanges credentials and candidates with the remote peer out of band,
//! either as individual values or as SDP-style fragments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::prelude::*;

use rand::prelude::*;

use crate::candidate::Candidate;
use crate::component::{Component, ComponentState};
use crate::conncheck::ConnCheckListSet;
use crate::stream::{Credentials, Stream};
use crate::stun::TransportType;
use crate::tasks::TaskList;
use crate::turn::{TurnCredentials, TurnServer};
use crate::utils::ChannelBroadcast;

/// Errors that can be returned as a result of agent operations.
#[derive(Debug)]
pub enum AgentError {
    Failed,
    AlreadyExists,
    AlreadyInProgress,
    ResourceNotFound,
    NotEnoughData,
    InvalidSize,
    Malformed,
    NotStun,
    WrongImplementation,
    TooBig,
    ConnectionClosed,
    IntegrityCheckFailed,
    FingerprintMismatch,
    Aborted,
    TimedOut,
    SendFailed,
    NoCandidates,
    DuplicateName,
    ParseFailed,
    CredentialsAlreadySet,
    InvalidStunServer,
    InvalidTurnServer,
    IoError(std::io::Error),
}

impl std::error::Error for AgentError {}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

/// Events provided by the agent as ICE processing progresses.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// A new local candidate was gathered for a component.
    NewLocalCandidate(Component, Candidate),
    /// Gathering for a component has completed.
    GatheringCompleted(Component),
    /// A component changed state.
    ComponentStateChange(Component, ComponentState),
    /// A pair was selected for a component.  Contains the local and remote
    /// candidate foundations.
    NewSelectedPair(Component, String, String),
    /// Data was received on a component.
    ReceivedPayload(Component, Vec<u8>),
}

pub type AgentFuture = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send>>;

/// The ICE specification variant an [`Agent`] negotiates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Rfc8445,
    Rfc5245,
    Google,
}

impl Default for Compatibility {
    fn default() -> Self {
        Compatibility::Rfc8445
    }
}

/// Behavioural knobs for an [`Agent`].
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Candidates are exchanged as they are gathered rather than in a
    /// single block.  When unset, parsing a remote description implies the
    /// end of that peer's candidates.
    pub trickle_ice: bool,
    /// Place USE-CANDIDATE on every check instead of nominating once a
    /// valid pair exists.
    pub aggressive_nomination: bool,
    /// Interval between successive connectivity check transmissions.
    pub check_interval: Duration,
    /// Restart gathering for a stream when one of its components fails.
    pub regather_on_failure: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            trickle_ice: true,
            aggressive_nomination: false,
            check_interval: Duration::from_millis(50),
            regather_on_failure: false,
        }
    }
}

static AGENT_COUNT: AtomicUsize = AtomicUsize::new(0);
static STREAM_COUNT: AtomicUsize = AtomicUsize::new(0);

/// An ICE agent as specified in RFC 8445.
#[derive(Debug, Clone)]
pub struct Agent {
    id: usize,
    inner: Arc<Mutex<AgentInner>>,
    compatibility: Compatibility,
    options: AgentOptions,
    broadcast: Arc<ChannelBroadcast<AgentMessage>>,
    tasks: Arc<TaskList>,
}

#[derive(Debug)]
pub(crate) struct AgentInner {
    streams: Vec<Arc<Stream>>,
    checklistset: Option<Arc<ConnCheckListSet>>,
    controlling: bool,
    tie_breaker: u64,
    pub(crate) stun_servers: Vec<(TransportType, SocketAddr)>,
    pub(crate) turn_servers: Vec<TurnServer>,
    pub(crate) port_ranges: HashMap<(usize, usize), (u16, u16)>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct AgentBuilder {
    controlling: bool,
    compatibility: Compatibility,
    options: Option<AgentOptions>,
}

impl AgentBuilder {
    /// The initial role of the agent.  May still change as a result of
    /// conflict resolution during connectivity checks.
    pub fn controlling(mut self, controlling: bool) -> Self {
        self.controlling = controlling;
        self
    }

    pub fn compatibility(mut self, compatibility: Compatibility) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn options(mut self, options: AgentOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            id: AGENT_COUNT.fetch_add(1, Ordering::SeqCst),
            inner: Arc::new(Mutex::new(AgentInner {
                streams: vec![],
                checklistset: None,
                controlling: self.controlling,
                tie_breaker: rand::thread_rng().gen::<u64>(),
                stun_servers: vec![],
                turn_servers: vec![],
                port_ranges: HashMap::new(),
                closed: false,
            })),
            compatibility: self.compatibility,
            options: self.options.unwrap_or_default(),
            broadcast: Arc::new(ChannelBroadcast::default()),
            tasks: Arc::new(TaskList::new()),
        }
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn compatibility(&self) -> Compatibility {
        self.compatibility
    }

    /// A channel of [`AgentMessage`] events.  Events are delivered in the
    /// order they were produced.  No event is delivered after
    /// [`Agent::close`] has returned.
    pub fn message_channel(&self) -> impl futures::Stream<Item = AgentMessage> + Unpin {
        self.broadcast.channel()
    }

    /// Add a new stream with `n_components` components.  Stream names must
    /// be unique within the agent.
    pub fn add_stream(
        &self,
        n_components: usize,
        name: Option<&str>,
    ) -> Result<Arc<Stream>, AgentError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(AgentError::ConnectionClosed);
        }
        if let Some(name) = name {
            if inner
                .streams
                .iter()
                .any(|s| s.name().as_deref() == Some(name))
            {
                return Err(AgentError::DuplicateName);
            }
        }
        let stream = Arc::new(Stream::new(
            STREAM_COUNT.fetch_add(1, Ordering::SeqCst),
            name.map(str::to_owned),
            n_components,
            self.broadcast.clone(),
            Arc::downgrade(&self.inner),
        ));
        inner.streams.push(stream.clone());
        Ok(stream)
    }

    /// Retrieve a previously added stream by id.
    pub fn stream(&self, id: usize) -> Option<Arc<Stream>> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner.lock().unwrap().streams.to_vec()
    }

    /// Remove a stream.  Removing a stream that does not exist is not an
    /// error.
    pub fn remove_stream(&self, id: usize) -> Result<(), AgentError> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let pos = inner.streams.iter().position(|s| s.id == id);
            pos.map(|pos| inner.streams.remove(pos))
        };
        if let Some(stream) = removed {
            stream.checklist.close();
        }
        Ok(())
    }

    /// Restrict the local ports used when gathering candidates for a
    /// particular component.
    pub fn set_port_range(
        &self,
        stream_id: usize,
        component_id: usize,
        min: u16,
        max: u16,
    ) -> Result<(), AgentError> {
        if min > max {
            return Err(AgentError::Malformed);
        }
        let mut inner = self.inner.lock().unwrap();
        let stream = inner
            .streams
            .iter()
            .find(|s| s.id == stream_id)
            .ok_or(AgentError::ResourceNotFound)?;
        if stream.component(component_id).is_none() {
            return Err(AgentError::ResourceNotFound);
        }
        inner.port_ranges.insert((stream_id, component_id), (min, max));
        Ok(())
    }

    pub fn add_stun_server(&self, transport: TransportType, addr: SocketAddr) {
        info!("agent {} adding stun server {} {}", self.id, transport, addr);
        let mut inner = self.inner.lock().unwrap();
        inner.stun_servers.push((transport, addr));
    }

    /// Add a STUN server from a "ip:port" string.
    pub fn add_stun_server_config(&self, config: &str) -> Result<(), AgentError> {
        let addr = config
            .parse::<SocketAddr>()
            .map_err(|_| AgentError::InvalidStunServer)?;
        self.add_stun_server(TransportType::Udp, addr);
        Ok(())
    }

    pub fn add_turn_server(
        &self,
        transport: TransportType,
        addr: SocketAddr,
        credentials: TurnCredentials,
    ) {
        info!("agent {} adding turn server {} {}", self.id, transport, addr);
        let mut inner = self.inner.lock().unwrap();
        inner.turn_servers.push(TurnServer {
            transport,
            addr,
            credentials,
        });
    }

    /// Add a TURN server from a "ip:port:proto:user:pass" string.
    pub fn add_turn_server_config(&self, config: &str) -> Result<(), AgentError> {
        let mut split = config.splitn(5, ':');
        let ip = split.next().ok_or(AgentError::InvalidTurnServer)?;
        let port = split.next().ok_or(AgentError::InvalidTurnServer)?;
        let proto = split.next().ok_or(AgentError::InvalidTurnServer)?;
        let user = split.next().ok_or(AgentError::InvalidTurnServer)?;
        let pass = split.next().ok_or(AgentError::InvalidTurnServer)?;
        let addr = format!("{}:{}", ip, port)
            .parse::<SocketAddr>()
            .map_err(|_| AgentError::InvalidTurnServer)?;
        let transport =
            TransportType::from_str(proto).map_err(|_| AgentError::InvalidTurnServer)?;
        self.add_turn_server(transport, addr, TurnCredentials::new(user, pass));
        Ok(())
    }

    /// The current role of the agent.
    pub fn controlling(&self) -> bool {
        self.inner.lock().unwrap().controlling
    }

    pub fn set_controlling(&self, controlling: bool) {
        self.inner.lock().unwrap().controlling = controlling;
    }

    /// Produce the local credentials and candidates of every stream as
    /// SDP-style "a=" lines suitable for out of band signalling.
    pub fn generate_local_sdp(&self) -> String {
        use std::fmt::Write as _;
        let mut sdp = String::new();
        for stream in self.streams() {
            let credentials = stream.local_credentials();
            let _ = writeln!(sdp, "a=ice-ufrag:{}", credentials.ufrag);
            let _ = writeln!(sdp, "a=ice-pwd:{}", credentials.passwd);
            for candidate in stream.local_candidates() {
                let _ = writeln!(sdp, "a={}", candidate.to_sdp_string());
            }
        }
        sdp
    }

    /// Apply the remote peer's credentials and candidates from SDP-style
    /// lines as produced by [`Agent::generate_local_sdp`].  Each
    /// "a=ice-ufrag" line after the first advances to the next stream.
    /// Returns the number of candidates added.
    pub fn parse_remote_sdp(&self, sdp: &str) -> Result<usize, AgentError> {
        let streams = self.streams();
        let mut stream_idx = 0;
        let mut n_ufrags = 0;
        let mut ufrag: Option<String> = None;
        let mut passwd: Option<String> = None;
        let mut n_candidates = 0;

        for line in sdp.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                // every ufrag line after the first belongs to the next
                // stream, whether or not the previous stream's credentials
                // were completed
                if n_ufrags > 0 {
                    stream_idx = n_ufrags;
                    passwd = None;
                }
                n_ufrags += 1;
                ufrag = Some(value.to_owned());
            } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
                passwd = Some(value.to_owned());
            } else if line.starts_with("a=candidate:") || line.starts_with("candidate:") {
                let stream = streams.get(stream_idx).ok_or(AgentError::ParseFailed)?;
                let candidate =
                    Candidate::from_str(line).map_err(|_| AgentError::ParseFailed)?;
                stream.add_remote_candidate(candidate.component_id, candidate)?;
                n_candidates += 1;
            } else {
                trace!("ignoring sdp line {:?}", line);
                continue;
            }
            if let (Some(u), Some(p)) = (&ufrag, &passwd) {
                let stream = streams.get(stream_idx).ok_or(AgentError::ParseFailed)?;
                stream.set_remote_credentials(Credentials::new(u.clone(), p.clone()))?;
                ufrag = None;
                passwd = None;
            }
        }

        if !self.options.trickle_ice {
            // a complete description implies the end of the peer's
            // candidates
            for stream in streams.iter().take(stream_idx + 1) {
                stream.end_of_remote_candidates();
            }
        }
        Ok(n_candidates)
    }

    /// Apply a single trickled remote candidate line for a component.
    pub fn set_remote_candidate(
        &self,
        stream_id: usize,
        component_id: usize,
        line: &str,
    ) -> Result<(), AgentError> {
        let stream = self.stream(stream_id).ok_or(AgentError::ResourceNotFound)?;
        let candidate = Candidate::from_str(line).map_err(|_| AgentError::ParseFailed)?;
        if candidate.component_id != component_id {
            return Err(AgentError::ParseFailed);
        }
        stream.add_remote_candidate(component_id, candidate)
    }

    /// Run the agent's event loop.  Connectivity checks, gathering
    /// responders and keepalives execute on the calling task until
    /// [`Agent::close`] is called.
    pub async fn run_loop(&self) -> Result<(), AgentError> {
        self.tasks.iterate_tasks().await
    }

    /// Begin connectivity checks over the streams added so far.
    pub fn start(&self) -> Result<(), AgentError> {
        let set = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(AgentError::ConnectionClosed);
            }
            if inner.checklistset.is_some() {
                // already started
                return Ok(());
            }
            let set = Arc::new(ConnCheckListSet::from_streams(
                inner.streams.clone(),
                self.tasks.clone(),
                inner.controlling,
                inner.tie_breaker,
                self.options.check_interval,
                self.options.aggressive_nomination,
            ));
            inner.checklistset = Some(set.clone());
            set
        };
        if self.options.regather_on_failure {
            self.spawn_regather_monitor();
        }
        self.tasks
            .add_task_block(async move { set.agent_conncheck_process().await }.boxed())
    }

    // restart gathering for a stream whose component failed
    fn spawn_regather_monitor(&self) {
        let mut receiver = self.broadcast.channel_with_filter(|msg| {
            matches!(
                msg,
                AgentMessage::ComponentStateChange(_, ComponentState::Failed)
            )
        });
        let agent = self.clone();
        async_std::task::spawn(async move {
            while let Some(AgentMessage::ComponentStateChange(component, _)) =
                receiver.next().await
            {
                let stream = agent
                    .streams()
                    .into_iter()
                    .find(|stream| stream.components().iter().any(|c| c == &component));
                if let Some(stream) = stream {
                    info!(
                        "component {} failed, regathering stream {}",
                        component.id, stream.id
                    );
                    stream.mark_gathering_idle();
                    if let Err(e) = stream.gather_candidates().await {
                        warn!("regather failed: {:?}", e);
                    }
                }
            }
        });
    }

    /// Stop the agent.  The event loop drains and no further events are
    /// delivered.  Idempotent.
    pub async fn close(&self) -> Result<(), AgentError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Ok(());
            }
            info!("agent {} closing", self.id);
            inner.closed = true;
            if let Some(set) = inner.checklistset.take() {
                set.close();
            }
            for stream in inner.streams.iter() {
                stream.checklist.close();
            }
        }
        self.tasks.stop().await?;
        self.broadcast.close();
        Ok(())
    }
}
