// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connectivity check scheduling (RFC 8445 Sections 6 and 7).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable};
use futures::prelude::*;
use futures_timer::Delay;

use crate::candidate::{Candidate, CandidatePair, CandidateType, TransportType};

use crate::agent::AgentError;

use crate::component::{Component, ComponentState, SelectedPair};
use crate::stream::Credentials;
use crate::stun::agent::StunAgent;
use crate::stun::attribute::*;
use crate::stun::message::*;
use crate::tasks::TaskList;
use crate::utils::DropLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidatePairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
    Frozen,
}

static CONN_CHECK_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Derivative)]
#[derivative(Debug)]
struct ConnCheck {
    conncheck_id: usize,
    nominate: bool,
    pair: CandidatePair,
    #[derivative(Debug = "ignore")]
    state: Mutex<ConnCheckState>,
    #[derivative(Debug = "ignore")]
    agent: StunAgent,
}

#[derive(Debug)]
struct ConnCheckState {
    state: CandidatePairState,
    abort_handle: Option<AbortHandle>,
}

impl ConnCheck {
    fn new(pair: CandidatePair, agent: StunAgent, nominate: bool) -> Self {
        Self {
            conncheck_id: CONN_CHECK_COUNT.fetch_add(1, Ordering::SeqCst),
            pair,
            state: Mutex::new(ConnCheckState {
                state: CandidatePairState::Frozen,
                abort_handle: None,
            }),
            agent,
            nominate,
        }
    }

    fn state(&self) -> CandidatePairState {
        self.state.lock().unwrap().state
    }

    fn set_state(&self, state: CandidatePairState) {
        let mut inner = self.state.lock().unwrap();
        trace!(
            "conncheck {} state change from {:?} to {:?}",
            self.conncheck_id,
            inner.state,
            state
        );
        if state == CandidatePairState::Succeeded || state == CandidatePairState::Failed {
            let _ = inner.abort_handle.take();
        }
        inner.state = state;
    }

    fn nominate(&self) -> bool {
        self.nominate
    }

    fn cancel(&self) {
        let mut inner = self.state.lock().unwrap();
        let abort_handle = inner.abort_handle.take();
        if let Some(handle) = abort_handle {
            debug!("conncheck {} cancelling", self.conncheck_id);
            handle.abort();
            inner.state = CandidatePairState::Failed;
        }
    }

    async fn connectivity_check(
        conncheck: Arc<ConnCheck>,
        controlling: bool,
        tie_breaker: u64,
        nominate: bool,
    ) -> Result<ConnCheckResponse, AgentError> {
        // generate binding request
        let msg = {
            let mut msg = Message::new_request_method(BINDING);

            msg.add_attribute(Priority::new(conncheck.pair.local.priority).into())?;
            if controlling {
                msg.add_attribute(IceControlling::new(tie_breaker).into())?;
            } else {
                msg.add_attribute(IceControlled::new(tie_breaker).into())?;
            }
            if nominate {
                msg.add_attribute(UseCandidate::new().into())?;
            }
            msg.add_message_integrity(
                &conncheck
                    .agent
                    .local_credentials()
                    .ok_or(AgentError::ResourceNotFound)?,
            )?;
            msg.add_fingerprint()?;
            msg
        };

        let to = conncheck.pair.remote.address;
        let (response, orig_data, from) =
            match conncheck.agent.stun_request_transaction(&msg, to).await {
                Err(e) => {
                    warn!("connectivity check produced error: {:?}", e);
                    return Ok(ConnCheckResponse::Failure(conncheck));
                }
                Ok(v) => v,
            };
        trace!("have response: {}", response);
        response.validate_integrity(
            &orig_data,
            &conncheck
                .agent
                .remote_credentials()
                .ok_or(AgentError::ResourceNotFound)?,
        )?;

        if !response.is_response() {
            return Ok(ConnCheckResponse::Failure(conncheck));
        }

        if response.has_class(MessageClass::Error) {
            warn!("error response {}", response);
            if let Some(err) = response
                .get_attribute(ERROR_CODE)
                .and_then(|raw| ErrorCode::try_from(raw).ok())
            {
                if err.code() == ROLE_CONFLICT {
                    info!("role conflict received {}", response);
                    return Ok(ConnCheckResponse::RoleConflict(conncheck, !controlling));
                }
            }
            return Ok(ConnCheckResponse::Failure(conncheck));
        }

        // if response success:
        // if mismatched address -> fail
        if from != to {
            warn!(
                "response came from different ip {:?} than candidate {:?}",
                from, to
            );
            return Ok(ConnCheckResponse::Failure(conncheck));
        }

        if let Some(xor) = response
            .get_attribute(XOR_MAPPED_ADDRESS)
            .and_then(|raw| XorMappedAddress::try_from(raw).ok())
        {
            let xor_addr = xor.addr(response.transaction_id());
            return Ok(ConnCheckResponse::Success(conncheck, xor_addr));
        }

        Ok(ConnCheckResponse::Failure(conncheck))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CheckListState {
    Running,
    Completed,
    Failed,
}

static CONN_CHECK_LIST_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub(crate) struct ConnCheckList {
    checklist_id: usize,
    inner: Arc<Mutex<ConnCheckListInner>>,
}

#[derive(Debug)]
struct ConnCheckLocalCandidate {
    component_id: usize,
    candidate: Candidate,
    stun_agent: StunAgent,
    stun_recv_abort: AbortHandle,
    data_recv_abort: AbortHandle,
}

#[derive(Debug, Clone)]
struct ValidPair {
    pair: CandidatePair,
    nominated: bool,
}

#[derive(Debug)]
struct ConnCheckListInner {
    checklist_id: usize,
    state: CheckListState,
    component_ids: Vec<usize>,
    components: Vec<Component>,
    local_candidates: Vec<ConnCheckLocalCandidate>,
    remote_candidates: Vec<Candidate>,
    triggered: VecDeque<Arc<ConnCheck>>,
    pairs: VecDeque<Arc<ConnCheck>>,
    valid: Vec<ValidPair>,
    local_credentials: Option<Credentials>,
    remote_credentials: Option<Credentials>,
    controlling: bool,
    tie_breaker: u64,
    remote_end_of_candidates: bool,
}

impl ConnCheckListInner {
    fn new(checklist_id: usize) -> Self {
        Self {
            checklist_id,
            state: CheckListState::Running,
            component_ids: vec![],
            components: vec![],
            local_candidates: vec![],
            remote_candidates: vec![],
            triggered: VecDeque::new(),
            pairs: VecDeque::new(),
            valid: vec![],
            local_credentials: None,
            remote_credentials: None,
            controlling: false,
            tie_breaker: 0,
            remote_end_of_candidates: false,
        }
    }

    fn find_remote_candidate(
        &self,
        component_id: usize,
        ttype: TransportType,
        addr: SocketAddr,
    ) -> Option<Candidate> {
        self.remote_candidates
            .iter()
            .find(|&remote| {
                remote.component_id == component_id
                    && remote.transport_type == ttype
                    && remote.address == addr
            })
            .cloned()
    }

    fn add_triggered(&mut self, check: Arc<ConnCheck>) {
        if let Some(idx) = self
            .triggered
            .iter()
            .position(|existing| existing.pair == check.pair)
        {
            // a nominating check trumps not nominating.  Otherwise, if the
            // peers are delay sync, then the non-nominating triggered check
            // may override the nomination process for a long time and delay
            // the connection process
            if check.nominate() && !self.triggered[idx].nominate() {
                let existing = self.triggered.remove(idx).unwrap();
                debug!(
                    "checklist {} removing existing triggered {:?}",
                    self.checklist_id, existing
                );
            } else {
                debug!(
                    "checklist {} not adding duplicate triggered {:?}",
                    self.checklist_id, &self.triggered[idx]
                );
                return;
            }
        }
        debug!("checklist {} adding triggered {:?}", self.checklist_id, &check);
        self.triggered.push_front(check)
    }

    fn add_remote_candidate(&mut self, remote: Candidate) {
        debug!(
            "checklist {} adding remote {:?}",
            self.checklist_id, remote
        );
        self.remote_candidates.push(remote);
    }

    fn get_matching_check(
        &self,
        pair: &CandidatePair,
        nominate: Nominate,
    ) -> Option<Arc<ConnCheck>> {
        self.pairs
            .iter()
            .find(|&check| {
                check.pair.local == pair.local
                    && check.pair.remote == pair.remote
                    && nominate.eq(&check.nominate)
            })
            .cloned()
            .or_else(|| {
                self.triggered
                    .iter()
                    .find(|&check| {
                        check.pair.local == pair.local
                            && check.pair.remote == pair.remote
                            && nominate.eq(&check.nominate)
                    })
                    .cloned()
            })
    }

    fn take_matching_check(&mut self, pair: &CandidatePair) -> Option<Arc<ConnCheck>> {
        let pos = self
            .pairs
            .iter()
            .position(|check| check.pair.local == pair.local && check.pair.remote == pair.remote);
        if let Some(position) = pos {
            self.pairs.remove(position)
        } else {
            None
        }
    }

    fn add_check(&mut self, check: Arc<ConnCheck>) {
        self.pairs.push_front(check)
    }

    fn local_agent_for_pair(&self, pair: &CandidatePair) -> Option<StunAgent> {
        self.local_candidates
            .iter()
            .find(|cand| {
                cand.component_id == pair.component_id()
                    && (cand.candidate == pair.local
                        || cand.candidate.base_address == pair.local.base_address)
            })
            .map(|cand| cand.stun_agent.clone())
    }

    // returns the components whose selected pair should now be set.  The
    // actual assignment happens outside the lock.
    fn nominated_pair(
        &mut self,
        component_id: usize,
        pair: &CandidatePair,
    ) -> Vec<(Component, SelectedPair)> {
        let mut selections = vec![];
        let idx = match self.valid.iter().position(|valid| &valid.pair == pair) {
            Some(idx) => idx,
            None => {
                warn!(
                    "checklist {} unknown nominated component {} pair {:?}",
                    self.checklist_id, component_id, pair
                );
                return selections;
            }
        };
        info!(
            "checklist {} nominated component {} pair {:?}",
            self.checklist_id, component_id, pair
        );
        self.valid[idx].nominated = true;
        if self.state != CheckListState::Running {
            return selections;
        }
        // RFC 8445 8.1.2: once a pair for a component is nominated, remove
        // all other candidate pairs for the same component, cancelling any
        // in-progress transactions
        self.triggered.retain(|check| {
            if check.pair.component_id() == component_id {
                check.cancel();
                false
            } else {
                true
            }
        });
        self.pairs.retain(|check| {
            if check.pair.component_id() == component_id {
                check.cancel();
                false
            } else {
                true
            }
        });
        let all_nominated = self.component_ids.iter().all(|&component_id| {
            self.valid
                .iter()
                .any(|valid| valid.pair.component_id() == component_id && valid.nominated)
        });
        if !all_nominated {
            return selections;
        }
        // every component has a nominated pair, the checklist completes and
        // those pairs become the selected pairs
        for &component_id in self.component_ids.iter() {
            let valid = match self
                .valid
                .iter()
                .find(|valid| valid.pair.component_id() == component_id && valid.nominated)
            {
                Some(v) => v.pair.clone(),
                None => continue,
            };
            let component = self
                .components
                .iter()
                .find(|component| component.id == component_id)
                .cloned();
            let local_agent = self.local_agent_for_pair(&valid);
            match (component, local_agent) {
                (Some(component), Some(agent)) => {
                    selections.push((component, SelectedPair::new(valid, agent)));
                }
                _ => warn!(
                    "checklist {} cannot find component or agent for nominated pair {:?}",
                    self.checklist_id, valid
                ),
            }
        }
        debug!(
            "checklist {} state change from {:?} to Completed",
            self.checklist_id, self.state
        );
        self.state = CheckListState::Completed;
        selections
    }
}

#[derive(Debug, Clone, Copy)]
enum Nominate {
    True,
    False,
    DontCare,
}

impl PartialEq<Nominate> for Nominate {
    fn eq(&self, other: &Nominate) -> bool {
        matches!(self, &Nominate::DontCare)
            || matches!(other, &Nominate::DontCare)
            || (matches!(self, Nominate::True) && matches!(other, Nominate::True))
            || (matches!(self, Nominate::False) && matches!(other, Nominate::False))
    }
}
impl PartialEq<bool> for Nominate {
    fn eq(&self, other: &bool) -> bool {
        self == &Nominate::DontCare
            || (*other && self == &Nominate::True)
            || (!*other && self == &Nominate::False)
    }
}

impl ConnCheckList {
    pub(crate) fn new() -> Self {
        let checklist_id = CONN_CHECK_LIST_COUNT.fetch_add(1, Ordering::SeqCst);
        Self {
            checklist_id,
            inner: Arc::new(Mutex::new(ConnCheckListInner::new(checklist_id))),
        }
    }

    fn state(&self) -> CheckListState {
        self.inner.lock().unwrap().state
    }

    fn controlling(&self) -> bool {
        self.inner.lock().unwrap().controlling
    }

    pub(crate) fn configure(&self, controlling: bool, tie_breaker: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.controlling = controlling;
        inner.tie_breaker = tie_breaker;
    }

    fn set_controlling(&self, controlling: bool) {
        self.inner.lock().unwrap().controlling = controlling;
    }

    pub(crate) fn set_local_credentials(&self, credentials: Credentials) {
        let mut inner = self.inner.lock().unwrap();
        for local in inner.local_candidates.iter() {
            local
                .stun_agent
                .set_local_credentials(MessageIntegrityCredentials::ShortTerm(
                    credentials.clone().into(),
                ));
        }
        inner.local_credentials = Some(credentials);
    }

    pub(crate) fn set_remote_credentials(&self, credentials: Credentials) {
        let mut inner = self.inner.lock().unwrap();
        for local in inner.local_candidates.iter() {
            local
                .stun_agent
                .set_remote_credentials(MessageIntegrityCredentials::ShortTerm(
                    credentials.clone().into(),
                ));
        }
        inner.remote_credentials = Some(credentials);
    }

    pub(crate) fn end_of_remote_candidates(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug!("checklist {} end of remote candidates", inner.checklist_id);
        inner.remote_end_of_candidates = true;
    }

    pub(crate) fn components(&self) -> Vec<Component> {
        self.inner.lock().unwrap().components.to_vec()
    }

    async fn handle_binding_request(
        weak_inner: Weak<Mutex<ConnCheckListInner>>,
        component_id: usize,
        local: &Candidate,
        agent: StunAgent,
        msg: &Message,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<Option<Message>, AgentError> {
        trace!("have request {}", msg);

        let local_credentials = agent
            .local_credentials()
            .ok_or(AgentError::ResourceNotFound)?;
        let remote_credentials = agent
            .remote_credentials()
            .ok_or(AgentError::ResourceNotFound)?;

        if let Some(error_msg) = Message::check_attribute_types(
            msg,
            &[
                USERNAME,
                FINGERPRINT,
                MESSAGE_INTEGRITY,
                ICE_CONTROLLED,
                ICE_CONTROLLING,
                PRIORITY,
                USE_CANDIDATE,
            ],
            &[FINGERPRINT, MESSAGE_INTEGRITY, PRIORITY],
        ) {
            // failure -> send error response
            return Ok(Some(error_msg));
        }
        msg.validate_integrity(data, &remote_credentials)?;

        let priority = match msg
            .get_attribute(PRIORITY)
            .and_then(|raw| Priority::try_from(raw).ok())
        {
            Some(p) => p.priority(),
            None => {
                return Ok(Some(Message::bad_request(msg)?));
            }
        };

        let peer_nominating = if let Some(use_candidate_raw) = msg.get_attribute(USE_CANDIDATE) {
            if UseCandidate::try_from(use_candidate_raw).is_ok() {
                true
            } else {
                return Ok(Some(Message::bad_request(msg)?));
            }
        } else {
            false
        };

        let mut selections = vec![];
        {
            let checklist = weak_inner.upgrade().ok_or(AgentError::ConnectionClosed)?;
            let mut checklist = checklist.lock().unwrap();

            // RFC 8445 7.3.1.1: role conflict resolution using the tie
            // breakers.  The loser either switches role or answers 487.
            if checklist.controlling {
                if let Some(controlling) = msg
                    .get_attribute(ICE_CONTROLLING)
                    .and_then(|raw| IceControlling::try_from(raw).ok())
                {
                    if checklist.tie_breaker >= controlling.tie_breaker() {
                        debug!(
                            "checklist {} role conflict, keeping controlling role",
                            checklist.checklist_id
                        );
                        let mut response = Message::new_error(msg);
                        response.add_attribute(
                            ErrorCode::new(ROLE_CONFLICT, "Role Conflict")?.into(),
                        )?;
                        response.add_message_integrity(&local_credentials)?;
                        response.add_fingerprint()?;
                        return Ok(Some(response));
                    } else {
                        info!(
                            "checklist {} role conflict, switching to controlled",
                            checklist.checklist_id
                        );
                        checklist.controlling = false;
                    }
                }
            } else if let Some(controlled) = msg
                .get_attribute(ICE_CONTROLLED)
                .and_then(|raw| IceControlled::try_from(raw).ok())
            {
                if checklist.tie_breaker >= controlled.tie_breaker() {
                    info!(
                        "checklist {} role conflict, switching to controlling",
                        checklist.checklist_id
                    );
                    checklist.controlling = true;
                } else {
                    debug!(
                        "checklist {} role conflict, keeping controlled role",
                        checklist.checklist_id
                    );
                    let mut response = Message::new_error(msg);
                    response
                        .add_attribute(ErrorCode::new(ROLE_CONFLICT, "Role Conflict")?.into())?;
                    response.add_message_integrity(&local_credentials)?;
                    response.add_fingerprint()?;
                    return Ok(Some(response));
                }
            }

            debug!(
                "checklist {} have request peer nominating {} list state {:?}",
                checklist.checklist_id, peer_nominating, checklist.state
            );
            if checklist.state == CheckListState::Completed && !peer_nominating {
                // ignore binding requests if we are completed
                return Ok(None);
            }

            let remote = checklist
                .find_remote_candidate(component_id, local.transport_type, from)
                .unwrap_or_else(|| {
                    // RFC 8445 7.3.1.3: an unknown source transport address
                    // is a new peer-reflexive remote candidate.  The priority
                    // comes from the PRIORITY attribute in the request, the
                    // foundation is arbitrary until the peer signals the
                    // candidate itself.
                    let cand = Candidate::builder(
                        component_id,
                        CandidateType::PeerReflexive,
                        local.transport_type,
                        "rflx",
                        from,
                    )
                    .priority(priority)
                    .build();
                    debug!(
                        "checklist {} new peer reflexive remote {:?}",
                        checklist.checklist_id, cand
                    );
                    checklist.add_remote_candidate(cand.clone());
                    cand
                });
            // RFC 8445 Section 7.3.1.4. Triggered Checks
            let pair = CandidatePair::new(local.clone(), remote);
            if let Some(mut check) = checklist.take_matching_check(&pair) {
                trace!(
                    "checklist {} found existing check {:?}",
                    checklist.checklist_id,
                    check
                );
                match check.state() {
                    CandidatePairState::Succeeded => {
                        // nothing further to do unless the peer nominates
                        if peer_nominating {
                            debug!(
                                "checklist {} existing pair succeeded -> nominate",
                                checklist.checklist_id
                            );
                            check = Arc::new(ConnCheck::new(
                                check.pair.clone(),
                                check.agent.clone(),
                                true,
                            ));
                            check.set_state(CandidatePairState::Succeeded);
                            checklist.add_check(check);
                            selections = checklist.nominated_pair(pair.component_id(), &pair);
                        } else {
                            checklist.add_check(check);
                        }
                    }
                    // an in-progress transaction is cancelled and the pair
                    // requeued for a fresh triggered check
                    CandidatePairState::InProgress => {
                        check.cancel();
                        if peer_nominating {
                            check = Arc::new(ConnCheck::new(
                                check.pair.clone(),
                                check.agent.clone(),
                                true,
                            ));
                        }
                        check.set_state(CandidatePairState::Waiting);
                        checklist.add_check(check.clone());
                        checklist.add_triggered(check);
                    }
                    CandidatePairState::Waiting
                    | CandidatePairState::Frozen
                    | CandidatePairState::Failed => {
                        if peer_nominating {
                            check = Arc::new(ConnCheck::new(
                                check.pair.clone(),
                                check.agent.clone(),
                                true,
                            ));
                        }
                        check.set_state(CandidatePairState::Waiting);
                        checklist.add_check(check.clone());
                        checklist.add_triggered(check);
                    }
                }
            } else {
                debug!(
                    "checklist {} creating new check for pair {:?}",
                    checklist.checklist_id, pair
                );
                let check = Arc::new(ConnCheck::new(pair, agent.clone(), peer_nominating));
                check.set_state(CandidatePairState::Waiting);
                checklist.pairs.push_back(check.clone());
                checklist.add_triggered(check);
            }
        }

        let mut response = Message::new_success(msg);
        response.add_attribute(XorMappedAddress::new(from, msg.transaction_id())?.into())?;
        response.add_message_integrity(&local_credentials)?;
        response.add_fingerprint()?;

        for (component, selected) in selections {
            component.set_selected_pair(selected).await;
            component.set_state(ComponentState::Connected).await;
        }

        Ok(Some(response))
    }

    pub(crate) async fn add_local_candidate(
        &self,
        component: &Component,
        local: Candidate,
        agent: StunAgent,
    ) {
        let component_id = component.id;
        let checklist_id = self.checklist_id;
        debug!(
            "checklist {} adding local component {} {:?}",
            self.checklist_id, component_id, local
        );

        {
            let inner = self.inner.lock().unwrap();
            if let Some(credentials) = inner.local_credentials.clone() {
                agent.set_local_credentials(MessageIntegrityCredentials::ShortTerm(
                    credentials.into(),
                ));
            }
            if let Some(credentials) = inner.remote_credentials.clone() {
                agent.set_remote_credentials(MessageIntegrityCredentials::ShortTerm(
                    credentials.into(),
                ));
            }
        }

        let weak_inner = Arc::downgrade(&self.inner);
        let (stun_send, stun_recv) = oneshot::channel();

        // We need to listen for and respond to stun binding requests for the
        // local candidate
        let (abortable, stun_abort_handle) = futures::future::abortable({
            let agent = agent.clone();
            let local = local.clone();
            async move {
                let drop_log = DropLogger::new("dropping stun receive stream");
                let mut recv_stun = agent.receive_stream_filter(|stun_or_data| {
                    matches!(stun_or_data, crate::stun::agent::StunOrData::Stun(_, _, _))
                });
                if stun_send.send(()).is_err() {
                    return;
                }
                while let Some(stun_or_data) = recv_stun.next().await {
                    let (msg, data, from) = match stun_or_data.stun() {
                        Some(v) => v,
                        None => continue,
                    };
                    // RFC 8445 Section 7.3. STUN Server Procedures
                    trace!("got from {} msg {}", from, msg);
                    if msg.has_class(MessageClass::Request) && msg.has_method(BINDING) {
                        match ConnCheckList::handle_binding_request(
                            weak_inner.clone(),
                            component_id,
                            &local,
                            agent.clone(),
                            &msg,
                            &data,
                            from,
                        )
                        .await
                        {
                            Ok(Some(response)) => {
                                trace!(
                                    "checklist {} component {} sending response {}",
                                    checklist_id,
                                    component_id,
                                    response
                                );
                                if let Err(e) = agent.send_to(response, from).await {
                                    warn!("error! {:?}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                // a request may arrive before the remote
                                // credentials are known, keep listening
                                warn!("failed to handle request: {:?}", e);
                            }
                            _ => (),
                        }
                    }
                }
                drop(drop_log);
            }
        });

        async_std::task::spawn(abortable);
        if stun_recv.await.is_err() {
            warn!("failed to start stun receive task");
            return;
        }
        let data_abort_handle = component.add_recv_agent(agent.clone()).await;
        trace!(
            "checklist {} added recv task for candidate {:?}",
            self.checklist_id,
            local
        );

        {
            let mut inner = self.inner.lock().unwrap();
            inner.local_candidates.push(ConnCheckLocalCandidate {
                component_id,
                candidate: local,
                stun_agent: agent,
                stun_recv_abort: stun_abort_handle,
                data_recv_abort: data_abort_handle,
            });
            let existing = inner
                .components
                .iter()
                .any(|existing| existing.id == component_id);
            if !existing {
                debug!(
                    "checklist {} adding component {}",
                    self.checklist_id, component_id
                );
                inner.component_ids.push(component_id);
                inner.components.push(component.clone());
            }
        }
    }

    pub(crate) fn add_remote_candidate(&self, component_id: usize, remote: Candidate) {
        let mut inner = self.inner.lock().unwrap();
        inner.add_remote_candidate(remote);
        if !inner.component_ids.iter().any(|&v| v == component_id) {
            inner.component_ids.push(component_id);
        }
    }

    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        for check in inner.triggered.iter().chain(inner.pairs.iter()) {
            check.cancel();
        }
        for local in inner.local_candidates.drain(..) {
            local.stun_recv_abort.abort();
            local.data_recv_abort.abort();
        }
    }

    fn generate_checks(&self, nominate: bool) {
        let mut inner = self.inner.lock().unwrap();
        let mut checks = vec![];
        for local in inner.local_candidates.iter() {
            for remote in inner.remote_candidates.iter() {
                if local.candidate.can_pair_with(remote) {
                    let pair = CandidatePair::new(local.candidate.clone(), remote.clone());
                    if inner
                        .pairs
                        .iter()
                        .any(|check| check.pair.local == pair.local && check.pair.remote == pair.remote)
                    {
                        continue;
                    }
                    checks.push(Arc::new(ConnCheck::new(
                        pair,
                        local.stun_agent.clone(),
                        nominate,
                    )));
                }
            }
        }
        let pairs = checks.iter().map(|c| &c.pair).collect::<Vec<_>>();
        debug!(
            "checklist {} generated checks for pairs {:?}",
            self.checklist_id, pairs
        );
        inner.pairs.extend(checks);
    }

    fn initial_thaw(&self, thawn_foundations: &mut Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        debug!(
            "checklist {} state change from {:?} to Running",
            self.checklist_id, inner.state
        );
        inner.state = CheckListState::Running;

        for check in inner.pairs.iter() {
            check.set_state(CandidatePairState::Frozen);
        }

        // get all the candidates that don't match any of the already thawn
        // foundations
        let mut maybe_thaw: Vec<_> = inner
            .pairs
            .iter()
            .filter(|check| {
                !thawn_foundations
                    .iter()
                    .any(|foundation| &check.pair.foundation() == foundation)
            })
            .collect();
        // sort by component_id
        maybe_thaw.sort_unstable_by(|a, b| {
            a.pair.component_id().cmp(&b.pair.component_id())
        });

        // only keep the first candidate for a given foundation which should
        // correspond to the lowest component_id
        let mut seen_foundations = vec![];
        maybe_thaw.retain(|check| {
            if seen_foundations
                .iter()
                .any(|foundation| &check.pair.foundation() == foundation)
            {
                false
            } else {
                seen_foundations.push(check.pair.foundation());
                true
            }
        });

        debug!(
            "checklist {} thawing foundations {:?}",
            self.checklist_id, seen_foundations
        );

        // set them to waiting
        for check in maybe_thaw.iter() {
            check.set_state(CandidatePairState::Waiting);
        }

        // update the foundations seen for the next check list
        thawn_foundations.extend(seen_foundations);
    }

    fn next_triggered(&self) -> Option<Arc<ConnCheck>> {
        self.inner.lock().unwrap().triggered.pop_back()
    }

    #[cfg(test)]
    fn is_triggered(&self, needle: &Arc<ConnCheck>) -> bool {
        self.inner
            .lock()
            .unwrap()
            .triggered
            .iter()
            .any(|check| needle.pair == check.pair)
    }

    // RFC 8445 6.1.4.2: the highest-priority Waiting pair is checked first,
    // ties broken by the lowest component id.  The returned check is moved
    // to InProgress to avoid a race.
    fn next_waiting(&self) -> Option<Arc<ConnCheck>> {
        let inner = self.inner.lock().unwrap();
        let controlling = inner.controlling;
        let check = inner
            .pairs
            .iter()
            .filter(|check| check.state() == CandidatePairState::Waiting)
            .max_by(|a, b| {
                a.pair
                    .priority(controlling)
                    .cmp(&b.pair.priority(controlling))
                    .then_with(|| b.pair.component_id().cmp(&a.pair.component_id()))
            })
            .cloned();
        if let Some(check) = &check {
            check.set_state(CandidatePairState::InProgress);
        }
        check
    }

    // note this will change the returned check state to waiting to avoid a race
    fn next_frozen(&self, from_foundations: &[String]) -> Option<Arc<ConnCheck>> {
        let check = self
            .inner
            .lock()
            .unwrap()
            .pairs
            .iter()
            .find(|check| {
                check.state() == CandidatePairState::Frozen
                    && from_foundations
                        .iter()
                        .any(|f| f == &check.pair.foundation())
            })
            .cloned();
        if let Some(check) = &check {
            check.set_state(CandidatePairState::Waiting);
        }
        check
    }

    fn foundations(&self) -> std::collections::HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .pairs
            .iter()
            .map(|check| check.pair.foundation())
            .collect()
    }

    fn foundation_not_waiting_in_progress(&self, foundation: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .pairs
            .iter()
            .filter(|check| check.pair.foundation() == foundation)
            .all(|check| {
                let state = check.state();
                state != CandidatePairState::InProgress && state != CandidatePairState::Waiting
            })
    }

    fn add_valid(&self, pair: CandidatePair) {
        debug!("checklist {} adding valid {:?}", self.checklist_id, pair);
        let mut inner = self.inner.lock().unwrap();
        if !inner.valid.iter().any(|valid| valid.pair == pair) {
            inner.valid.push(ValidPair {
                pair,
                nominated: false,
            });
        }
    }

    fn remove_valid(&self, pair: &CandidatePair) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.valid.iter().position(|valid| &valid.pair == pair) {
            inner.valid.remove(idx);
        }
    }

    async fn nominated_pair(&self, component_id: usize, pair: &CandidatePair) {
        let selections = self
            .inner
            .lock()
            .unwrap()
            .nominated_pair(component_id, pair);
        for (component, selected) in selections {
            component.set_selected_pair(selected).await;
            component.set_state(ComponentState::Connected).await;
        }
    }

    fn get_matching_check(
        &self,
        pair: &CandidatePair,
        nominate: Nominate,
    ) -> Option<Arc<ConnCheck>> {
        self.inner.lock().unwrap().get_matching_check(pair, nominate)
    }

    pub(crate) fn local_candidates(&self) -> Vec<Candidate> {
        self.inner
            .lock()
            .unwrap()
            .local_candidates
            .iter()
            .map(|local| local.candidate.clone())
            .collect()
    }

    pub(crate) fn remote_candidates(&self) -> Vec<Candidate> {
        self.inner.lock().unwrap().remote_candidates.to_vec()
    }

    // regular nomination: repeat the highest-priority valid pair per
    // component with USE-CANDIDATE set
    fn try_nominate(&self) {
        let mut inner = self.inner.lock().unwrap();

        let controlling = inner.controlling;
        let to_nominate: Vec<_> = inner
            .component_ids
            .iter()
            .cloned()
            .map(|component_id| {
                inner
                    .valid
                    .iter()
                    .filter(|valid| valid.pair.component_id() == component_id)
                    .max_by_key(|valid| valid.pair.priority(controlling))
                    .map(|valid| valid.pair.clone())
            })
            .collect();
        if to_nominate.iter().all(|pair| pair.is_some()) {
            for pair in to_nominate.into_iter().flatten() {
                if inner
                    .get_matching_check(&pair, Nominate::True)
                    .is_some()
                {
                    continue;
                }
                if let Some(agent) = inner.local_agent_for_pair(&pair) {
                    debug!(
                        "checklist {} nominating pair {:?}",
                        inner.checklist_id, pair
                    );
                    let check = Arc::new(ConnCheck::new(pair, agent, true));
                    check.set_state(CandidatePairState::Waiting);
                    inner.add_check(check.clone());
                    inner.add_triggered(check);
                }
            }
        }
    }

    // a checklist with nothing left to try and nothing valid has failed
    async fn check_for_failure(&self) {
        let components = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != CheckListState::Running {
                return;
            }
            let any_active = inner.pairs.iter().any(|check| {
                !matches!(check.state(), CandidatePairState::Failed)
            }) || !inner.triggered.is_empty();
            if any_active || !inner.valid.is_empty() {
                return;
            }
            if inner.pairs.is_empty() && !inner.remote_end_of_candidates {
                // trickling may still produce pairs
                return;
            }
            debug!(
                "checklist {} state change from {:?} to Failed",
                inner.checklist_id, inner.state
            );
            inner.state = CheckListState::Failed;
            inner.components.to_vec()
        };
        for component in components {
            component.set_state(ComponentState::Failed).await;
        }
    }
}

#[derive(Debug)]
enum ConnCheckResponse {
    Success(Arc<ConnCheck>, SocketAddr),
    RoleConflict(Arc<ConnCheck>, bool),
    Failure(Arc<ConnCheck>),
}

#[derive(Debug)]
pub(crate) struct ConnCheckListSet {
    checklists: Vec<Arc<ConnCheckList>>,
    tasks: Arc<TaskList>,
    tie_breaker: u64,
    check_interval: Duration,
    aggressive_nomination: bool,
}

impl ConnCheckListSet {
    pub(crate) fn from_streams(
        streams: Vec<Arc<crate::stream::Stream>>,
        tasks: Arc<TaskList>,
        controlling: bool,
        tie_breaker: u64,
        check_interval: Duration,
        aggressive_nomination: bool,
    ) -> Self {
        Self {
            checklists: streams
                .iter()
                .map(|s| s.checklist.clone())
                .inspect(|checklist| checklist.configure(controlling, tie_breaker))
                .collect(),
            tasks,
            tie_breaker,
            check_interval,
            aggressive_nomination,
        }
    }

    async fn connectivity_check_cancellable(
        conncheck: Arc<ConnCheck>,
        controlling: bool,
        tie_breaker: u64,
        nominate: bool,
    ) -> Result<ConnCheckResponse, AgentError> {
        let abort_registration = {
            let mut inner = conncheck.state.lock().unwrap();
            if inner.abort_handle.is_some() {
                return Err(AgentError::AlreadyInProgress);
            }

            let (abort_handle, abort_registration) = AbortHandle::new_pair();
            inner.abort_handle = Some(abort_handle);
            abort_registration
        };

        let abortable = Abortable::new(
            ConnCheck::connectivity_check(conncheck, controlling, tie_breaker, nominate),
            abort_registration,
        );
        async_std::task::spawn(async move {
            match abortable.await {
                Ok(v) => v,
                Err(_) => Err(AgentError::Aborted),
            }
        })
        .await
    }

    async fn perform_conncheck(
        conncheck: Arc<ConnCheck>,
        checklist: Arc<ConnCheckList>,
        checklists: Vec<Arc<ConnCheckList>>,
        controlling: bool,
        tie_breaker: u64,
    ) -> Result<(), AgentError> {
        trace!("performing connectivity {:?}", &conncheck);
        match ConnCheckListSet::connectivity_check_cancellable(
            conncheck.clone(),
            controlling,
            tie_breaker,
            conncheck.nominate(),
        )
        .await
        {
            Err(e) => {
                warn!("conncheck error: {:?} {:?}", e, conncheck);
                conncheck.set_state(CandidatePairState::Failed);
                checklist.remove_valid(&conncheck.pair);
                if !matches!(e, AgentError::Aborted) {
                    checklist.check_for_failure().await;
                }
            }
            Ok(ConnCheckResponse::Failure(conncheck)) => {
                warn!("conncheck failure: {:?}", conncheck);
                conncheck.set_state(CandidatePairState::Failed);
                checklist.remove_valid(&conncheck.pair);
                checklist.check_for_failure().await;
            }
            Ok(ConnCheckResponse::RoleConflict(conncheck, new_controlling)) => {
                // RFC 8445 7.2.5.1: switch role and retry the check
                info!(
                    "role conflict signalled, switching to {}",
                    if new_controlling {
                        "controlling"
                    } else {
                        "controlled"
                    }
                );
                checklist.set_controlling(new_controlling);
                // retire this check, the retry below supersedes it
                conncheck.set_state(CandidatePairState::Failed);
                let retry = Arc::new(ConnCheck::new(
                    conncheck.pair.clone(),
                    conncheck.agent.clone(),
                    conncheck.nominate(),
                ));
                retry.set_state(CandidatePairState::Waiting);
                let mut inner = checklist.inner.lock().unwrap();
                inner.add_check(retry.clone());
                inner.add_triggered(retry);
            }
            Ok(ConnCheckResponse::Success(conncheck, addr)) => {
                debug!(
                    "checklist {} succeeded in finding connection {:?}",
                    checklist.checklist_id, conncheck
                );
                conncheck.set_state(CandidatePairState::Succeeded);

                let mut pair_dealt_with = false;
                let ok_pair = conncheck.pair.construct_valid(addr);
                // RFC 8445 7.2.5.3.2 Constructing a Valid Pair
                // 1. the valid pair matches the generating pair
                if checklist
                    .get_matching_check(&ok_pair, Nominate::DontCare)
                    .is_some()
                {
                    checklist.add_valid(ok_pair.clone());
                    if conncheck.nominate() {
                        checklist
                            .nominated_pair(conncheck.pair.component_id(), &conncheck.pair)
                            .await;
                        return Ok(());
                    }
                    pair_dealt_with = true;
                } else {
                    // 2. the valid pair matches another checklist's pair
                    for checklist in checklists.iter() {
                        if let Some(check) =
                            checklist.get_matching_check(&ok_pair, Nominate::DontCare)
                        {
                            checklist.add_valid(check.pair.clone());
                            if conncheck.nominate() {
                                checklist
                                    .nominated_pair(conncheck.pair.component_id(), &conncheck.pair)
                                    .await;
                                return Ok(());
                            }
                            pair_dealt_with = true;
                            break;
                        }
                    }
                }
                // 3. the valid pair is a new (peer-reflexive derived) pair
                if !pair_dealt_with {
                    checklist.add_valid(ok_pair);
                    checklist.add_valid(conncheck.pair.clone());

                    if conncheck.nominate() {
                        checklist
                            .nominated_pair(conncheck.pair.component_id(), &conncheck.pair)
                            .await;
                        return Ok(());
                    }
                }
                // try and nominate some pair
                if controlling {
                    checklist.try_nominate();
                }
            }
        }
        Ok(())
    }

    // RFC8445: 6.1.4.2. Performing Connectivity Checks
    fn get_next_check(&self, checklist: &Arc<ConnCheckList>) -> Option<Arc<ConnCheck>> {
        // 1.  triggered checks have the highest precedence
        if let Some(check) = checklist.next_triggered() {
            check.set_state(CandidatePairState::InProgress);
            trace!(
                "checklist {} next check was a triggered check {:?}",
                checklist.checklist_id,
                check
            );
            Some(check)
        // 2.  highest-priority waiting pair
        } else if let Some(check) = checklist.next_waiting() {
            trace!(
                "checklist {} next check was a waiting check {:?}",
                checklist.checklist_id,
                check
            );
            Some(check)
        } else {
            // 3.  unfreeze a frozen pair whose foundation has no waiting or
            //     in-progress pair in any checklist of the set
            let mut foundations = std::collections::HashSet::new();
            for checklist in self.checklists.iter() {
                for f in checklist.foundations() {
                    foundations.insert(f);
                }
            }
            let next: Vec<_> = foundations
                .into_iter()
                .filter(|f| {
                    self.checklists
                        .iter()
                        .all(|checklist| checklist.foundation_not_waiting_in_progress(f))
                })
                .collect();
            trace!(
                "checklist {} current foundations not waiting or in progress: {:?}",
                checklist.checklist_id,
                next
            );

            if let Some(check) = checklist.next_frozen(&next) {
                trace!(
                    "checklist {} next check was a frozen check {:?}",
                    checklist.checklist_id,
                    check
                );
                check.set_state(CandidatePairState::InProgress);
                Some(check)
            } else {
                trace!("checklist {} no next check for stream", checklist.checklist_id);
                None
            }
        }
    }

    pub(crate) async fn agent_conncheck_process(&self) -> Result<(), AgentError> {
        if self.checklists.is_empty() {
            return Ok(());
        }
        // perform initial set up
        for checklist in self.checklists.iter() {
            for component in checklist.components() {
                component.set_state(ComponentState::Connecting).await;
            }
            checklist.generate_checks(self.aggressive_nomination);
        }

        let mut thawn_foundations = vec![];
        for checklist in self.checklists.iter() {
            checklist.initial_thaw(&mut thawn_foundations);
        }

        let mut running = RunningCheckListSet::from_set(self);

        loop {
            match running.process_next().await {
                CheckListSetProcess::Completed => break,
                CheckListSetProcess::HaveCheck(check) => {
                    if self.tasks.add_task(check.perform().boxed()).await.is_err() {
                        // task receiver has stopped, can't push tasks
                        warn!("checklistset stopping processing as task receiver has stopped");
                        break;
                    }
                }
                CheckListSetProcess::NothingToDo => (),
            }
            Delay::new(self.check_interval).await;
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        for checklist in self.checklists.iter() {
            checklist.close();
        }
    }
}

#[derive(Debug)]
struct OutstandingConnCheck {
    conncheck: Arc<ConnCheck>,
    checklist: Arc<ConnCheckList>,
    checklists: Vec<Arc<ConnCheckList>>,
    controlling: bool,
    tie_breaker: u64,
}

impl OutstandingConnCheck {
    async fn perform(self) -> Result<(), AgentError> {
        ConnCheckListSet::perform_conncheck(
            self.conncheck,
            self.checklist,
            self.checklists,
            self.controlling,
            self.tie_breaker,
        )
        .await
    }
}

#[derive(Debug)]
enum CheckListSetProcess {
    HaveCheck(OutstandingConnCheck),
    NothingToDo,
    Completed,
}

struct RunningCheckListSet<'set> {
    set: &'set ConnCheckListSet,
    checklist_i: usize,
}

impl<'set> RunningCheckListSet<'set> {
    pub(crate) fn from_set(set: &'set ConnCheckListSet) -> Self {
        Self {
            set,
            checklist_i: 0,
        }
    }

    // perform one tick of the connection state machine
    pub(crate) async fn process_next(&mut self) -> CheckListSetProcess {
        let mut any_running = false;
        let mut examined = 0;
        loop {
            let checklist = &self.set.checklists[self.checklist_i];
            self.checklist_i += 1;
            if self.checklist_i >= self.set.checklists.len() {
                self.checklist_i = 0;
            }
            if checklist.state() == CheckListState::Running {
                any_running = true;
            }
            let conncheck = match self.set.get_next_check(checklist) {
                Some(c) => c,
                None => {
                    checklist.check_for_failure().await;
                    examined += 1;
                    if examined >= self.set.checklists.len() {
                        // we looked at them all and none of the checklists
                        // could find anything to do
                        if !any_running {
                            return CheckListSetProcess::Completed;
                        } else {
                            return CheckListSetProcess::NothingToDo;
                        }
                    } else {
                        continue;
                    }
                }
            };

            return CheckListSetProcess::HaveCheck(OutstandingConnCheck {
                conncheck,
                checklist: checklist.clone(),
                checklists: self.set.checklists.to_vec(),
                controlling: checklist.controlling(),
                tie_breaker: self.set.tie_breaker,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::candidate::*;
    use crate::socket::{StunChannel, UdpSocketChannel};
    use async_std::net::UdpSocket;
    use async_std::task;
    use std::sync::Arc;

    fn init() {
        crate::tests::test_init_log();
    }

    struct Peer {
        channel: StunChannel,
        candidate: Candidate,
        agent: StunAgent,
    }

    impl Peer {
        async fn default() -> Self {
            Peer::builder().build().await
        }

        fn builder<'this>() -> PeerBuilder<'this> {
            PeerBuilder::default()
        }
    }

    struct PeerBuilder<'this> {
        foundation: Option<&'this str>,
        component_id: usize,
    }

    impl<'this> PeerBuilder<'this> {
        fn foundation(mut self, foundation: &'this str) -> Self {
            self.foundation = Some(foundation);
            self
        }

        fn component_id(mut self, component_id: usize) -> Self {
            self.component_id = component_id;
            self
        }

        async fn build(self) -> Peer {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let channel = StunChannel::UdpAny(UdpSocketChannel::new(socket));
            let addr = channel.local_addr().unwrap();
            let candidate = Candidate::builder(
                self.component_id,
                CandidateType::Host,
                TransportType::Udp,
                self.foundation.unwrap_or("0"),
                addr,
            )
            .build();
            let agent = StunAgent::new(channel.clone());

            Peer {
                channel,
                candidate,
                agent,
            }
        }
    }

    impl<'this> Default for PeerBuilder<'this> {
        fn default() -> Self {
            Self {
                foundation: None,
                component_id: 1,
            }
        }
    }

    #[test]
    fn get_candidates() {
        init();
        async_std::task::block_on(async move {
            let agent = Agent::builder().build();
            let stream = agent.add_stream(1, None).unwrap();
            let component = stream.component(1).unwrap();

            let local = Peer::default().await;
            let remote = Peer::default().await;

            let list = ConnCheckList::new();
            list.add_local_candidate(&component, local.candidate.clone(), local.agent.clone())
                .await;
            list.add_remote_candidate(component.id, remote.candidate.clone());

            // the candidate list is only what we put in
            let locals = list.local_candidates();
            assert_eq!(locals.len(), 1);
            assert_eq!(locals[0], local.candidate);
            let remotes = list.remote_candidates();
            assert_eq!(remotes.len(), 1);
            assert_eq!(remotes[0], remote.candidate);
        })
    }

    // simplified version of ConnCheckList handle_binding_request that doesn't
    // update any state
    async fn handle_binding_request(
        agent: &StunAgent,
        msg: &Message,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<Message, AgentError> {
        let local_credentials = agent.local_credentials().unwrap();
        let remote_credentials = agent.remote_credentials().unwrap();

        if let Some(error_msg) = Message::check_attribute_types(
            msg,
            &[
                USERNAME,
                FINGERPRINT,
                MESSAGE_INTEGRITY,
                ICE_CONTROLLED,
                ICE_CONTROLLING,
                PRIORITY,
                USE_CANDIDATE,
            ],
            &[FINGERPRINT, MESSAGE_INTEGRITY, PRIORITY],
        ) {
            return Ok(error_msg);
        }

        msg.validate_integrity(data, &remote_credentials)?;

        let mut response = Message::new_success(msg);
        response.add_attribute(XorMappedAddress::new(from, msg.transaction_id())?.into())?;
        response.add_message_integrity(&local_credentials)?;
        response.add_fingerprint()?;
        Ok(response)
    }

    #[test]
    fn conncheck_udp_host() {
        init();
        async_std::task::block_on(async move {
            let local_credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
                password: "local".to_owned(),
            });
            let remote_credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
                password: "remote".to_owned(),
            });
            // start the remote peer
            let remote = Peer::default().await;
            remote
                .agent
                .set_local_credentials(remote_credentials.clone());
            remote.agent.set_remote_credentials(local_credentials.clone());
            // set up the local peer
            let local = Peer::default().await;
            local.agent.set_local_credentials(local_credentials);
            local.agent.set_remote_credentials(remote_credentials);

            let mut remote_recv = remote.agent.receive_stream();
            task::spawn({
                let agent = remote.agent.clone();
                async move {
                    futures::pin_mut!(remote_recv);
                    while let Some(stun_or_data) = remote_recv.next().await {
                        if let Some((msg, data, from)) = stun_or_data.stun() {
                            debug!("received from {}: {:?}", from, msg);
                            if msg.has_class(MessageClass::Request) && msg.has_method(BINDING) {
                                agent
                                    .send_to(
                                        handle_binding_request(&agent, &msg, &data, from)
                                            .await
                                            .unwrap(),
                                        from,
                                    )
                                    .await
                                    .unwrap();
                            }
                        }
                    }
                }
            });

            let pair = CandidatePair::new(local.candidate.clone(), remote.candidate);
            let conncheck = Arc::new(ConnCheck::new(pair, local.agent, false));

            // this is what we're testing.  All of the above is setup for
            // performing this check
            let nominate = conncheck.nominate();
            let res = ConnCheckListSet::connectivity_check_cancellable(conncheck, true, 0, nominate)
                .await
                .unwrap();
            match res {
                ConnCheckResponse::Success(_check, addr) => {
                    assert_eq!(addr, local.channel.local_addr().unwrap());
                }
                _ => unreachable!(),
            }
        })
    }

    fn assert_list_contains_checks(list: &ConnCheckList, pairs: Vec<&CandidatePair>) {
        for pair in pairs.iter() {
            let check = list.get_matching_check(pair, Nominate::DontCare).unwrap();
            assert_eq!(&&check.pair, pair);
        }
    }

    #[test]
    fn checklist_generate_checks() {
        init();
        async_std::task::block_on(async move {
            let agent = Agent::builder().build();
            let stream = agent.add_stream(2, None).unwrap();
            let component1 = stream.component(1).unwrap();
            let component2 = stream.component(2).unwrap();
            let local1 = Peer::default().await;
            let remote1 = Peer::default().await;
            let local2 = Peer::builder().component_id(2).build().await;
            let remote2 = Peer::builder().component_id(2).build().await;
            let local3 = Peer::default().await;
            let remote3 = Peer::default().await;

            let list = ConnCheckList::new();
            list.add_local_candidate(&component1, local1.candidate.clone(), local1.agent)
                .await;
            list.add_remote_candidate(component1.id, remote1.candidate.clone());
            list.add_local_candidate(&component2, local2.candidate.clone(), local2.agent)
                .await;
            list.add_remote_candidate(component2.id, remote2.candidate.clone());
            list.add_local_candidate(&component1, local3.candidate.clone(), local3.agent)
                .await;
            list.add_remote_candidate(component1.id, remote3.candidate.clone());

            list.generate_checks(false);
            let pair1 = CandidatePair::new(local1.candidate.clone(), remote1.candidate.clone());
            let pair2 = CandidatePair::new(local2.candidate, remote2.candidate);
            let pair3 = CandidatePair::new(local3.candidate.clone(), remote3.candidate.clone());
            let pair4 = CandidatePair::new(local1.candidate, remote3.candidate);
            let pair5 = CandidatePair::new(local3.candidate, remote1.candidate);
            assert_list_contains_checks(&list, vec![&pair1, &pair2, &pair3, &pair4, &pair5]);
        });
    }

    #[test]
    fn checklists_initial_thaw() {
        init();
        async_std::task::block_on(async move {
            let agent = Agent::builder().build();
            let stream = agent.add_stream(2, None).unwrap();
            let component1 = stream.component(1).unwrap();
            let component2 = stream.component(2).unwrap();
            let list1 = ConnCheckList::new();
            let list2 = ConnCheckList::new();

            let local1 = Peer::builder().foundation("0").build().await;
            let remote1 = Peer::builder().foundation("0").build().await;
            let local2 = Peer::builder().foundation("0").component_id(2).build().await;
            let remote2 = Peer::builder().foundation("0").component_id(2).build().await;
            let local3 = Peer::builder().foundation("1").component_id(2).build().await;
            let remote3 = Peer::builder().foundation("1").component_id(2).build().await;

            list1
                .add_local_candidate(&component1, local1.candidate.clone(), local1.agent)
                .await;
            list1.add_remote_candidate(component1.id, remote1.candidate.clone());
            list2
                .add_local_candidate(&component2, local2.candidate.clone(), local2.agent)
                .await;
            list2.add_remote_candidate(component2.id, remote2.candidate.clone());
            list2
                .add_local_candidate(&component2, local3.candidate.clone(), local3.agent)
                .await;
            list2.add_remote_candidate(component2.id, remote3.candidate.clone());

            list1.generate_checks(false);
            list2.generate_checks(false);

            // generated pairs
            let pair1 = CandidatePair::new(local1.candidate, remote1.candidate);
            let pair2 = CandidatePair::new(local2.candidate.clone(), remote2.candidate.clone());
            let pair3 = CandidatePair::new(local3.candidate.clone(), remote3.candidate.clone());
            let pair4 = CandidatePair::new(local2.candidate, remote3.candidate);
            let pair5 = CandidatePair::new(local3.candidate, remote2.candidate);
            assert_list_contains_checks(&list1, vec![&pair1]);
            assert_list_contains_checks(&list2, vec![&pair2, &pair3, &pair4, &pair5]);

            let mut thawn = vec![];
            // thaw the first checklist with only a single pair will unfreeze
            // that pair
            list1.initial_thaw(&mut thawn);
            assert_eq!(thawn.len(), 1);
            assert_eq!(&thawn[0], &pair1.foundation());
            // thaw the second checklist with 2*2 pairs will unfreeze only the
            // foundations not unfrozen by the first checklist
            list2.initial_thaw(&mut thawn);
            assert_eq!(thawn.len(), 4);
            assert!(thawn.iter().any(|f| f == &pair2.foundation()));
            assert!(thawn.iter().any(|f| f == &pair3.foundation()));
            assert!(thawn.iter().any(|f| f == &pair4.foundation()));
            assert!(thawn.iter().any(|f| f == &pair5.foundation()));
            let check1 = list1.get_matching_check(&pair1, Nominate::DontCare).unwrap();
            assert_eq!(check1.state(), CandidatePairState::Waiting);
            let check2 = list2.get_matching_check(&pair2, Nominate::DontCare).unwrap();
            assert_eq!(check2.state(), CandidatePairState::Frozen);
            let check3 = list2.get_matching_check(&pair3, Nominate::DontCare).unwrap();
            assert_eq!(check3.state(), CandidatePairState::Waiting);
            let check4 = list2.get_matching_check(&pair4, Nominate::DontCare).unwrap();
            assert_eq!(check4.state(), CandidatePairState::Waiting);
            let check5 = list2.get_matching_check(&pair5, Nominate::DontCare).unwrap();
            assert_eq!(check5.state(), CandidatePairState::Waiting);
        });
    }

    #[test]
    fn next_waiting_picks_highest_priority() {
        init();
        async_std::task::block_on(async move {
            let local_low = Peer::builder().foundation("0").build().await;
            let local_high = Peer::builder().foundation("1").build().await;
            let remote = Peer::builder().foundation("2").build().await;

            let mut low_pair = CandidatePair::new(local_low.candidate.clone(), remote.candidate.clone());
            low_pair.local.priority = 100;
            let mut high_pair =
                CandidatePair::new(local_high.candidate.clone(), remote.candidate.clone());
            high_pair.local.priority = 5000;

            let list = ConnCheckList::new();
            {
                let mut inner = list.inner.lock().unwrap();
                let low = Arc::new(ConnCheck::new(low_pair, local_low.agent.clone(), false));
                low.set_state(CandidatePairState::Waiting);
                inner.add_check(low);
                let high = Arc::new(ConnCheck::new(
                    high_pair.clone(),
                    local_high.agent.clone(),
                    false,
                ));
                high.set_state(CandidatePairState::Waiting);
                inner.add_check(high);
            }

            let next = list.next_waiting().unwrap();
            assert_eq!(next.pair, high_pair);
            assert_eq!(next.state(), CandidatePairState::InProgress);
        });
    }

    #[test]
    fn nominate_ranks_by_role_priority() {
        init();
        async_std::task::block_on(async move {
            let agent = Agent::builder().build();
            let stream = agent.add_stream(1, None).unwrap();
            let component = stream.component(1).unwrap();

            let local1 = Peer::builder().foundation("0").build().await;
            let local2 = Peer::builder().foundation("1").build().await;
            let remote = Peer::builder().foundation("2").build().await;

            let list = ConnCheckList::new();
            list.configure(false, 0);
            list.add_local_candidate(&component, local1.candidate.clone(), local1.agent.clone())
                .await;
            list.add_local_candidate(&component, local2.candidate.clone(), local2.agent.clone())
                .await;
            list.add_remote_candidate(component.id, remote.candidate.clone());

            // mirrored priorities, only the role-dependent tie bit of the
            // pair priority separates the two valid pairs
            let mut pair_a = CandidatePair::new(local1.candidate.clone(), remote.candidate.clone());
            pair_a.local.priority = 100;
            pair_a.remote.priority = 200;
            let mut pair_b = CandidatePair::new(local2.candidate.clone(), remote.candidate.clone());
            pair_b.local.priority = 200;
            pair_b.remote.priority = 100;
            list.add_valid(pair_a.clone());
            list.add_valid(pair_b.clone());

            // as the controlled agent the pair with the higher remote
            // priority wins the nomination
            list.try_nominate();
            assert!(list.get_matching_check(&pair_a, Nominate::True).is_some());
            assert!(list.get_matching_check(&pair_b, Nominate::True).is_none());
        });
    }

    #[test]
    fn nominate_check_trumps_triggered() {
        init();
        async_std::task::block_on(async move {
            let local = Peer::default().await;
            let remote = Peer::default().await;
            let pair = CandidatePair::new(local.candidate.clone(), remote.candidate.clone());

            let list = ConnCheckList::new();
            let plain = Arc::new(ConnCheck::new(pair.clone(), local.agent.clone(), false));
            {
                let mut inner = list.inner.lock().unwrap();
                inner.add_triggered(plain);
            }
            let nominating = Arc::new(ConnCheck::new(pair, local.agent.clone(), true));
            {
                let mut inner = list.inner.lock().unwrap();
                inner.add_triggered(nominating.clone());
            }
            assert!(list.is_triggered(&nominating));
            let next = list.next_triggered().unwrap();
            assert!(next.nominate());
            assert!(list.next_triggered().is_none());
        });
    }
}
