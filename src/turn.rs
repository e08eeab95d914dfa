// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Minimal TURN client: an Allocate transaction (RFC 5766 Section 6)
//! producing the relayed transport address used for relayed candidates.

use std::net::SocketAddr;

use crate::agent::AgentError;
use crate::stun::agent::StunAgent;
use crate::stun::attribute::*;
use crate::stun::message::*;
use crate::stun::TransportType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

impl TurnCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub transport: TransportType,
    pub addr: SocketAddr,
    pub credentials: TurnCredentials,
}

fn allocate_request(
    credentials: Option<&LongTermCredentials>,
    realm: Option<&str>,
) -> Result<Message, AgentError> {
    let mut msg = Message::new_request_method(ALLOCATE);
    msg.add_attribute(RequestedTransport::new(RequestedTransport::UDP).into())?;
    if let Some(credentials) = credentials {
        msg.add_attribute(Username::new(&credentials.username)?.into())?;
        if let Some(realm) = realm {
            msg.add_attribute(Realm::new(realm)?.into())?;
        }
        msg.add_attribute(Nonce::new(&credentials.nonce)?.into())?;
        msg.add_message_integrity(&MessageIntegrityCredentials::LongTerm(credentials.clone()))?;
    }
    msg.add_fingerprint()?;
    Ok(msg)
}

fn relayed_address(response: &Message) -> Result<SocketAddr, AgentError> {
    let attr = response
        .get_attribute(XOR_RELAYED_ADDRESS)
        .ok_or(AgentError::Malformed)?;
    let xor = XorRelayedAddress::try_from(attr)?;
    Ok(xor.addr(response.transaction_id()))
}

/// Perform an Allocate transaction against @server using @agent's socket.
///
/// An initial unauthenticated request is expected to be challenged with a
/// 401 carrying REALM and NONCE; the request is then retried with
/// long-term credentials.  Returns the relayed transport address.
pub(crate) async fn allocate(
    agent: &StunAgent,
    server: &TurnServer,
) -> Result<SocketAddr, AgentError> {
    let msg = allocate_request(None, None)?;
    let (response, _data, _from) = agent.stun_request_transaction(&msg, server.addr).await?;

    if response.has_class(MessageClass::Success) {
        // server not requiring authentication
        return relayed_address(&response);
    }

    let error_code = response
        .get_attribute(ERROR_CODE)
        .and_then(|raw| ErrorCode::try_from(raw).ok())
        .ok_or(AgentError::Malformed)?;
    if error_code.code() != 401 {
        warn!(
            "allocate from {} refused with {} ({})",
            server.addr,
            error_code.code(),
            error_code.reason()
        );
        return Err(AgentError::ResourceNotFound);
    }

    let realm = response
        .get_attribute(REALM)
        .and_then(|raw| Realm::try_from(raw).ok())
        .ok_or(AgentError::Malformed)?;
    let nonce = response
        .get_attribute(NONCE)
        .and_then(|raw| Nonce::try_from(raw).ok())
        .ok_or(AgentError::Malformed)?;

    let credentials = LongTermCredentials {
        username: server.credentials.username.clone(),
        password: server.credentials.password.clone(),
        nonce: nonce.nonce().to_string(),
    };
    debug!(
        "allocate challenged by {}, retrying with credentials for realm {}",
        server.addr,
        realm.realm()
    );

    let msg = allocate_request(Some(&credentials), Some(realm.realm()))?;
    let (response, _data, _from) = agent.stun_request_transaction(&msg, server.addr).await?;
    if !response.has_class(MessageClass::Success) {
        let code = response
            .get_attribute(ERROR_CODE)
            .and_then(|raw| ErrorCode::try_from(raw).ok())
            .map(|err| err.code());
        warn!("authenticated allocate from {} failed {:?}", server.addr, code);
        return Err(AgentError::IntegrityCheckFailed);
    }

    let relayed = relayed_address(&response)?;
    if let Some(lifetime) = response
        .get_attribute(LIFETIME)
        .and_then(|raw| Lifetime::try_from(raw).ok())
    {
        debug!(
            "allocated {} on {} for {}s",
            relayed,
            server.addr,
            lifetime.lifetime()
        );
    }
    Ok(relayed)
}
