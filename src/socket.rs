// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! UDP socket channels.
//!
//! [`UdpSocketChannel`] wraps an unconnected socket with a broadcast
//! receive loop so multiple consumers can observe inbound datagrams.
//! [`UdpConnectionChannel`] is a view of such a socket restricted to a
//! single remote address.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_std::net::UdpSocket;
use async_std::prelude::*;

use crate::utils::ChannelBroadcast;

#[derive(Debug, Clone)]
pub enum StunChannel {
    UdpAny(UdpSocketChannel),
    Udp(UdpConnectionChannel),
}

impl StunChannel {
    pub fn receive_stream(&self) -> impl Stream<Item = (Vec<u8>, SocketAddr)> {
        match self {
            StunChannel::UdpAny(c) => c.receive_stream(),
            StunChannel::Udp(c) => c.channel().receive_stream(),
        }
    }

    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> std::io::Result<()> {
        match self {
            StunChannel::UdpAny(c) => c.send_to(data, to).await,
            StunChannel::Udp(c) => c.channel().send_to(data, to).await,
        }
    }

    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        match self {
            StunChannel::UdpAny(_) => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no remote address",
            )),
            StunChannel::Udp(c) => c.send(data).await,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        match self {
            StunChannel::UdpAny(c) => c.local_addr(),
            StunChannel::Udp(c) => c.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> Result<SocketAddr, std::io::Error> {
        match self {
            StunChannel::UdpAny(_) => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no remote address",
            )),
            StunChannel::Udp(c) => c.remote_addr(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UdpSocketChannel {
    socket: Arc<UdpSocket>,
    sender_broadcast: Arc<ChannelBroadcast<(Vec<u8>, SocketAddr)>>,
    inner: Arc<Mutex<UdpSocketChannelInner>>,
}

#[derive(Debug)]
struct UdpSocketChannelInner {
    receive_loop_started: bool,
}

impl UdpSocketChannel {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            sender_broadcast: Arc::new(ChannelBroadcast::default()),
            inner: Arc::new(Mutex::new(UdpSocketChannelInner {
                receive_loop_started: false,
            })),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    fn socket_receive_stream(socket: Arc<UdpSocket>) -> impl Stream<Item = (Vec<u8>, SocketAddr)> {
        // stream that continuously reads from a udp socket
        info!("starting udp receive stream for {:?}", socket.local_addr());
        futures::stream::unfold(socket, |socket| async move {
            let mut data = vec![0; 1500];
            socket
                .recv_from(&mut data)
                .await
                .ok()
                .map(|(len, from)| {
                    data.truncate(len);
                    trace!("got {} bytes from {:?}", data.len(), from);
                    ((data, from), socket)
                })
        })
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        broadcaster: &ChannelBroadcast<(Vec<u8>, SocketAddr)>,
    ) {
        let stream = UdpSocketChannel::socket_receive_stream(socket);
        futures::pin_mut!(stream);

        // send data to the receive channels
        while let Some(res) = stream.next().await {
            broadcaster.broadcast(res).await;
        }
        trace!("UdpSocket receive loop exited");
    }

    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(data, &to).await?;
        Ok(())
    }

    pub fn receive_stream(&self) -> impl Stream<Item = (Vec<u8>, SocketAddr)> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.receive_loop_started {
                async_std::task::spawn({
                    let socket = self.socket.clone();
                    let broadcaster = self.sender_broadcast.clone();
                    async move { UdpSocketChannel::receive_loop(socket, &broadcaster).await }
                });
                inner.receive_loop_started = true;
            }
        }
        self.sender_broadcast.channel()
    }
}

#[derive(Debug, Clone)]
pub struct UdpConnectionChannel {
    channel: UdpSocketChannel,
    to: SocketAddr,
}

impl UdpConnectionChannel {
    pub fn new(channel: UdpSocketChannel, to: SocketAddr) -> Self {
        Self { channel, to }
    }

    pub fn channel(&self) -> UdpSocketChannel {
        self.channel.clone()
    }

    pub fn receive_stream(&self) -> impl Stream<Item = Vec<u8>> {
        let channel = self.channel.clone();
        let to = self.to;
        channel
            .receive_stream()
            .filter_map(move |(data, from)| if from == to { Some(data) } else { None })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.channel.local_addr()
    }

    pub fn remote_addr(&self) -> Result<SocketAddr, std::io::Error> {
        Ok(self.to)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.channel.socket()
    }

    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        self.channel.send_to(data, self.to).await
    }
}
