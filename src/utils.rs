// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Arc, Mutex};

use rand::prelude::*;

pub(crate) struct DropLogger {
    msg: String,
}

impl DropLogger {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl Drop for DropLogger {
    fn drop(&mut self) {
        info!("{}", self.msg);
    }
}

#[derive(Clone)]
pub(crate) struct DebugWrapper<T>(&'static str, T);

impl<T> std::fmt::Debug for DebugWrapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl<T> std::ops::Deref for DebugWrapper<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.1
    }
}
impl<T> DebugWrapper<T> {
    pub(crate) fn wrap(obj: T, name: &'static str) -> Self {
        Self(name, obj)
    }
}

// characters allowed in ufrag/password values, RFC 8445 Section 5.3
const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

pub(crate) fn random_ice_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    String::from_utf8(
        (0..len)
            .map(|_| *ICE_CHARS.choose(&mut rng).unwrap())
            .collect(),
    )
    .unwrap()
}

#[derive(Debug, Clone)]
struct MaybeSender<T: std::fmt::Debug> {
    sender: async_channel::Sender<T>,
    filter: DebugWrapper<Arc<dyn Fn(&T) -> bool + Send + Sync + 'static>>,
}

#[derive(Debug)]
pub(crate) struct ChannelBroadcast<T: std::fmt::Debug> {
    senders: DebugWrapper<Mutex<BroadcastState<T>>>,
}

#[derive(Debug)]
struct BroadcastState<T: std::fmt::Debug> {
    senders: Vec<MaybeSender<T>>,
    closed: bool,
}

impl<T> Default for ChannelBroadcast<T>
where
    T: std::fmt::Debug,
{
    fn default() -> Self {
        Self {
            senders: DebugWrapper::wrap(
                Mutex::new(BroadcastState {
                    senders: vec![],
                    closed: false,
                }),
                "...",
            ),
        }
    }
}

impl<T: Clone> ChannelBroadcast<T>
where
    T: Clone + std::fmt::Debug,
{
    // only sends when @filter returns true
    pub(crate) fn channel_with_filter(
        &self,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> async_channel::Receiver<T> {
        let (send, recv) = async_channel::bounded(16);
        let mut inner = self.senders.lock().unwrap();
        if inner.closed {
            // receiver sees an immediately closed channel
            send.close();
            return recv;
        }
        inner.senders.push(MaybeSender {
            sender: send,
            filter: DebugWrapper::wrap(Arc::new(filter), "ChannelFilter"),
        });
        recv
    }

    pub(crate) fn channel(&self) -> async_channel::Receiver<T> {
        self.channel_with_filter(|_| true)
    }

    // no further items are delivered to any receiver after this returns
    pub(crate) fn close(&self) {
        let mut inner = self.senders.lock().unwrap();
        inner.closed = true;
        for channel in inner.senders.drain(..) {
            channel.sender.close();
        }
    }

    pub(crate) async fn broadcast(&self, data: T) {
        let channels = {
            let inner = self.senders.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.senders.clone()
        };

        trace!("sending to {} receivers", channels.len());
        let mut removed = vec![];
        for (i, channel) in channels.iter().enumerate() {
            if (channel.filter)(&data) {
                if channel.sender.send(data.clone()).await.is_err() {
                    removed.push(i);
                }
            }
        }

        if !removed.is_empty() {
            trace!("removing {} listeners", removed.len());
            let mut inner = self.senders.lock().unwrap();
            // XXX: may need a cookie value instead of relying on the sizes
            if inner.senders.len() == channels.len() {
                for i in removed.iter() {
                    inner.senders.remove(*i);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn channel() {
        init();
        task::block_on(async move {
            let cb = ChannelBroadcast::default();
            let recv = cb.channel();
            cb.broadcast(42).await;
            assert_eq!(42, recv.recv().await.unwrap());
        })
    }

    #[test]
    fn channel_filter() {
        init();
        task::block_on(async move {
            let cb = ChannelBroadcast::default();
            let recv = cb.channel_with_filter(|&v| v == 42);
            cb.broadcast(41).await;
            cb.broadcast(42).await;
            assert_eq!(42, recv.recv().await.unwrap());
        })
    }

    #[test]
    fn channel_closed() {
        init();
        task::block_on(async move {
            let cb = ChannelBroadcast::default();
            let recv = cb.channel();
            cb.broadcast(41).await;
            cb.close();
            cb.broadcast(42).await;
            assert_eq!(41, recv.recv().await.unwrap());
            assert!(recv.recv().await.is_err());
            // new channels after close are already closed
            let recv = cb.channel();
            assert!(recv.recv().await.is_err());
        })
    }

    #[test]
    fn ice_string_charset() {
        init();
        let s = random_ice_string(24);
        assert_eq!(s.len(), 24);
        assert!(s.bytes().all(|b| ICE_CHARS.contains(&b)));
    }

    #[test]
    fn ice_strings_differ() {
        init();
        assert_ne!(random_ice_string(24), random_ice_string(24));
    }
}
