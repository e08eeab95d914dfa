// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Length-prefixed payload framing.
//!
//! Compatibility codec for hosts that pass payloads across a foreign
//! boundary as `[i32 LE size][size bytes][4-byte type tag][i32 LE owned]`.
//! This is in-process plumbing, not a wire format seen by remote peers.

use byteorder::{ByteOrder, LittleEndian};

use crate::agent::AgentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPayload {
    pub data: Vec<u8>,
    pub type_tag: [u8; 4],
    pub owned: bool,
}

impl FramedPayload {
    pub fn new(data: Vec<u8>, type_tag: [u8; 4], owned: bool) -> Self {
        Self {
            data,
            type_tag,
            owned,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AgentError> {
        if self.data.len() > i32::MAX as usize {
            return Err(AgentError::TooBig);
        }
        let mut ret = Vec::with_capacity(self.data.len() + 12);
        let mut size = [0; 4];
        LittleEndian::write_i32(&mut size, self.data.len() as i32);
        ret.extend_from_slice(&size);
        ret.extend_from_slice(&self.data);
        ret.extend_from_slice(&self.type_tag);
        let mut owned = [0; 4];
        LittleEndian::write_i32(&mut owned, self.owned as i32);
        ret.extend_from_slice(&owned);
        Ok(ret)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AgentError> {
        if data.len() < 4 {
            return Err(AgentError::NotEnoughData);
        }
        let size = LittleEndian::read_i32(&data[..4]);
        if size < 0 {
            return Err(AgentError::InvalidSize);
        }
        let size = size as usize;
        // the advertised size plus trailing tag and owned flag must fit
        if data.len() < 4 + size + 8 {
            return Err(AgentError::NotEnoughData);
        }
        if data.len() > 4 + size + 8 {
            return Err(AgentError::InvalidSize);
        }
        let payload = data[4..4 + size].to_vec();
        let mut type_tag = [0; 4];
        type_tag.copy_from_slice(&data[4 + size..8 + size]);
        let owned = LittleEndian::read_i32(&data[8 + size..12 + size]) != 0;
        Ok(Self {
            data: payload,
            type_tag,
            owned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn frame_roundtrip() {
        init();
        let frame = FramedPayload::new(vec![1, 2, 3], *b"data", true);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes[..4], [3, 0, 0, 0]);
        assert_eq!(bytes[4..7], [1, 2, 3]);
        assert_eq!(&bytes[7..11], b"data");
        assert_eq!(bytes[11..], [1, 0, 0, 0]);
        assert_eq!(FramedPayload::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn frame_empty_payload() {
        init();
        let frame = FramedPayload::new(vec![], *b"\0\0\0\0", false);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(FramedPayload::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn frame_short_header() {
        init();
        assert!(matches!(
            FramedPayload::from_bytes(&[0, 0]),
            Err(AgentError::NotEnoughData)
        ));
    }

    #[test]
    fn frame_negative_size() {
        init();
        let mut bytes = FramedPayload::new(vec![], *b"\0\0\0\0", false)
            .to_bytes()
            .unwrap();
        LittleEndian::write_i32(&mut bytes[..4], -1);
        assert!(matches!(
            FramedPayload::from_bytes(&bytes),
            Err(AgentError::InvalidSize)
        ));
    }

    #[test]
    fn frame_truncated_data() {
        init();
        let mut bytes = FramedPayload::new(vec![1, 2, 3], *b"data", true)
            .to_bytes()
            .unwrap();
        bytes.truncate(bytes.len() - 5);
        assert!(matches!(
            FramedPayload::from_bytes(&bytes),
            Err(AgentError::NotEnoughData)
        ));
    }

    #[test]
    fn frame_trailing_garbage() {
        init();
        let mut bytes = FramedPayload::new(vec![1, 2, 3], *b"data", true)
            .to_bytes()
            .unwrap();
        bytes.push(0);
        assert!(matches!(
            FramedPayload::from_bytes(&bytes),
            Err(AgentError::InvalidSize)
        ));
    }
}
