use crate::frame::{self, FRAME_TAG};
use crate::hex;

/// An immutable APDU payload plus its frame split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    data: Vec<u8>,
    prevent_chunking: bool,
}

impl Apdu {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            prevent_chunking: false,
        }
    }

    /// Builds an APDU from a hex string. Invalid hex (odd length or a
    /// non-hex digit) yields an APDU with empty data, never a panic.
    pub fn from_hex(value: &str) -> Self {
        Self::new(hex::hex_to_bytes(value))
    }

    /// The MTU probe written right after GATT discovery. Sent as a single
    /// frame; the device answers with its usable frame size.
    pub fn infer_mtu() -> Self {
        Self {
            data: vec![0x08, 0x00, 0x00, 0x00, 0x00],
            prevent_chunking: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Transmission frames for this payload at the session MTU.
    /// Non-empty exactly when the payload is non-empty.
    ///
    /// A `prevent_chunking` payload goes out as one tagged frame with only
    /// the index header; there is never a second frame, so no length field.
    pub fn frames(&self, mtu: usize) -> Vec<Vec<u8>> {
        if self.data.is_empty() {
            Vec::new()
        } else if self.prevent_chunking {
            let mut single = Vec::with_capacity(3 + self.data.len());
            single.push(FRAME_TAG);
            single.extend_from_slice(&0u16.to_be_bytes());
            single.extend_from_slice(&self.data);
            vec![single]
        } else {
            frame::chunk(&self.data, mtu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_hex_yields_empty_apdu() {
        for raw in ["e0d8000", "zz", "0x90"] {
            let apdu = Apdu::from_hex(raw);
            assert!(apdu.is_empty(), "{raw:?} should not parse");
            assert!(apdu.frames(153).is_empty());
        }
    }

    #[test]
    fn valid_hex_round_trips() {
        let apdu = Apdu::from_hex("b001000000");
        assert_eq!(apdu.data(), &[0xB0, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn infer_mtu_probe_is_a_single_tagged_frame() {
        let frames = Apdu::infer_mtu().frames(153);
        assert_eq!(
            frames,
            vec![vec![0x05, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]]
        );
    }

    #[test]
    fn frames_empty_iff_payload_empty() {
        assert!(Apdu::new(Vec::new()).frames(20).is_empty());
        assert!(!Apdu::new(vec![0x00]).frames(20).is_empty());
    }
}
