//! Framing codec for APDU exchange with Ledger-family BLE devices.

pub mod apdu;
pub mod frame;
pub mod hex;
pub mod status;

pub use apdu::Apdu;
pub use frame::{chunk, FrameError, FrameReassembler, FRAME_TAG};
pub use hex::{hex_to_bytes, is_valid_hex, HexError};
pub use status::{split_status, StatusWord, SW_APP_NOT_AVAILABLE, SW_OK, SW_USER_REJECTED};
