//! Chunked APDU transport.
//!
//! One generic state machine fragments outgoing APDUs into fixed-size
//! wire chunks and reassembles incoming ones. The wire differences between
//! the legacy BLE controller, the newer BLE controller and USB HID live in
//! a [`ChunkLayout`] implementation.
//!
//! ```text
//!            ┌──────────────── chunk (≤ chunk_len) ───────────────┐
//!   BLE      │ tag │ seq BE │ total BE (seq 0) │ payload ...      │
//!   USB HID  │ channel BE │ tag │ seq BE │ total BE (seq 0) │ payload ... │ 00 pad │
//!            └────────────────────────────────────────────────────┘
//!
//!   Idle(seq=0) ──first chunk──▶ Receiving(seq>0) ──remaining=0──▶ Complete
//!      ▲                              │ error / INIT                   │
//!      └──────────────────────────────┴────────────── poll ────────────┘
//! ```

pub mod layout;
pub mod session;
pub mod transport;

pub use layout::{Chunk, ChunkLayout, LegacyBle, NegotiatedBle, Tag, UsbHid};
pub use session::{SendCursor, Session, TransportLock};
pub use transport::{ChunkedApduTransport, RxEvent};

/// Size of the shared APDU buffer (5-byte header + 255 data bytes).
pub const APDU_CAPACITY: usize = 5 + 255;

/// Largest chunk any layout produces (negotiated BLE MTU ceiling).
pub const MAX_CHUNK_LEN: usize = 156;
