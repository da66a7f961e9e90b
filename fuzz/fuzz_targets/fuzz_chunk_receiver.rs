//! Fuzz target: `ChunkedApduTransport::receive`
//!
//! Splits arbitrary bytes into chunks (first byte of each piece is its
//! length) and feeds them to every layout. Reception must never panic and
//! a completed APDU never exceeds the buffer.
//!
//! cargo fuzz run fuzz_chunk_receiver

#![no_main]

use apdu_link::apdu::{ChunkLayout, ChunkedApduTransport, LegacyBle, NegotiatedBle, RxEvent, UsbHid, APDU_CAPACITY};
use libfuzzer_sys::fuzz_target;

fn drive<L: ChunkLayout>(layout: L, mut data: &[u8]) {
    let mut t = ChunkedApduTransport::new(layout);
    while let Some((&n, rest)) = data.split_first() {
        let n = usize::from(n).min(rest.len());
        let (chunk, tail) = rest.split_at(n);
        data = tail;

        match t.receive(chunk) {
            Ok(RxEvent::Complete(len)) => {
                assert!(len <= APDU_CAPACITY);
                assert_eq!(t.apdu().len(), len);
                assert!(t.session().is_idle());
            }
            Ok(RxEvent::Reply(reply)) => assert!(reply.len() <= 156),
            Ok(_) => {}
            Err(_) => assert!(t.session().is_idle()),
        }
    }
}

fuzz_target!(|data: &[u8]| {
    drive(LegacyBle::new(20), data);
    drive(NegotiatedBle::new(20, 156), data);
    drive(UsbHid::new(64), data);
});
