//! Fuzz target: HCI event intake
//!
//! Arbitrary bytes go through the packet pool and async routing. Nothing
//! may panic and every slot must be back on the free list afterwards.
//!
//! cargo fuzz run fuzz_hci_event

#![no_main]

use apdu_link::app::ports::AsyncEventHandler;
use apdu_link::hci::{Correlator, EventPacket, POOL_SIZE};
use embassy_time::Duration;
use libfuzzer_sys::fuzz_target;

struct Inspect;

impl AsyncEventHandler for Inspect {
    fn on_async_event(&mut self, pkt: &EventPacket) {
        let _ = (pkt.kind(), pkt.opcode(), pkt.status(), pkt.vendor_code());
        assert!(pkt.return_params().len() <= pkt.params().len());
        assert!(pkt.vendor_data().len() <= pkt.params().len());
    }
}

fuzz_target!(|data: &[u8]| {
    let mut corr: Correlator = Correlator::new(Duration::from_millis(100));
    let _ = corr.on_packet(data, &mut Inspect);
    assert_eq!(corr.pool().free_count(), POOL_SIZE);
});
