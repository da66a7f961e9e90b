//! Correlator against the mock controller.

use apdu_link::app::ports::{AsyncEventHandler, PlatformEvent};
use apdu_link::error::HciError;
use apdu_link::hci::{opcode, CommandRequest, Correlator, EventPacket, Expect, POOL_SIZE};
use embassy_time::Duration;

use crate::mock_link::{cc, connection_complete, disconnect, vendor, MockEvent, MockLink};

#[derive(Default)]
struct Recorder {
    events: Vec<u8>,
    ticks: usize,
    unrouted: usize,
}

impl AsyncEventHandler for Recorder {
    fn on_async_event(&mut self, pkt: &EventPacket) {
        self.events.push(pkt.code());
    }

    fn on_tick(&mut self) {
        self.ticks += 1;
    }

    fn on_unrouted(&mut self, _event: PlatformEvent<'_>) {
        self.unrouted += 1;
    }
}

fn correlator() -> Correlator {
    Correlator::new(Duration::from_millis(100))
}

const TIMEOUT: Duration = Duration::from_millis(300);

const LE_CREATE_CONNECTION: u16 = 0x200D;

/// Command status for `LE_CREATE_CONNECTION` with one free command slot.
fn create_connection_status() -> Vec<u8> {
    vec![0x04, 0x0F, 0x04, 0x00, 0x01, 0x0D, 0x20]
}

#[test]
fn reply_is_copied_and_pool_drained() {
    let mut port = MockLink::new();
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 8];

    let mut req = CommandRequest::complete(opcode::GATT_ADD_SERVICE, &[0x01], &mut reply, TIMEOUT);
    let n = corr.send_request(&mut port, &mut handler, &mut req).unwrap();

    assert_eq!(n, 3);
    assert_eq!(&reply[..3], &[0x00, 0x10, 0x00]);
    assert_eq!(port.sent, vec![vec![0x01, 0x02, 0xFD, 0x01, 0x01]]);
    assert!(!corr.is_busy());
    assert_eq!(corr.pool().free_count(), POOL_SIZE);
}

#[test]
fn events_during_wait_reach_the_handler_first() {
    let mut port = MockLink::new();
    port.before_reply(opcode::GATT_INIT, disconnect(0x0801, 0x13));
    port.before_reply(opcode::GATT_INIT, vendor(0x0C16, &[0x01, 0x08]));
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    corr.send_request(&mut port, &mut handler, &mut req).unwrap();

    // Only the first override applies to this command.
    assert_eq!(handler.events, vec![0x05]);
    assert_eq!(corr.pool().free_count(), POOL_SIZE);
}

#[test]
fn complete_for_another_opcode_is_async() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_hci(cc(opcode::RESET, &[0x00]));
    port.push_hci(cc(opcode::GATT_INIT, &[0x00]));
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    assert_eq!(corr.send_request(&mut port, &mut handler, &mut req), Ok(1));
    assert_eq!(handler.events, vec![0x0E]);
}

#[test]
fn status_byte_is_left_to_the_caller() {
    let mut port = MockLink::new();
    port.fail(opcode::GATT_INIT, 0x12, 1);
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    assert_eq!(corr.send_request(&mut port, &mut handler, &mut req), Ok(1));
    assert_eq!(reply[0], 0x12);
}

#[test]
fn ticks_expire_the_request() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_ticks(5);
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    assert_eq!(
        corr.send_request(&mut port, &mut handler, &mut req),
        Err(HciError::Timeout)
    );
    assert_eq!(handler.ticks, 3);
    assert_eq!(port.events.len(), 2);
    assert!(!corr.is_busy());
}

#[test]
fn drained_dispatcher_is_a_timeout() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    assert_eq!(
        corr.send_request(&mut port, &mut handler, &mut req),
        Err(HciError::Timeout)
    );
}

#[test]
fn hardware_error_fails_the_request() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_hci(vec![0x04, 0x10, 0x01, 0x03]);
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    assert_eq!(
        corr.send_request(&mut port, &mut handler, &mut req),
        Err(HciError::Hardware(0x03))
    );
    assert_eq!(corr.pool().free_count(), POOL_SIZE);
}

#[test]
fn le_meta_reply_skips_command_status() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_hci(create_connection_status());
    port.push_hci(connection_complete(0x0801, 24));
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(LE_CREATE_CONNECTION, &[], &mut reply, TIMEOUT);
    req.expect = Expect::LeMeta(0x01);
    assert_eq!(corr.send_request(&mut port, &mut handler, &mut req), Ok(4));
    // status, handle, role
    assert_eq!(reply, [0x00, 0x01, 0x08, 0x01]);
    assert!(handler.events.is_empty());
}

#[test]
fn le_meta_wait_survives_ticks_inside_deadline() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_hci(create_connection_status());
    port.push_ticks(2);
    port.push_hci(connection_complete(0x0801, 24));
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(LE_CREATE_CONNECTION, &[], &mut reply, TIMEOUT);
    req.expect = Expect::LeMeta(0x01);
    assert_eq!(corr.send_request(&mut port, &mut handler, &mut req), Ok(4));
    assert_eq!(handler.ticks, 2);
}

#[test]
fn free_slot_does_not_stop_the_le_meta_deadline() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_hci(create_connection_status());
    port.push_ticks(3);
    port.push_hci(connection_complete(0x0801, 24));
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(LE_CREATE_CONNECTION, &[], &mut reply, TIMEOUT);
    req.expect = Expect::LeMeta(0x01);
    assert_eq!(
        corr.send_request(&mut port, &mut handler, &mut req),
        Err(HciError::Timeout)
    );
    assert_eq!(handler.ticks, 3);
    // The connection-complete is still queued.
    assert_eq!(port.events.len(), 1);
    assert!(!corr.is_busy());
}

#[test]
fn accepted_status_finishes_a_complete_request() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.push_hci(create_connection_status());
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0xFFu8; 4];

    let mut req = CommandRequest::complete(LE_CREATE_CONNECTION, &[], &mut reply, TIMEOUT);
    assert_eq!(corr.send_request(&mut port, &mut handler, &mut req), Ok(1));
    assert_eq!(reply[0], 0x00);
}

#[test]
fn non_hci_events_are_unrouted() {
    let mut port = MockLink::new();
    port.auto_reply = false;
    port.events.push_back(MockEvent::Usb(vec![0x01, 0x01, 0x05]));
    port.push_hci(cc(opcode::GATT_INIT, &[0x00]));
    let mut corr = correlator();
    let mut handler = Recorder::default();
    let mut reply = [0u8; 4];

    let mut req = CommandRequest::complete(opcode::GATT_INIT, &[], &mut reply, TIMEOUT);
    corr.send_request(&mut port, &mut handler, &mut req).unwrap();
    assert_eq!(handler.unrouted, 1);
}

#[test]
fn packets_outside_a_request_go_async() {
    let mut corr = correlator();
    let mut handler = Recorder::default();
    corr.on_packet(&disconnect(0x0801, 0x13), &mut handler).unwrap();
    assert_eq!(handler.events, vec![0x05]);
    assert_eq!(corr.on_packet(&[0x04, 0x05], &mut handler), Err(HciError::Malformed));
    assert_eq!(corr.pool().free_count(), POOL_SIZE);
}
