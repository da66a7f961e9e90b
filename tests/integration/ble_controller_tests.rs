//! Newer controller adapter against the mock controller.
//!
//! Handles after init: GAP service 0x10 (name 0x20), service 0x40,
//! notify 0x50 (CCCD 0x52), write 0x60 (value 0x61), write-cmd 0x70
//! (value 0x71).

use apdu_link::ble::gatt;
use apdu_link::ble::{BleController, ControllerState, PairingPrompt, PairingStatus, PairingUxEvent, UxResponse};
use apdu_link::config::LinkConfig;
use apdu_link::error::{SendError, TxError};
use apdu_link::hci::{opcode, vendor as vendor_code};

use crate::mock_link::{
    attribute_modified, connection_complete, disconnect, encryption_change, sample_apdu, vendor,
    write_permit, Counter, MockLink, MockSerial, RecordingDelay,
};

const CONN: u16 = 0x0801;
const NOTIFY_CCCD: u16 = 0x52;
const WRITE_VALUE: u16 = 0x61;
const WRITE_CMD_VALUE: u16 = 0x71;

type Ctrl = BleController<MockLink, Counter, RecordingDelay>;

fn pump(ctrl: &mut Ctrl) {
    while ctrl.process_event() {}
}

fn ready_with(serial: &MockSerial) -> Ctrl {
    let mut ctrl = BleController::new(MockLink::new(), Counter(123_456), RecordingDelay::default(), serial, "Nano X 1A2B", LinkConfig::default());
    ctrl.init();
    pump(&mut ctrl);
    assert_eq!(ctrl.state(), ControllerState::Ready);
    ctrl.port_mut().clear_sent();
    ctrl
}

fn ready() -> Ctrl {
    ready_with(&MockSerial::new())
}

/// Connected, encrypted and subscribed.
fn linked() -> Ctrl {
    let mut ctrl = ready();
    ctrl.port_mut().push_hci(connection_complete(CONN, 24));
    ctrl.port_mut().push_hci(encryption_change(CONN, true));
    ctrl.port_mut().push_hci(attribute_modified(CONN, NOTIFY_CCCD, &[0x01, 0x00]));
    pump(&mut ctrl);
    assert!(ctrl.core().notifications_enabled());
    ctrl.port_mut().clear_sent();
    ctrl
}

fn notified_chunks(ctrl: &Ctrl) -> Vec<Vec<u8>> {
    ctrl.port()
        .params_of(opcode::GATT_UPDATE_CHAR_VALUE)
        .into_iter()
        .map(|p| p[6..].to_vec())
        .collect()
}

// ── Init ──────────────────────────────────────────────────────

#[test]
fn init_reaches_ready_and_advertises() {
    let serial = MockSerial::new();
    let mut ctrl = BleController::new(MockLink::new(), Counter(0), RecordingDelay::default(), &serial, "Nano X 1A2B", LinkConfig::default());
    assert_eq!(ctrl.state(), ControllerState::Idle);
    ctrl.init();
    pump(&mut ctrl);

    assert!(ctrl.is_ready());
    assert!(ctrl.core().advertising_enabled());
    let ops = ctrl.port().opcodes();
    assert_eq!(ops.first(), Some(&opcode::RESET));
    assert_eq!(ops.last(), Some(&opcode::GAP_SET_DISCOVERABLE));
    assert_eq!(ops.iter().filter(|&&o| o == opcode::GATT_ADD_CHAR).count(), 3);

    let h = ctrl.core().handles();
    assert_eq!((h.service, h.notify, h.write, h.write_cmd), (0x40, 0x50, 0x60, 0x70));

    let addr = &ctrl.port().params_of(opcode::HAL_WRITE_CONFIG_DATA)[0];
    assert_eq!(&addr[..2], &[0x2E, 6]);
    assert_eq!(&addr[2..], &gatt::random_static_address(&serial.serial));

    // Advertising data carries the device name.
    let adv = &ctrl.port().params_of(opcode::GAP_UPDATE_ADV_DATA)[0];
    assert_eq!(&adv[4..6], &[12, 0x09]);
    assert_eq!(&adv[6..], b"Nano X 1A2B");
}

fn busy_controller(refuse: usize) -> Ctrl {
    let mut port = MockLink::new();
    port.refuse = refuse;
    BleController::new(port, Counter(0), RecordingDelay::default(), &MockSerial::new(), "Nano X 1A2B", LinkConfig::default())
}

#[test]
fn busy_controller_is_retried_with_backoff() {
    let mut ctrl = busy_controller(3);
    ctrl.init();
    pump(&mut ctrl);

    assert_eq!(ctrl.port().refused, 3);
    // Default policy waits 1000 us before each retry.
    assert_eq!(ctrl.delay().total_ns, 3_000_000);
    assert_eq!(ctrl.state(), ControllerState::Ready);
}

#[test]
fn exhausted_retries_fail_bring_up_until_next_init() {
    let mut ctrl = busy_controller(usize::MAX);
    ctrl.init();
    pump(&mut ctrl);

    // First attempt plus 10 retries, 10 ms of backoff in total.
    assert_eq!(ctrl.port().refused, 11);
    assert_eq!(ctrl.delay().total_ns, 10_000_000);
    assert_eq!(ctrl.state(), ControllerState::Failed);
    assert!(!ctrl.is_ready());
    assert!(ctrl.port().sent.is_empty());

    ctrl.port_mut().refuse = 0;
    ctrl.init();
    pump(&mut ctrl);
    assert_eq!(ctrl.state(), ControllerState::Ready);
}

#[test]
fn plane_mode_initialises_without_advertising() {
    let serial = MockSerial {
        plane_mode: true,
        ..MockSerial::new()
    };
    let ctrl = ready_with(&serial);
    assert!(ctrl.is_ready());
    assert!(!ctrl.core().advertising_enabled());
}

#[test]
fn advertising_can_be_toggled() {
    let mut ctrl = ready();
    ctrl.enable_advertising(false);
    pump(&mut ctrl);
    assert_eq!(ctrl.port().opcodes(), vec![opcode::GAP_SET_NON_DISCOVERABLE]);
    assert!(!ctrl.core().advertising_enabled());

    ctrl.enable_advertising(true);
    pump(&mut ctrl);
    assert!(ctrl.core().advertising_enabled());
}

// ── Link events ───────────────────────────────────────────────

#[test]
fn subscription_requests_mtu_exchange() {
    let mut ctrl = ready();
    ctrl.port_mut().push_hci(connection_complete(CONN, 24));
    ctrl.port_mut().push_hci(attribute_modified(CONN, NOTIFY_CCCD, &[0x01, 0x00]));
    pump(&mut ctrl);

    assert_eq!(ctrl.core().connection().handle, CONN);
    assert_eq!(ctrl.core().connection().interval, 24);
    assert_eq!(ctrl.port().params_of(opcode::GATT_EXCHANGE_CONFIG), vec![vec![0x01, 0x08]]);
}

#[test]
fn mtu_exchange_widens_chunks() {
    let mut ctrl = linked();
    ctrl.port_mut()
        .push_hci(vendor(vendor_code::EXCHANGE_MTU_RESP, &[0x01, 0x08, 0xF7, 0x00]));
    pump(&mut ctrl);
    assert_eq!(ctrl.core().transport().chunk_len(), 156);

    let resp: Vec<u8> = (0..100).collect();
    ctrl.apdu_send(&resp).unwrap();
    pump(&mut ctrl);
    let chunks = notified_chunks(&ctrl);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].len(), 105);
}

#[test]
fn events_for_other_connections_are_ignored() {
    let mut ctrl = linked();
    ctrl.port_mut()
        .push_hci(attribute_modified(0x0999, WRITE_CMD_VALUE, &[0x00, 0x00, 0x00]));
    pump(&mut ctrl);
    assert!(ctrl.port().sent.is_empty());
}

// ── APDU exchange ─────────────────────────────────────────────

#[test]
fn apdu_round_trip_with_acknowledged_chunks() {
    let mut ctrl = linked();
    ctrl.port_mut().push_hci(write_permit(
        CONN,
        WRITE_VALUE,
        &[0x05, 0x00, 0x00, 0x00, 0x05, 0xE0, 0x01, 0x00, 0x00, 0x00],
    ));
    pump(&mut ctrl);

    assert_eq!(ctrl.apdu_poll(), Some(5));
    assert_eq!(ctrl.apdu(), &[0xE0, 0x01, 0x00, 0x00, 0x00]);
    assert_eq!(ctrl.port().opcodes(), vec![opcode::GATT_WRITE_RESP]);

    ctrl.port_mut().clear_sent();
    ctrl.apdu_send(&sample_apdu()).unwrap();
    pump(&mut ctrl);

    let chunks = notified_chunks(&ctrl);
    assert_eq!(chunks.len(), 3);
    assert_eq!(&chunks[0][..5], &[0x05, 0x00, 0x00, 0x00, 0x26]);
    assert_eq!(&chunks[1][..3], &[0x05, 0x00, 0x01]);
    assert_eq!(chunks[2], vec![0x05, 0x00, 0x02, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35]);
    assert!(!ctrl.core().transport().is_sending());

    // The slow connection is tightened once the first response is out.
    let update = ctrl.port().params_of(opcode::L2CAP_CONNECTION_PARAMETER_UPDATE_REQ);
    assert_eq!(update, vec![vec![0x01, 0x08, 12, 0, 12, 0, 0, 0, 0xF4, 0x01]]);
}

#[test]
fn write_command_characteristic_answers_version() {
    let mut ctrl = linked();
    ctrl.port_mut()
        .push_hci(attribute_modified(CONN, WRITE_CMD_VALUE, &[0x00, 0x00, 0x00]));
    pump(&mut ctrl);
    assert_eq!(notified_chunks(&ctrl), vec![vec![0x00, 0x00, 0x00, 0x00, 0x00]]);
}

#[test]
fn allocate_channel_is_answered() {
    let mut ctrl = linked();
    ctrl.port_mut().push_hci(write_permit(CONN, WRITE_VALUE, &[0x01]));
    pump(&mut ctrl);
    // Write response first, then the reply held behind it.
    assert_eq!(
        ctrl.port().opcodes(),
        vec![opcode::GATT_WRITE_RESP, opcode::GATT_UPDATE_CHAR_VALUE]
    );
    assert_eq!(notified_chunks(&ctrl), vec![vec![0x01]]);
}

#[test]
fn unencrypted_writes_are_acknowledged_only() {
    let mut ctrl = ready();
    ctrl.port_mut().push_hci(connection_complete(CONN, 24));
    ctrl.port_mut().push_hci(attribute_modified(CONN, NOTIFY_CCCD, &[0x01, 0x00]));
    ctrl.port_mut()
        .push_hci(write_permit(CONN, WRITE_VALUE, &[0x05, 0x00, 0x00, 0x00, 0x01, 0xAA]));
    pump(&mut ctrl);
    assert_eq!(ctrl.apdu_poll(), None);
    assert!(ctrl.port().opcodes().contains(&opcode::GATT_WRITE_RESP));
}

#[test]
fn send_requires_connection() {
    let mut ctrl = ready();
    assert_eq!(ctrl.apdu_send(&[0x90, 0x00]), Err(SendError::Link(TxError::NotConnected)));
}

#[test]
fn unacknowledged_chunk_times_out() {
    let mut ctrl = linked();
    ctrl.port_mut().silent.push(opcode::GATT_UPDATE_CHAR_VALUE);
    ctrl.apdu_send(&sample_apdu()).unwrap();
    assert_eq!(ctrl.apdu_send(&[0x90, 0x00]), Err(SendError::Busy));

    ctrl.port_mut().push_ticks(20);
    pump(&mut ctrl);
    assert!(!ctrl.core().transport().is_sending());

    ctrl.port_mut().silent.clear();
    ctrl.apdu_send(&[0x90, 0x00]).unwrap();
}

#[test]
fn host_abort_stops_send_after_in_flight_chunk() {
    let mut ctrl = linked();
    ctrl.apdu_send(&sample_apdu()).unwrap();
    ctrl.port_mut()
        .push_hci(attribute_modified(CONN, WRITE_CMD_VALUE, &[0x03, 0x00, 0x00]));
    pump(&mut ctrl);

    assert_eq!(notified_chunks(&ctrl).len(), 2);
    assert!(!ctrl.core().transport().is_sending());
}

// ── Disconnect ────────────────────────────────────────────────

#[test]
fn disconnect_restarts_advertising() {
    let mut ctrl = linked();
    ctrl.port_mut().push_hci(disconnect(CONN, 0x13));
    pump(&mut ctrl);

    assert!(!ctrl.core().connection().is_connected());
    assert_eq!(ctrl.port().opcodes(), vec![opcode::GAP_SET_DISCOVERABLE]);
    assert_eq!(ctrl.state(), ControllerState::Ready);
    assert!(ctrl.core().advertising_enabled());
}

#[test]
fn renamed_device_rebuilds_advertising_after_disconnect() {
    let mut ctrl = linked();
    ctrl.set_device_name("Nano X 9F00");
    ctrl.port_mut().push_hci(disconnect(CONN, 0x13));
    pump(&mut ctrl);

    assert_eq!(
        ctrl.port().opcodes(),
        vec![
            opcode::GAP_UPDATE_ADV_DATA,
            opcode::LE_SET_SCAN_RESPONSE_DATA,
            opcode::GATT_UPDATE_CHAR_VALUE,
            opcode::GAP_SET_DISCOVERABLE,
        ]
    );
    let name = &ctrl.port().params_of(opcode::GATT_UPDATE_CHAR_VALUE)[0];
    assert_eq!(&name[6..], b"Nano X 9F00");
}

#[test]
fn instant_passed_disconnect_reinitialises() {
    let mut ctrl = linked();
    ctrl.port_mut().push_hci(disconnect(CONN, 0x28));
    pump(&mut ctrl);
    assert_eq!(ctrl.port().opcodes().first(), Some(&opcode::RESET));
    assert!(ctrl.is_ready());
}

// ── Pairing ───────────────────────────────────────────────────

#[test]
fn passkey_pairing_flow() {
    let mut ctrl = linked();
    ctrl.port_mut().push_hci(vendor(vendor_code::PASS_KEY_REQUEST, &[0x01, 0x08]));
    pump(&mut ctrl);

    assert_eq!(
        ctrl.next_pairing_event(),
        Some(PairingUxEvent::Request(PairingPrompt::Passkey(123_456)))
    );
    ctrl.pairing_response(UxResponse::Ok);
    let mut expected = vec![0x01, 0x08];
    expected.extend_from_slice(&123_456u32.to_le_bytes());
    assert_eq!(ctrl.port().params_of(opcode::GAP_PASS_KEY_RESP), vec![expected]);
    assert_eq!(
        ctrl.next_pairing_event(),
        Some(PairingUxEvent::End(PairingStatus::AcceptPasskey))
    );

    ctrl.port_mut()
        .push_hci(vendor(vendor_code::PAIRING_COMPLETE, &[0x01, 0x08, 0x00, 0x00]));
    pump(&mut ctrl);
    assert_eq!(ctrl.next_pairing_event(), Some(PairingUxEvent::End(PairingStatus::Success)));
}

#[test]
fn numeric_comparison_rejected() {
    let mut ctrl = linked();
    let mut data = vec![0x01, 0x08];
    data.extend_from_slice(&1_234_567u32.to_le_bytes());
    ctrl.port_mut().push_hci(vendor(vendor_code::NUMERIC_COMPARISON, &data));
    pump(&mut ctrl);

    assert_eq!(
        ctrl.next_pairing_event(),
        Some(PairingUxEvent::Request(PairingPrompt::NumericComparison(234_567)))
    );
    ctrl.pairing_response(UxResponse::Reject);
    assert_eq!(
        ctrl.port().params_of(opcode::GAP_NUMERIC_COMPARISON_VALUE_CONFIRM),
        vec![vec![0x01, 0x08, 0x00]]
    );
}

#[test]
fn disconnect_closes_open_pairing_prompt() {
    let mut ctrl = linked();
    ctrl.port_mut().push_hci(vendor(vendor_code::PASS_KEY_REQUEST, &[0x01, 0x08]));
    ctrl.port_mut().push_hci(disconnect(CONN, 0x13));
    pump(&mut ctrl);
    let _request = ctrl.next_pairing_event();
    assert_eq!(ctrl.next_pairing_event(), Some(PairingUxEvent::End(PairingStatus::Failed)));
}

#[test]
fn reset_pairings_clears_bonds() {
    let mut ctrl = ready();
    ctrl.reset_pairings();
    pump(&mut ctrl);
    assert_eq!(ctrl.port().opcodes(), vec![opcode::GAP_CLEAR_SECURITY_DB]);

    let mut ctrl = linked();
    ctrl.reset_pairings();
    pump(&mut ctrl);
    let ops = ctrl.port().opcodes();
    assert_eq!(ops.first(), Some(&opcode::RESET));
    assert_eq!(ops.last(), Some(&opcode::GAP_CLEAR_SECURITY_DB));
    assert!(ctrl.is_ready());
}
