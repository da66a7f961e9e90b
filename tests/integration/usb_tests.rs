//! USB HID exchanges driven through the platform dispatcher.

use apdu_link::apdu::{ChunkedApduTransport, RxEvent, UsbHid};
use apdu_link::app::ports::{Dispatcher, PlatformEvent};
use apdu_link::config::LinkConfig;
use apdu_link::usb::{HidStatus, UsbHidTransport};

use crate::mock_link::{Counter, HostEndpoint, MockEvent, MockLink};

const CHANNEL: u16 = 0x0101;

fn device() -> UsbHidTransport<Counter> {
    UsbHidTransport::new(&LinkConfig::default(), Counter(7))
}

fn host() -> ChunkedApduTransport<UsbHid> {
    let mut h = ChunkedApduTransport::new(UsbHid::new(64));
    h.session_mut().channel = CHANNEL;
    h
}

/// Output reports the host stack produces for `apdu`.
fn host_reports(apdu: &[u8]) -> Vec<Vec<u8>> {
    let mut out = HostEndpoint::default();
    host().send_all(apdu, &mut out).unwrap();
    out.reports
}

/// Feed every queued report to the device; answer each APDU with
/// itself followed by 9000.
fn serve(port: &mut MockLink, dev: &mut UsbHidTransport<Counter>, to_host: &mut HostEndpoint) -> Vec<HidStatus> {
    let mut statuses = Vec::new();
    while let Some(event) = port.dispatch_one_event() {
        let PlatformEvent::UsbReport(report) = event else {
            continue;
        };
        let status = dev.receive(report, to_host);
        if let HidStatus::Received(_) = status {
            let mut resp = dev.apdu().to_vec();
            resp.extend_from_slice(&[0x90, 0x00]);
            dev.send(&resp, to_host).unwrap();
        }
        statuses.push(status);
    }
    statuses
}

#[test]
fn largest_apdu_round_trip() {
    let apdu: Vec<u8> = (0..255u16).map(|i| i as u8).collect();
    let reports = host_reports(&apdu);
    assert_eq!(reports.len(), 5);

    let mut port = MockLink::new();
    for r in reports {
        port.events.push_back(MockEvent::Usb(r));
    }
    let mut dev = device();
    let mut to_host = HostEndpoint::default();
    let statuses = serve(&mut port, &mut dev, &mut to_host);
    assert_eq!(statuses.last(), Some(&HidStatus::Received(255)));

    let mut h = host();
    let mut got = None;
    for r in &to_host.reports {
        assert_eq!(r.len(), 64);
        assert_eq!(&r[..2], &CHANNEL.to_be_bytes());
        if let RxEvent::Complete(n) = h.receive(r).unwrap() {
            got = Some(n);
        }
    }
    assert_eq!(got, Some(257));
    assert_eq!(&h.apdu()[..255], apdu.as_slice());
    assert_eq!(&h.apdu()[255..], &[0x90, 0x00]);
}

#[test]
fn sequence_gap_drops_exchange_and_host_restarts() {
    let apdu: Vec<u8> = (0..150u8).collect();
    let reports = host_reports(&apdu);
    assert_eq!(reports.len(), 3);

    let mut port = MockLink::new();
    // Second report lost.
    port.events.push_back(MockEvent::Usb(reports[0].clone()));
    port.events.push_back(MockEvent::Usb(reports[2].clone()));
    for r in &reports {
        port.events.push_back(MockEvent::Usb(r.clone()));
    }

    let mut dev = device();
    let mut to_host = HostEndpoint::default();
    let statuses = serve(&mut port, &mut dev, &mut to_host);
    assert_eq!(
        statuses,
        vec![
            HidStatus::MoreData,
            HidStatus::Reset,
            HidStatus::MoreData,
            HidStatus::MoreData,
            HidStatus::Received(150),
        ]
    );
    assert_eq!(dev.apdu(), apdu.as_slice());
}

#[test]
fn restart_mid_exchange_is_a_gap() {
    let reports = host_reports(&[0xAA; 100]);
    let mut dev = device();
    let mut sink = HostEndpoint::default();
    assert_eq!(dev.receive(&reports[0], &mut sink), HidStatus::MoreData);
    assert_eq!(dev.receive(&reports[0], &mut sink), HidStatus::Reset);
    assert!(dev.session().is_idle());
}

#[test]
fn continuation_on_other_channel_resets() {
    let mut reports = host_reports(&[0x55; 100]);
    reports[1][..2].copy_from_slice(&0x0202u16.to_be_bytes());
    let mut dev = device();
    let mut sink = HostEndpoint::default();
    assert_eq!(dev.receive(&reports[0], &mut sink), HidStatus::MoreData);
    assert_eq!(dev.receive(&reports[1], &mut sink), HidStatus::Reset);
}

#[test]
fn oversized_declaration_resets() {
    let mut report = vec![0u8; 64];
    report[..7].copy_from_slice(&[0x01, 0x01, 0x05, 0x00, 0x00, 0x01, 0x2C]);
    let mut dev = device();
    assert_eq!(dev.receive(&report, &mut HostEndpoint::default()), HidStatus::Reset);
    assert!(dev.session().is_idle());
}

#[test]
fn channel_allocation_uses_random_source() {
    let mut report = vec![0u8; 64];
    report[..3].copy_from_slice(&[0xFF, 0xFF, 0x01]);
    let mut dev = device();
    let mut sink = HostEndpoint::default();
    dev.receive(&report, &mut sink);
    dev.receive(&report, &mut sink);
    assert_eq!(&sink.reports[0][..7], &[0xFF, 0xFF, 0x01, 0, 0, 0, 7]);
    assert_eq!(&sink.reports[1][..7], &[0xFF, 0xFF, 0x01, 0, 0, 0, 8]);
}
