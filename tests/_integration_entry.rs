// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Integration coverage for the scenarios this transport is expected to
//! handle end to end: loopback publish/subscribe, an anonymous listener,
//! multi-frame reassembly with a dropped frame, service request/response,
//! TX priority ordering, and bind failure surfacing.

use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use cyphal_udp_transport::{
    Transport, TransportConfig, TransportError,
    address::{Priority, multicast_group_for_message},
    frame::{ParsedHeader, encode_header, fragment_payload},
    session::specifier::DataSpecifier,
    socket::CyphalSocket,
};
use serial_test::serial;

fn transport_on(node_id: Option<u16>) -> Transport {
    let config = TransportConfig {
        local_node_id: node_id.map_or(cyphal_udp_transport::address::NodeId::ANONYMOUS, |id| {
            cyphal_udp_transport::address::NodeId::new(id).expect("valid node id")
        }),
        interface_addresses: vec![Ipv4Addr::new(127, 0, 0, 1)],
        mtu_payload_capacity: 256,
        tx_queue_capacity_per_interface: 128,
        transfer_id_timeout: Duration::from_secs(2),
        rx_payload_extent_bytes: 8192,
        session_arena_capacity: 16,
    };
    let transport = Transport::new(config).expect("construct");
    transport.initialize().expect("initialize");
    transport
}

#[tokio::test]
#[serial]
async fn loopback_heartbeat_delivers_five_ordered_transfers() {
    let transport = transport_on(Some(42));
    let heartbeat = DataSpecifier::message(7509).expect("valid subject id");
    let output = transport
        .get_output_session(heartbeat, None)
        .expect("output session");
    let input = transport
        .get_input_session(heartbeat, None)
        .expect("input session");

    for _ in 0..5 {
        output
            .send(
                b"heartbeat",
                Priority::Nominal,
                Instant::now() + Duration::from_secs(1),
                256,
            )
            .expect("send");
        transport
            .run_for(Duration::from_millis(100))
            .await
            .expect("run_for");
    }

    let mut transfers = Vec::new();
    while let Some(t) = input.receive() {
        transfers.push(t);
    }
    assert_eq!(transfers.len(), 5);
    for (i, t) in transfers.iter().enumerate() {
        assert_eq!(t.source_node_id, Some(42));
        assert_eq!(t.transfer_id, i as u64);
    }
}

#[tokio::test]
#[serial]
async fn anonymous_listener_receives_one_transfer_and_rejects_service_output() {
    let publisher = transport_on(Some(1));
    let listener = transport_on(None);
    let heartbeat = DataSpecifier::message(7510).expect("valid subject id");

    let output = publisher
        .get_output_session(heartbeat, None)
        .expect("output session");
    let input = listener
        .get_input_session(heartbeat, None)
        .expect("input session");

    output
        .send(
            b"hi",
            Priority::Nominal,
            Instant::now() + Duration::from_secs(1),
            256,
        )
        .expect("send");
    publisher
        .run_for(Duration::from_millis(100))
        .await
        .expect("run_for");
    listener
        .run_for(Duration::from_millis(100))
        .await
        .expect("run_for");

    assert!(input.receive().is_some());
    assert!(input.receive().is_none());

    let service = DataSpecifier::service_consumer(430).expect("valid service id");
    assert!(matches!(
        listener.get_output_session(service, Some(1)),
        Err(TransportError::InvalidArgumentError(_))
    ));
}

#[tokio::test]
#[serial]
async fn multi_frame_transfer_with_a_dropped_frame_is_never_delivered() {
    let group = multicast_group_for_message(7511);

    // Join the multicast group before anything is sent — a socket that
    // joins after the datagrams are on the wire never sees them.
    let listener = transport_on(None);
    let heartbeat = DataSpecifier::message(7511).expect("valid subject id");
    let input = listener
        .get_input_session(heartbeat, None)
        .expect("input session");

    let output_socket =
        CyphalSocket::bind_output(Ipv4Addr::new(127, 0, 0, 1), group).expect("bind output");

    let payload = vec![0xAAu8; 4096];
    let fragments = fragment_payload(&payload, 1024);
    assert!(fragments.len() >= 4);
    let last = fragments.len() - 1;

    for (index, fragment) in fragments.iter().enumerate() {
        if index == 2 {
            continue; // simulate a dropped frame
        }
        let header = ParsedHeader {
            priority: Priority::Nominal,
            source_node_id: 7,
            destination_node_id: cyphal_udp_transport::address::ANONYMOUS_NODE_ID,
            kind: cyphal_udp_transport::address::TransferKind::Message,
            port_id: 7511,
            transfer_id: 0,
            frame_index: index as u32,
            end_of_transfer: index == last,
        };
        let mut datagram = encode_header(&header).to_vec();
        datagram.extend_from_slice(fragment);
        output_socket.try_send(&datagram).expect("send");
    }

    listener
        .run_for(Duration::from_millis(100))
        .await
        .expect("run_for");
    assert!(input.receive().is_none());

    // Every frame after the gap arrives out of order relative to the
    // stalled partial and is counted, never delivered: frame 3 (expected
    // index 2) and frame 4, the end-of-transfer frame (still expected
    // index 2, since frame 3 was rejected rather than consumed).
    assert_eq!(input.stats().out_of_order_frames, 2);

    input.set_transfer_id_timeout(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(80)).await;
    listener
        .run_for(Duration::from_millis(100))
        .await
        .expect("run_for");
    assert!(input.receive().is_none());
    assert_eq!(input.stats().reassembly_timeouts, 1);
}

#[tokio::test]
#[serial]
async fn service_request_response_round_trip() {
    let client = transport_on(Some(10));
    let server = transport_on(Some(11));

    let request_ds = DataSpecifier::service_consumer(430).expect("valid service id");
    let provider_ds = DataSpecifier::service_provider(430).expect("valid service id");

    let client_request_output = client
        .get_output_session(request_ds, Some(11))
        .expect("request output session");
    let server_request_input = server
        .get_input_session(provider_ds, None)
        .expect("request input session");
    let server_response_output = server
        .get_output_session(provider_ds, Some(10))
        .expect("response output session");
    let client_response_input = client
        .get_input_session(request_ds, Some(11))
        .expect("response input session");

    client_request_output
        .send(
            b"ping",
            Priority::Nominal,
            Instant::now() + Duration::from_secs(1),
            256,
        )
        .expect("send request");
    client.run_for(Duration::from_millis(100)).await.expect("run_for");
    server.run_for(Duration::from_millis(100)).await.expect("run_for");

    let request = server_request_input.receive().expect("request delivered");
    assert_eq!(request.payload, b"ping");
    assert_eq!(request.transfer_id, 0);

    server_response_output
        .send(
            b"pong",
            Priority::Nominal,
            Instant::now() + Duration::from_secs(1),
            256,
        )
        .expect("send response");
    server.run_for(Duration::from_millis(100)).await.expect("run_for");
    client.run_for(Duration::from_millis(100)).await.expect("run_for");

    let response = client_response_input.receive().expect("response delivered");
    assert_eq!(response.payload, b"pong");
    assert_eq!(response.transfer_id, 0);
}

#[tokio::test]
#[serial]
async fn tx_priority_ordering_sends_immediate_before_queued_nominal() {
    let group = Ipv4Addr::new(239, 3, 0, 1);
    let output_socket =
        CyphalSocket::bind_output(Ipv4Addr::new(127, 0, 0, 1), group).expect("bind output");
    let input_socket =
        CyphalSocket::bind_input(Ipv4Addr::new(127, 0, 0, 1), group).expect("bind input");

    let mut queue = cyphal_udp_transport::queue::TxQueue::new(64);
    let deadline = Instant::now() + Duration::from_secs(5);
    for i in 0..50u8 {
        queue
            .push(Priority::Nominal, deadline, vec![i])
            .expect("push nominal");
    }
    queue
        .push(Priority::Immediate, deadline, vec![255])
        .expect("push immediate");

    while let Some(item) = queue.peek() {
        output_socket.writable().await.expect("writable");
        output_socket.try_send(&item.payload).expect("send");
        queue.pop();
    }

    input_socket.readable().await.expect("readable");
    let mut buf = [0u8; 8];
    let (n, _) = input_socket
        .try_receive_from(&mut buf)
        .expect("recv")
        .expect("first datagram present");
    assert_eq!(&buf[..n], &[255]);
}

#[tokio::test]
#[serial]
async fn bind_failure_on_a_nonexistent_interface_surfaces_address_error() {
    let config = TransportConfig {
        local_node_id: cyphal_udp_transport::address::NodeId::new(5).expect("valid"),
        interface_addresses: vec![Ipv4Addr::new(203, 0, 113, 77)],
        mtu_payload_capacity: 256,
        tx_queue_capacity_per_interface: 16,
        transfer_id_timeout: Duration::from_secs(2),
        rx_payload_extent_bytes: 4096,
        session_arena_capacity: 8,
    };
    let transport = Transport::new(config).expect("construct");
    transport.initialize().expect("initialize");

    let heartbeat = DataSpecifier::message(1).expect("valid subject id");
    assert!(matches!(
        transport.get_input_session(heartbeat, None),
        Err(TransportError::AddressError { .. })
    ));
}
