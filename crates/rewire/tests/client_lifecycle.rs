//! Audio client lifecycle against the in-memory server
//!
//! Covers the realtime-to-control signaling paths: coalesced sample rate
//! changes, server shutdown and reconnection after a restart.

mod common;

use rewire::{ConnectionState, Message, MessageSource, RuntimeContext};
use rewireconf::DaemonConfig;

fn drain(client: &impl MessageSource) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Some(msg) = client.get_message() {
        client.confirm_message(msg);
        messages.push(msg);
    }
    messages
}

fn context() -> RuntimeContext {
    RuntimeContext::new(&DaemonConfig::default(), false)
}

#[test]
fn test_sample_rate_change_reported_once() {
    let server = common::server();
    let mut client = common::client("fx");
    client.connect(&server, &context()).unwrap();
    drain(&client);
    assert!(!client.needs_restart());

    server.set_sample_rate(96_000);
    server.set_sample_rate(44_100);
    assert_eq!(drain(&client), vec![Message::SampleRateChanged]);
    assert!(client.needs_restart());

    // Nothing left over for the next drain
    assert!(drain(&client).is_empty());
}

#[test]
fn test_server_shutdown_then_restart() {
    let server = common::server();
    let ctx = context();
    let mut client = common::client("fx");
    client.connect(&server, &ctx).unwrap();
    drain(&client);

    server.stop("jack went away");
    assert!(drain(&client).contains(&Message::Exited));
    let exit = client.exit().unwrap();
    assert_eq!(exit.status, rewire::server::memory::SHUTDOWN_STATUS);
    assert_eq!(exit.reason, "jack went away");

    client.disconnect(true);
    assert_eq!(server.dead_unregisters(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.exit().is_none());

    server.start();
    client.connect(&server, &ctx).unwrap();
    assert!(client.is_connected());
    assert!(server
        .port_names()
        .contains(&"rewire_fx:Input".to_string()));
}

#[test]
fn test_dropping_a_client_unregisters_its_ports() {
    let server = common::server();
    {
        let mut client = common::client("fx");
        client.connect(&server, &context()).unwrap();
        assert_eq!(server.port_names().len(), 6);
    }
    assert_eq!(server.port_names().len(), 4);
    assert!(server.open_sessions().is_empty());
}
