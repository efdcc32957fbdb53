//! Scheduler wait policy and reload

mod common;

use std::io::Write;
use std::time::Duration;

use rewire::ClientUpdate;

const CONFIG: &str = r#"
[daemon]
http_port = 0
retry_interval_ms = 10
reconnect_interval_ms = 80
"#;

fn ms(value: u64) -> Option<Duration> {
    Some(Duration::from_millis(value))
}

#[test]
fn test_backoff_grows_while_server_is_down() {
    let server = common::server();
    server.stop("not started");
    let config = common::config(CONFIG);
    let mut scheduler = common::scheduler(&server, &config);

    let waits: Vec<Option<Duration>> = (0..6)
        .map(|_| scheduler.iterate(Some(Duration::ZERO)))
        .collect();
    assert_eq!(waits, vec![ms(10), ms(20), ms(40), ms(80), ms(80), ms(80)]);
    assert!(scheduler.flags().pending());

    server.start();
    assert_eq!(scheduler.iterate(Some(Duration::ZERO)), None);
    assert!(!scheduler.flags().pending());
}

#[test]
fn test_disconnected_client_waits_reconnect_interval() {
    let server = common::server();
    let mut config = common::config(
        r#"
[daemon]
http_port = 0
retry_interval_ms = 10
reconnect_interval_ms = 5000
"#,
    );
    config.clients.push(common::amp("fx"));
    let mut scheduler = common::scheduler(&server, &config);

    // First attempt fails and starts the pacing interval
    server.stop("down");
    scheduler.iterate(Some(Duration::ZERO));
    server.start();

    let mut last = scheduler.iterate(Some(Duration::ZERO));
    for _ in 0..10 {
        if !scheduler.flags().pending() {
            break;
        }
        last = scheduler.iterate(Some(Duration::ZERO));
    }
    assert_eq!(last, ms(5000));
    assert!(!scheduler.manager().all_connected());
}

#[test]
fn test_reload_replaces_clients_and_rules() {
    let server = common::server();
    let config = common::config(CONFIG);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[[clients]]
name = "fx"
plugin = {{ label = "amp", unique_id = 1001 }}

[[connections]]
out = "system:capture_1"
in = "rewire_fx:Input"
"#
    )
    .unwrap();

    let mut scheduler =
        common::scheduler(&server, &config).with_config_path(Some(file.path().to_path_buf()));
    assert!(scheduler.manager().client("fx").is_none());

    scheduler.reload();
    assert!(scheduler.manager().client("fx").is_some());
    assert_eq!(scheduler.routing().connections().len(), 1);

    scheduler.iterate(Some(Duration::ZERO));
    scheduler.iterate(Some(Duration::ZERO));
    assert!(server.is_connected("system:capture_1", "rewire_fx:Input"));
}

#[test]
fn test_client_event_skips_reconnect_pacing() {
    let server = common::server();
    let mut config = common::config(
        r#"
[daemon]
http_port = 0
retry_interval_ms = 10
reconnect_interval_ms = 5000
"#,
    );
    config.clients.push(common::amp("fx"));
    let mut scheduler = common::scheduler(&server, &config);

    server.stop("down");
    scheduler.iterate(Some(Duration::ZERO));
    server.start();
    scheduler.iterate(Some(Duration::ZERO));
    assert!(!scheduler.manager().all_connected());

    // Any client update wakes the manager, which retries at once
    scheduler
        .registry()
        .push(vec![ClientUpdate::replace(common::amp("fx"))]);
    scheduler.iterate(Some(Duration::ZERO));
    assert!(scheduler.flags().clients);
    scheduler.iterate(Some(Duration::ZERO));
    assert!(scheduler.manager().all_connected());
}
