//! 读取操作：开启 `use_read_operation` 后，收到的消息同时可通过 `Session::read` 取得。

mod support;

use std::sync::Arc;

use bytes::Bytes;
use gateway_session::{BridgeError, ServiceConfig, SessionConfig};
use support::{Harness, WAIT};

fn read_enabled() -> ServiceConfig {
    ServiceConfig {
        session: SessionConfig {
            use_read_operation: true,
            ..SessionConfig::default()
        },
        ..ServiceConfig::default()
    }
}

#[test]
fn queued_messages_are_read_in_arrival_order() {
    let harness = Harness::new(read_enabled());
    let (peer, session) = harness.connect();
    peer.send(b"first");
    peer.send(b"second");

    let on_thread = Arc::clone(&session);
    let (a, b) = harness.on_loop(move || {
        (
            on_thread.read().expect("亲和线程读取"),
            on_thread.read().expect("亲和线程读取"),
        )
    });
    assert_eq!(a.result().expect("已有排队消息").expect("读取成功"), Bytes::from_static(b"first"));
    assert_eq!(b.result().expect("已有排队消息").expect("读取成功"), Bytes::from_static(b"second"));
}

#[test]
fn pending_read_resolves_when_data_arrives() {
    let harness = Harness::new(read_enabled());
    let (peer, session) = harness.connect();
    let on_thread = Arc::clone(&session);
    let pending = harness.on_loop(move || on_thread.read().expect("亲和线程读取"));
    assert!(!pending.is_done());

    peer.send(b"late");
    assert_eq!(
        pending.wait_timeout(WAIT).expect("读取完成").expect("读取成功"),
        Bytes::from_static(b"late")
    );
}

#[test]
fn close_fails_waiting_reads() {
    let harness = Harness::new(read_enabled());
    let (_peer, session) = harness.connect();
    let on_thread = Arc::clone(&session);
    let pending = harness.on_loop(move || on_thread.read().expect("亲和线程读取"));

    session.close().wait_timeout(WAIT).expect("关闭完成").expect("关闭成功");
    let err = pending.wait_timeout(WAIT).expect("读取已解决").expect_err("关闭后读取失败");
    assert!(matches!(err, BridgeError::SessionClosed { session_id } if session_id == session.id()));

    let on_thread = Arc::clone(&session);
    let after = harness.on_loop(move || on_thread.read().expect("亲和线程读取"));
    assert!(after.result().expect("立即失败").is_err());
}

#[test]
fn read_requires_the_option() {
    let harness = Harness::new(ServiceConfig::default());
    let (_peer, session) = harness.connect();
    let on_thread = Arc::clone(&session);
    let outcome = harness.on_loop(move || on_thread.read().map(|_| ()));
    assert!(matches!(outcome, Err(BridgeError::ReadOperationDisabled { .. })));
}

#[test]
fn received_bytes_update_statistics() {
    let harness = Harness::new(read_enabled());
    let (peer, session) = harness.connect();
    peer.send(&[0u8; 100]);
    peer.send(&[0u8; 28]);

    let statistics = session.statistics();
    assert_eq!(statistics.read_bytes, 128);
    assert_eq!(statistics.read_messages, 2);
}
