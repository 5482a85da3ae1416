//! 空闲监督：到期触发、I/O 之后的自我修正、关闭时撤销，以及基于空闲事件的写超时。
//!
//! 全部场景使用手动时钟与手动驱动的监督器，节拍为默认的 100ms。

mod support;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use gateway_session::{
    IdleClass, ServiceConfig, SessionConfig, WriteTimeoutFilter,
    testing::{FilterEvent, WriteMode},
};
use support::{Harness, WAIT};

fn reader_idle_config(interval: Duration) -> ServiceConfig {
    ServiceConfig {
        session: SessionConfig {
            reader_idle_time: interval,
            ..SessionConfig::default()
        },
        ..ServiceConfig::default()
    }
}

fn idle_events(harness: &Harness, class: IdleClass) -> usize {
    harness
        .recorder
        .count(|event| matches!(event, FilterEvent::Idle(_, fired) if *fired == class))
}

#[test]
fn reader_idle_fires_after_interval() {
    let harness = Harness::new(reader_idle_config(Duration::from_secs(1)));
    let (_peer, session) = harness.connect();

    assert_eq!(harness.advance(Duration::from_millis(900)), 0);
    assert_eq!(harness.advance(Duration::from_millis(100)), 1);
    assert_eq!(idle_events(&harness, IdleClass::Reader), 1);
    assert_eq!(idle_events(&harness, IdleClass::Writer), 0, "未配置的类别不调度");
    assert_eq!(session.idle_count(IdleClass::Reader), 1);

    assert_eq!(harness.advance(Duration::from_secs(1)), 1, "触发后按新基准重排");
    assert_eq!(idle_events(&harness, IdleClass::Reader), 2);
}

#[test]
fn io_before_deadline_defers_idle_without_firing() {
    let harness = Harness::new(reader_idle_config(Duration::from_secs(1)));
    let (peer, session) = harness.connect();
    let supervisor = harness.acceptor.idle_supervisors().supervisors()[0].clone();
    let key = session.id().get();

    harness.clock.advance(Duration::from_millis(600));
    peer.send(b"keepalive");

    assert_eq!(harness.advance(Duration::from_millis(400)), 0, "真实截止尚未到达");
    let corrected = supervisor
        .deadline(key, IdleClass::Reader)
        .expect("定时器已按修正后的截止重排");
    assert_eq!(corrected, session.last_read_time() + Duration::from_secs(1));

    assert_eq!(harness.advance(Duration::from_millis(600)), 1);
    assert_eq!(idle_events(&harness, IdleClass::Reader), 1);
}

#[test]
fn closing_deregisters_idle_timers() {
    let config = ServiceConfig {
        session: SessionConfig {
            reader_idle_time: Duration::from_secs(1),
            writer_idle_time: Duration::from_secs(2),
            both_idle_time: Duration::from_secs(3),
            ..SessionConfig::default()
        },
        ..ServiceConfig::default()
    };
    let harness = Harness::new(config);
    let (_peer, session) = harness.connect();
    let supervisor = harness.acceptor.idle_supervisors().supervisors()[0].clone();
    assert_eq!(supervisor.scheduled(), 3);

    session.close().wait_timeout(WAIT).expect("关闭完成").expect("关闭成功");
    assert_eq!(supervisor.scheduled(), 0);
    assert_eq!(harness.advance(Duration::from_secs(5)), 0);
}

#[test]
fn detached_session_keeps_timer_without_firing() {
    let harness = Harness::new(reader_idle_config(Duration::from_secs(1)));
    let (_peer, session) = harness.connect();
    let on_thread = Arc::clone(&session);
    harness.on_loop(move || on_thread.detach().expect("亲和线程解除接入"));

    assert_eq!(harness.advance(Duration::from_secs(2)), 0);
    let supervisor = harness.acceptor.idle_supervisors().supervisors()[0].clone();
    assert!(supervisor.deadline(session.id().get(), IdleClass::Reader).is_some());

    let on_thread = Arc::clone(&session);
    harness.on_loop(move || on_thread.attach().expect("亲和线程恢复接入"));
    assert_eq!(harness.advance(Duration::from_millis(100)), 1);
}

#[test]
fn close_while_detached_deregisters_timers_immediately() {
    let harness = Harness::new(reader_idle_config(Duration::from_secs(1)));
    let (peer, session) = harness.connect();
    let supervisor = harness.acceptor.idle_supervisors().supervisors()[0].clone();
    assert!(supervisor.deadline(session.id().get(), IdleClass::Reader).is_some());
    let on_thread = Arc::clone(&session);
    harness.on_loop(move || on_thread.detach().expect("亲和线程解除接入"));

    peer.close();
    harness.drain();
    assert!(!session.is_closed(), "未接入期间拆除被锁存");
    assert!(
        supervisor.deadline(session.id().get(), IdleClass::Reader).is_none(),
        "收到关闭即撤销空闲定时器"
    );

    let on_thread = Arc::clone(&session);
    harness.on_loop(move || on_thread.attach().expect("亲和线程恢复接入"));
    assert!(session.is_closed());
    assert_eq!(harness.advance(Duration::from_secs(2)), 0);
    assert_eq!(idle_events(&harness, IdleClass::Reader), 0);
}

#[test]
fn write_timeout_filter_closes_stalled_session() {
    let config = ServiceConfig {
        session: SessionConfig {
            writer_idle_time: Duration::from_secs(1),
            write_timeout: Duration::from_secs(3),
            ..SessionConfig::default()
        },
        ..ServiceConfig::default()
    };
    let harness =
        Harness::with_filters(config, |builder| builder.add_last("write-timeout", WriteTimeoutFilter));
    harness.transport.set_write_mode(WriteMode::Deferred);
    let (_peer, session) = harness.connect();
    let on_thread = Arc::clone(&session);
    let stalled = harness.on_loop(move || on_thread.write(Bytes::from_static(b"stuck")).expect("写入"));

    harness.advance(Duration::from_secs(2));
    assert!(session.is_open(), "尚未超过写超时");

    harness.advance(Duration::from_secs(1));
    session.close_future().wait_timeout(WAIT).expect("关闭完成").expect("关闭成功");
    harness.drain();

    assert!(stalled.result().expect("在途写已解决").is_err());
    assert!(harness.recorder.events().iter().any(|event| matches!(
        event,
        FilterEvent::Exception(_, "gateway.session.write_timeout")
    )));
    assert_eq!(
        harness
            .recorder
            .count(|event| matches!(event, FilterEvent::Closed(_))),
        1
    );
}
