//! 接受端与连接端：部分绑定、同步解绑、释放顺序、建连成功/失败/超时与配置快照。

mod support;

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use gateway_session::{
    BridgeError, FilterChain, IdleDriver, ServiceBuilder, ServiceConfig, Session, SessionConfig,
    SessionState,
    testing::{FilterEvent, MockTransport, RecordingFilter},
};
use support::{Harness, WAIT};

fn addr(text: &str) -> SocketAddr {
    text.parse().expect("合法地址")
}

#[test]
fn partial_bind_keeps_successful_address() {
    let transport = MockTransport::new();
    let busy = addr("127.0.0.1:8081");
    transport.occupy(busy);
    let acceptor = ServiceBuilder::new(Arc::new(transport.clone()))
        .idle_driver(IdleDriver::Manual)
        .build_acceptor()
        .expect("构建接受端");

    let free = addr("127.0.0.1:8080");
    let err = acceptor.bind(&[free, busy]).expect_err("第二个地址被占用");

    assert_eq!(err.code(), "gateway.session.bind_failed");
    let failures = err.bind_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].address, busy);
    assert_eq!(failures[0].cause.kind(), io::ErrorKind::AddrInUse);
    assert!(err.to_string().contains("127.0.0.1:8081"));

    assert!(acceptor.is_bound(free));
    assert!(transport.is_listening(free));
    transport.connect_peer(free).expect("已绑定地址可接受连接");
    assert_eq!(acceptor.managed_sessions().len(), 1);
}

#[test]
fn unbind_closes_listener_synchronously() {
    let harness = Harness::new(ServiceConfig::default());
    harness.acceptor.unbind(&[harness.listen]).expect("解绑成功");

    assert!(!harness.acceptor.is_bound(harness.listen));
    assert!(!harness.transport.is_listening(harness.listen));
    let refused = harness.transport.connect_peer(harness.listen).expect_err("已解绑");
    assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);
}

#[test]
fn dispose_closes_sessions_then_releases_transport() {
    let harness = Harness::new(ServiceConfig::default());
    let (first, _) = harness.connect();
    let (second, _) = harness.connect();
    assert_eq!(harness.acceptor.statistics().managed_sessions, 2);

    harness.acceptor.dispose();

    assert!(first.is_closed() && second.is_closed());
    assert_eq!(
        harness
            .recorder
            .count(|event| matches!(event, FilterEvent::Closed(_))),
        2
    );
    assert!(!harness.transport.is_listening(harness.listen));
    assert_eq!(harness.transport.shutdown_count(), 1);
    assert!(harness.acceptor.is_disposed());
    assert!(matches!(
        harness.acceptor.bind(&[harness.listen]),
        Err(BridgeError::Disposed)
    ));

    harness.acceptor.dispose();
    assert_eq!(harness.transport.shutdown_count(), 1, "重复释放无副作用");
}

#[test]
fn service_statistics_track_peak_and_cumulative() {
    let harness = Harness::new(ServiceConfig::default());
    let (_a, first) = harness.connect();
    let (_b, _second) = harness.connect();
    first.close().wait_timeout(WAIT).expect("关闭完成").expect("关闭成功");
    let (_c, _third) = harness.connect();

    let statistics = harness.acceptor.statistics();
    assert_eq!(statistics.managed_sessions, 2);
    assert_eq!(statistics.largest_managed_sessions, 2);
    assert_eq!(statistics.cumulative_sessions, 3);
}

#[test]
fn config_changes_only_affect_new_sessions() {
    let harness = Harness::new(ServiceConfig::default());
    let (_old_peer, old) = harness.connect();

    let updated = ServiceConfig {
        session: SessionConfig {
            read_buffer_size: 4096,
            ..SessionConfig::default()
        },
        ..ServiceConfig::default()
    };
    harness.acceptor.set_config(updated).expect("合法配置");
    let (new_peer, new) = harness.connect();

    assert_eq!(old.config().read_buffer_size, 2048);
    assert_eq!(new.config().read_buffer_size, 4096);
    let sizing = new_peer.read_sizing().expect("会话配置了读缓冲");
    assert_eq!((sizing.min, sizing.initial, sizing.max), (64, 4096, 65536));

    let invalid = ServiceConfig {
        session: SessionConfig {
            min_read_buffer_size: 8192,
            ..SessionConfig::default()
        },
        ..ServiceConfig::default()
    };
    assert!(matches!(
        harness.acceptor.set_config(invalid),
        Err(BridgeError::Config(_))
    ));
}

#[test]
fn session_initializer_runs_before_open() {
    let transport = MockTransport::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&seen);
    let acceptor = ServiceBuilder::new(Arc::new(transport.clone()))
        .idle_driver(IdleDriver::Manual)
        .session_initializer(move |session: &Session| {
            assert_eq!(session.state(), SessionState::Created);
            session.set_attribute("tenant", String::from("blue"));
            observed.fetch_add(1, Ordering::AcqRel);
        })
        .build_acceptor()
        .expect("构建接受端");
    let listen = acceptor.bind(&[addr("127.0.0.1:0")]).expect("绑定")[0];
    assert_ne!(listen.port(), 0, "端口 0 由传输层分配");

    transport.connect_peer(listen).expect("建立连接");
    let session = acceptor.managed_sessions().pop().expect("存在会话");
    assert_eq!(seen.load(Ordering::Acquire), 1);
    assert_eq!(
        session.attribute::<String>("tenant").as_deref().map(String::as_str),
        Some("blue")
    );
    assert!(session.attribute::<u32>("tenant").is_none(), "类型不符时返回 None");
}

fn connector(transport: &MockTransport, recorder: &RecordingFilter) -> gateway_session::Connector {
    let config = ServiceConfig {
        connect_timeout: Duration::from_millis(250),
        ..ServiceConfig::default()
    };
    ServiceBuilder::new(Arc::new(transport.clone()))
        .config(config)
        .filter_chain(FilterChain::builder().add_last("recorder", recorder.clone()).build())
        .idle_driver(IdleDriver::Manual)
        .build_connector()
        .expect("构建连接端")
}

#[test]
fn connect_resolves_to_open_session() {
    let transport = MockTransport::new();
    let recorder = RecordingFilter::new();
    let connector = connector(&transport, &recorder);
    let remote = addr("192.0.2.10:5672");
    let local = addr("192.0.2.1:40001");

    let session = connector
        .connect_with(remote, Some(local), None)
        .wait_timeout(WAIT)
        .expect("建连完成")
        .expect("建连成功");

    assert!(session.is_open());
    assert_eq!(session.remote_addr(), remote);
    assert_eq!(session.local_addr(), local);
    let request = transport.connect_requests()[0];
    assert_eq!(request.timeout, Duration::from_millis(250));
    assert_eq!(connector.managed_sessions().len(), 1);
    assert_eq!(
        recorder.count(|event| matches!(event, FilterEvent::Opened(_))),
        1
    );
}

#[test]
fn connect_failure_and_timeout_resolve_once() {
    let transport = MockTransport::new();
    let recorder = RecordingFilter::new();
    let connector = connector(&transport, &recorder);
    let refused = addr("192.0.2.20:80");
    let silent = addr("192.0.2.30:80");
    transport.refuse(refused);
    transport.black_hole(silent);

    let err = connector.connect(refused).wait().expect_err("连接被拒绝");
    assert!(matches!(err, BridgeError::Connect { remote, .. } if remote == refused));
    assert_eq!(err.io_cause().map(io::Error::kind), Some(io::ErrorKind::ConnectionRefused));

    let err = connector.connect(silent).wait().expect_err("连接超时");
    assert!(matches!(
        err,
        BridgeError::ConnectTimeout { timeout, .. } if timeout == Duration::from_millis(250)
    ));
    assert!(connector.managed_sessions().is_empty());
    assert!(recorder.events().is_empty(), "失败的建连不产生会话事件");
}

#[test]
fn per_connect_initializer_overrides_service_hook() {
    let transport = MockTransport::new();
    let recorder = RecordingFilter::new();
    let connector = connector(&transport, &recorder);
    let hook: gateway_session::SessionInitializer = Arc::new(|session: &Session| {
        session.set_attribute("route", 7u32);
    });

    let session = connector
        .connect_with(addr("192.0.2.40:443"), None, Some(hook))
        .wait()
        .expect("建连成功");
    assert_eq!(session.attribute::<u32>("route").as_deref(), Some(&7));

    connector.dispose();
    assert!(session.is_closed());
    assert!(matches!(
        connector.connect(addr("192.0.2.41:443")).wait(),
        Err(BridgeError::Disposed)
    ));
}
