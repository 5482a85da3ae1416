//! 集成测试共用的装配代码：内存传输 + 手动时钟 + 手动空闲驱动 + 记录型过滤器。

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use gateway_session::{
    Acceptor, Clock, FilterChain, FilterChainBuilder, IdleDriver, ManualClock, ServiceBuilder,
    ServiceConfig, Session,
    testing::{MockPeer, MockTransport, RecordingFilter},
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn listen_addr() -> SocketAddr {
    "127.0.0.1:7000".parse().expect("合法地址")
}

pub struct Harness {
    pub transport: MockTransport,
    pub clock: ManualClock,
    pub recorder: RecordingFilter,
    pub acceptor: Acceptor,
    pub listen: SocketAddr,
}

impl Harness {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_filters(config, |builder| builder)
    }

    /// `extra` 追加在记录型过滤器之后。
    pub fn with_filters(
        config: ServiceConfig,
        extra: impl FnOnce(FilterChainBuilder) -> FilterChainBuilder,
    ) -> Self {
        let transport = MockTransport::new();
        let clock = ManualClock::new();
        let recorder = RecordingFilter::new();
        let chain: FilterChain =
            extra(FilterChain::builder().add_last("recorder", recorder.clone())).build();
        let acceptor = ServiceBuilder::new(Arc::new(transport.clone()))
            .config(config)
            .filter_chain(chain)
            .clock(Arc::new(clock.clone()))
            .idle_driver(IdleDriver::Manual)
            .build_acceptor()
            .expect("构建接受端");
        let bound = acceptor.bind(&[listen_addr()]).expect("绑定监听地址");
        Self {
            transport,
            clock,
            recorder,
            acceptor,
            listen: bound[0],
        }
    }

    /// 建立一条入站连接，返回对端与对应的会话。
    pub fn connect(&self) -> (MockPeer, Arc<Session>) {
        let peer = self.transport.connect_peer(self.listen).expect("建立入站连接");
        let session = self
            .acceptor
            .managed_sessions()
            .into_iter()
            .find(|session| session.remote_addr() == peer.addr())
            .expect("接受端登记了新会话");
        (peer, session)
    }

    /// 在事件循环（会话亲和线程）上执行。
    pub fn on_loop<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.transport.event_loop().run_sync(f)
    }

    pub fn drain(&self) {
        self.transport.event_loop().drain();
    }

    /// 推进虚拟时间并驱动空闲监督器，返回触发的空闲事件数。
    pub fn advance(&self, delta: Duration) -> usize {
        self.clock.advance(delta);
        let raised = self
            .acceptor
            .idle_supervisors()
            .tick(self.clock.now());
        self.drain();
        raised
    }
}
