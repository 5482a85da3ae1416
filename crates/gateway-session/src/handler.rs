//! 传输事件处理器：把回调式通道事件转交给会话。
//!
//! 每个连接拥有一个 [`BridgeHandler`]。处理器先处于“工厂”阶段，`on_connected` 时在当前
//! （亲和）线程上构造会话并切换到“已安装”阶段，此后的事件全部转交给该会话。

use std::{fmt, sync::Arc};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::{
    error::BridgeError,
    future::CompletionFuture,
    service::{ServiceCore, SessionInitializer},
    session::Session,
    transport::{ChannelEvents, TransportChannel},
};

enum Stage {
    Factory,
    Installed(Arc<Session>),
    Released,
}

pub(crate) struct BridgeHandler {
    core: Arc<ServiceCore>,
    stage: Stage,
    initializer: Option<SessionInitializer>,
    established: Option<CompletionFuture<Arc<Session>>>,
}

impl BridgeHandler {
    /// 入站连接的处理器。
    pub(crate) fn inbound(core: Arc<ServiceCore>) -> Self {
        let initializer = core.initializer.clone();
        Self {
            core,
            stage: Stage::Factory,
            initializer,
            established: None,
        }
    }

    /// 出站连接的处理器；会话建立后解决 `established`。
    pub(crate) fn outbound(
        core: Arc<ServiceCore>,
        initializer: Option<SessionInitializer>,
        established: CompletionFuture<Arc<Session>>,
    ) -> Self {
        let initializer = initializer.or_else(|| core.initializer.clone());
        Self {
            core,
            stage: Stage::Factory,
            initializer,
            established: Some(established),
        }
    }

    fn session(&self) -> Option<&Arc<Session>> {
        match &self.stage {
            Stage::Installed(session) => Some(session),
            Stage::Factory | Stage::Released => None,
        }
    }

    fn install(&mut self, channel: Arc<dyn TransportChannel>) -> Result<Arc<Session>, BridgeError> {
        self.core.ensure_active()?;
        let session = Session::new(&self.core, channel);
        self.stage = Stage::Installed(Arc::clone(&session));
        session.fire_created();
        if let Some(initializer) = &self.initializer {
            initializer(&session);
        }
        session.open()?;
        Ok(session)
    }
}

impl ChannelEvents for BridgeHandler {
    fn on_connected(&mut self, channel: Arc<dyn TransportChannel>) {
        let remote = channel.remote_addr();
        match self.install(Arc::clone(&channel)) {
            Ok(session) => {
                debug!(session = %session.id(), %remote, "session established");
                if let Some(established) = self.established.take() {
                    established.succeed(session);
                }
            }
            Err(err) => {
                warn!(%remote, code = err.code(), "session setup failed: {err}");
                match &self.stage {
                    Stage::Installed(session) => {
                        let _ = session.close();
                    }
                    Stage::Factory | Stage::Released => channel.close(),
                }
                if let Some(established) = self.established.take() {
                    established.fail(err);
                }
            }
        }
    }

    fn on_message(&mut self, payload: BytesMut) {
        match self.session() {
            Some(session) => session.receive(payload),
            None => trace!(bytes = payload.len(), "message without session dropped"),
        }
    }

    fn on_write_complete(&mut self, written: usize) {
        if let Some(session) = self.session() {
            session.write_completed(written);
        }
    }

    fn on_closed(&mut self) {
        if let Stage::Installed(session) = std::mem::replace(&mut self.stage, Stage::Released) {
            session.transport_closed();
        }
        if let Some(established) = self.established.take() {
            established.fail(BridgeError::Disposed);
        }
    }

    fn on_exception(&mut self, cause: BridgeError) {
        match self.session() {
            Some(session) => session.raise_exception(cause),
            None => {
                debug!(code = cause.code(), "exception before session: {cause}");
                if let Some(established) = self.established.take() {
                    established.fail(cause);
                }
            }
        }
    }
}

impl fmt::Debug for BridgeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match &self.stage {
            Stage::Factory => "factory",
            Stage::Installed(_) => "installed",
            Stage::Released => "released",
        };
        f.debug_struct("BridgeHandler").field("stage", &stage).finish()
    }
}
