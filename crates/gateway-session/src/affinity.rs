use std::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
    thread::{self, ThreadId},
};

use crate::{error::BridgeError, session::SessionId};

/// 会话的亲和线程记录。
///
/// - `owner` 是创建会话的线程，在会话生命周期内不变；
/// - `attached` 表示会话当前是否已接入该线程的执行器；未接入期间空闲事件被抑制，
///   收到的关闭事件被锁存，待重新接入后重放。
#[derive(Debug)]
pub(crate) struct Affinity {
    owner: ThreadId,
    attached: AtomicBool,
}

impl Affinity {
    pub(crate) fn current() -> Self {
        Self {
            owner: thread::current().id(),
            attached: AtomicBool::new(false),
        }
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// 调用线程不是亲和线程时返回 [`BridgeError::ConfinementViolation`]。
    pub(crate) fn check(&self, session_id: SessionId) -> Result<(), BridgeError> {
        let caller = thread::current().id();
        if caller == self.owner {
            Ok(())
        } else {
            Err(BridgeError::ConfinementViolation {
                session_id,
                owner: self.owner,
                caller,
            })
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// 返回此前是否处于接入状态。
    pub(crate) fn set_attached(&self, attached: bool) -> bool {
        self.attached.swap(attached, Ordering::AcqRel)
    }
}

/// 仅允许亲和线程访问的可变单元。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 写队列与读取队列只由亲和线程读写，无需加锁；但会话本身要被空闲监督线程、
///   服务层的会话组等跨线程持有，因此整个会话必须是 `Sync`；
/// - 本类型把“只有亲和线程能碰”的约束落在每一次访问上，而不是寄希望于调用方自律。
///
/// ## 逻辑 (How)
/// - 每次访问先比对线程标识，失败返回 [`BridgeError::ConfinementViolation`]；
/// - 通过后使用 `RefCell::try_borrow_mut`，同线程的重入访问返回
///   [`BridgeError::ReentrantAccess`]，调用方在借用期间不得回调过滤器链。
///
/// ## 契约 (What)
/// - `Sync` 的依据：内部 `RefCell` 只会在 `owner` 线程上被借用；
/// - `T: Send` 保证值在任意线程被析构都是安全的。
pub(crate) struct Confined<T> {
    owner: ThreadId,
    cell: RefCell<T>,
}

// SAFETY: every access to `cell` goes through `with`, which rejects callers whose thread is not
// `owner`, so the `RefCell` is only ever borrowed from a single thread.
unsafe impl<T: Send> Sync for Confined<T> {}

impl<T> Confined<T> {
    pub(crate) fn new(owner: ThreadId, value: T) -> Self {
        Self {
            owner,
            cell: RefCell::new(value),
        }
    }

    pub(crate) fn with<R>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, BridgeError> {
        let caller = thread::current().id();
        if caller != self.owner {
            return Err(BridgeError::ConfinementViolation {
                session_id,
                owner: self.owner,
                caller,
            });
        }
        let mut value = self
            .cell
            .try_borrow_mut()
            .map_err(|_| BridgeError::ReentrantAccess { session_id })?;
        Ok(f(&mut value))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn foreign_thread_is_rejected() {
        let confined = Arc::new(Confined::new(thread::current().id(), 0u32));
        let remote = Arc::clone(&confined);
        let result = thread::spawn(move || remote.with(SessionId::new(7), |value| *value += 1))
            .join()
            .expect("访问线程不应 panic");
        assert!(matches!(
            result,
            Err(BridgeError::ConfinementViolation { .. })
        ));
        let value = confined
            .with(SessionId::new(7), |value| *value)
            .expect("亲和线程访问");
        assert_eq!(value, 0);
    }

    #[test]
    fn reentrant_borrow_is_reported() {
        let confined = Confined::new(thread::current().id(), 0u32);
        let nested = confined
            .with(SessionId::new(1), |_| confined.with(SessionId::new(1), |_| ()))
            .expect("外层借用成功");
        assert!(matches!(nested, Err(BridgeError::ReentrantAccess { .. })));
    }
}
