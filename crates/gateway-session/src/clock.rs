//! 可注入的单调时钟。
//!
//! 空闲监督与吞吐统计都依赖“当前时间”；测试通过 [`ManualClock`] 推进虚拟时间，
//! 让空闲修正、吞吐计算等时间相关行为可以确定性地复现。

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// 单调时钟抽象，实现者必须保证 `now` 不回退。
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// 直接读取 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟。
///
/// # 教案式说明
/// - **意图 (Why)**：空闲检测的“在截止前发生 I/O 则延后触发”等性质需要精确控制时间流逝；
/// - **契约 (What)**：`now` 返回创建时刻加上累计推进量；克隆体共享同一时间线。
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.offset.lock() += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// 以“相对纪元的纳秒数”原子存放的时间点，供跨线程读取的时间戳使用。
#[derive(Debug)]
pub(crate) struct AtomicInstant {
    epoch: Instant,
    nanos: AtomicU64,
}

impl AtomicInstant {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn store(&self, at: Instant) {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos();
        self.nanos
            .store(u64::try_from(nanos).unwrap_or(u64::MAX), Ordering::Release);
    }

    pub(crate) fn load(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_timeline() {
        let clock = ManualClock::new();
        let observer = clock.clone();
        let start = observer.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(observer.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn atomic_instant_round_trips_through_epoch() {
        let clock = ManualClock::new();
        let stamp = AtomicInstant::new(clock.now());
        clock.advance(Duration::from_secs(2));
        stamp.store(clock.now());
        assert_eq!(stamp.load(), clock.now());
    }
}
