//! 空闲监督器：以共享的粗粒度定时器为所有会话检测读/写/双向空闲。
//!
//! # 教案式说明
//! - **意图 (Why)**：不为每个会话起轮询线程；一个监督器线程按固定节拍（默认 100ms）推进，
//!   同时服务成百上千个会话；
//! - **逻辑 (How)**：
//!   - 每个（会话, 空闲类别）至多有一个有效截止时间，记录在 `timers` 中并携带代次号；
//!     截止时间同时进入一个小根堆；
//!   - 重新调度只需递增代次并压入新条目，旧条目出堆时发现代次不符即视为已取消；
//!   - 截止时间为 `max(最近 I/O 时间, 最近空闲触发时间) + 周期`，向上取整到节拍边界；
//!   - 到期时重新读取会话的最近 I/O 时间：若真实截止已过则触发空闲并按新基准重排，
//!     否则仅按修正后的剩余时长重排，不产生事件；
//! - **契约 (What)**：会话的 I/O 只更新时间戳，不触碰监督器；监督器在到期检查时自我修正，
//!   因此突发 I/O 之后不会误报空闲。

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clock::Clock;

/// 空闲类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdleClass {
    Reader,
    Writer,
    Both,
}

impl IdleClass {
    pub const ALL: [IdleClass; 3] = [IdleClass::Reader, IdleClass::Writer, IdleClass::Both];

    pub(crate) fn index(self) -> usize {
        match self {
            IdleClass::Reader => 0,
            IdleClass::Writer => 1,
            IdleClass::Both => 2,
        }
    }
}

impl fmt::Display for IdleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdleClass::Reader => "reader-idle",
            IdleClass::Writer => "writer-idle",
            IdleClass::Both => "both-idle",
        })
    }
}

/// 到期检查时目标所处的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleGate {
    /// 正常接收空闲事件。
    Active,
    /// 亲和线程暂未接入，本次不触发，但保留定时器。
    Detached,
    /// 正在关闭或已关闭，定时器随之撤销。
    Closing,
}

/// 被监督的对象，由会话实现。
pub trait IdleTarget: Send + Sync + 'static {
    /// 在同一监督器内唯一的键。
    fn idle_key(&self) -> u64;

    fn idle_interval(&self, class: IdleClass) -> Duration;

    fn last_activity(&self, class: IdleClass) -> Instant;

    fn last_idle_fire(&self, class: IdleClass) -> Option<Instant>;

    fn idle_gate(&self) -> IdleGate;

    /// 触发空闲事件；实现需同步记录 `at` 作为该类别的最近触发时间。
    fn raise_idle(&self, class: IdleClass, at: Instant);
}

type TimerKey = (u64, IdleClass);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    key: TimerKey,
    generation: u64,
}

struct Slot {
    generation: u64,
    deadline: Instant,
    target: Weak<dyn IdleTarget>,
}

struct Wheel {
    heap: BinaryHeap<Reverse<Entry>>,
    timers: HashMap<TimerKey, Slot>,
    next_generation: u64,
}

struct Shared {
    wheel: Mutex<Wheel>,
    wakeup: Condvar,
    clock: Arc<dyn Clock>,
    origin: Instant,
    tick: Duration,
    shutdown: AtomicBool,
}

/// 单个空闲监督器。克隆只增加引用计数。
#[derive(Clone)]
pub struct IdleSupervisor {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IdleSupervisor {
    /// 创建不带后台线程的监督器，由调用方通过 [`IdleSupervisor::tick`] 驱动。
    pub fn manual(clock: Arc<dyn Clock>, tick: Duration) -> Self {
        let origin = clock.now();
        Self {
            shared: Arc::new(Shared {
                wheel: Mutex::new(Wheel {
                    heap: BinaryHeap::new(),
                    timers: HashMap::new(),
                    next_generation: 0,
                }),
                wakeup: Condvar::new(),
                clock,
                origin,
                tick,
                shutdown: AtomicBool::new(false),
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// 创建监督器并启动后台节拍线程。
    pub fn spawn(clock: Arc<dyn Clock>, tick: Duration, name: String) -> std::io::Result<Self> {
        let supervisor = Self::manual(clock, tick);
        let driver = supervisor.clone();
        let handle = thread::Builder::new().name(name).spawn(move || driver.run())?;
        *supervisor.worker.lock() = Some(handle);
        Ok(supervisor)
    }

    /// 登记或重排一个空闲定时器；`interval` 为 0 时撤销该类别。
    pub fn reschedule(&self, target: &Arc<dyn IdleTarget>, class: IdleClass) {
        let interval = target.idle_interval(class);
        let key = (target.idle_key(), class);
        let mut wheel = self.shared.wheel.lock();
        if interval.is_zero() || self.shared.shutdown.load(Ordering::Acquire) {
            wheel.timers.remove(&key);
            return;
        }
        let deadline = self.deadline_for(target.as_ref(), class, interval);
        Self::arm(&mut wheel, key, deadline, Arc::downgrade(target));
    }

    /// 撤销某个目标的全部定时器；堆中残留条目出堆时被忽略。
    pub fn deregister(&self, key: u64) {
        let mut wheel = self.shared.wheel.lock();
        for class in IdleClass::ALL {
            wheel.timers.remove(&(key, class));
        }
    }

    /// 当前登记的定时器数量。
    pub fn scheduled(&self) -> usize {
        self.shared.wheel.lock().timers.len()
    }

    /// 某个定时器当前的截止时间。
    pub fn deadline(&self, key: u64, class: IdleClass) -> Option<Instant> {
        self.shared
            .wheel
            .lock()
            .timers
            .get(&(key, class))
            .map(|slot| slot.deadline)
    }

    /// 处理所有在 `now` 之前到期的条目，返回触发的空闲事件数。
    pub fn tick(&self, now: Instant) -> usize {
        let due = self.collect_due(now);
        let mut raised = 0;
        for (entry, target) in due {
            let (key, class) = entry.key;
            let Some(target) = target.upgrade() else {
                self.shared.wheel.lock().timers.remove(&entry.key);
                continue;
            };
            match target.idle_gate() {
                IdleGate::Closing => {
                    self.deregister(key);
                    continue;
                }
                IdleGate::Detached => {
                    self.rearm_if_current(&entry, &target, now);
                    continue;
                }
                IdleGate::Active => {}
            }
            let interval = target.idle_interval(class);
            if interval.is_zero() {
                self.shared.wheel.lock().timers.remove(&entry.key);
                continue;
            }
            let base = base_time(target.as_ref(), class);
            if base + interval <= now {
                if !self.is_current(&entry) {
                    continue;
                }
                target.raise_idle(class, now);
                raised += 1;
            }
            self.rearm_if_current(&entry, &target, now);
        }
        raised
    }

    /// 停止后台线程并清空全部定时器。
    pub fn dispose(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut wheel = self.shared.wheel.lock();
            wheel.heap.clear();
            wheel.timers.clear();
        }
        self.shared.wakeup.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("idle supervisor thread panicked");
        }
    }

    fn run(&self) {
        debug!("idle supervisor started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            {
                let mut wheel = self.shared.wheel.lock();
                if self.shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let _ = self.shared.wakeup.wait_for(&mut wheel, self.shared.tick);
            }
            self.tick(self.shared.clock.now());
        }
        debug!("idle supervisor stopped");
    }

    fn collect_due(&self, now: Instant) -> Vec<(Entry, Weak<dyn IdleTarget>)> {
        let mut wheel = self.shared.wheel.lock();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = wheel.heap.peek().copied() {
            if entry.deadline > now {
                break;
            }
            wheel.heap.pop();
            if let Some(slot) = wheel.timers.get(&entry.key)
                && slot.generation == entry.generation
            {
                due.push((entry, slot.target.clone()));
            }
        }
        due
    }

    fn is_current(&self, entry: &Entry) -> bool {
        self.shared
            .wheel
            .lock()
            .timers
            .get(&entry.key)
            .is_some_and(|slot| slot.generation == entry.generation)
    }

    /// 到期处理后重排；若期间已有其它调用重排过，则保留对方的结果。
    fn rearm_if_current(&self, entry: &Entry, target: &Arc<dyn IdleTarget>, now: Instant) {
        let class = entry.key.1;
        let interval = target.idle_interval(class);
        let mut wheel = self.shared.wheel.lock();
        let current = wheel
            .timers
            .get(&entry.key)
            .is_some_and(|slot| slot.generation == entry.generation);
        if !current || interval.is_zero() {
            return;
        }
        let mut deadline = self.deadline_for(target.as_ref(), class, interval);
        if deadline <= now {
            deadline = self.round_up(now + self.shared.tick);
        }
        Self::arm(&mut wheel, entry.key, deadline, Arc::downgrade(target));
    }

    fn deadline_for(&self, target: &dyn IdleTarget, class: IdleClass, interval: Duration) -> Instant {
        self.round_up(base_time(target, class) + interval)
    }

    /// 向上取整到节拍边界。
    fn round_up(&self, at: Instant) -> Instant {
        let tick = self.shared.tick.as_nanos().max(1);
        let offset = at.saturating_duration_since(self.shared.origin).as_nanos();
        let buckets = offset.div_ceil(tick);
        let rounded = u64::try_from(buckets.saturating_mul(tick)).unwrap_or(u64::MAX);
        self.shared.origin + Duration::from_nanos(rounded)
    }

    fn arm(wheel: &mut Wheel, key: TimerKey, deadline: Instant, target: Weak<dyn IdleTarget>) {
        wheel.next_generation += 1;
        let generation = wheel.next_generation;
        wheel.timers.insert(
            key,
            Slot {
                generation,
                deadline,
                target,
            },
        );
        wheel.heap.push(Reverse(Entry {
            deadline,
            key,
            generation,
        }));
    }
}

impl fmt::Debug for IdleSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleSupervisor")
            .field("tick", &self.shared.tick)
            .field("scheduled", &self.scheduled())
            .finish()
    }
}

fn base_time(target: &dyn IdleTarget, class: IdleClass) -> Instant {
    let activity = target.last_activity(class);
    match target.last_idle_fire(class) {
        Some(fired) => activity.max(fired),
        None => activity,
    }
}

/// 一小组空闲监督器，会话按轮询方式分配到其中之一。
#[derive(Clone, Debug)]
pub struct IdleSupervisorPool {
    supervisors: Arc<[IdleSupervisor]>,
    next: Arc<AtomicUsize>,
}

impl IdleSupervisorPool {
    /// 启动 `size` 个带后台线程的监督器。
    pub fn spawn(size: usize, clock: Arc<dyn Clock>, tick: Duration) -> std::io::Result<Self> {
        let mut supervisors = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            match IdleSupervisor::spawn(Arc::clone(&clock), tick, format!("gateway-idle-{index}")) {
                Ok(supervisor) => supervisors.push(supervisor),
                Err(err) => {
                    supervisors.iter().for_each(IdleSupervisor::dispose);
                    return Err(err);
                }
            }
        }
        Ok(Self::from_supervisors(supervisors))
    }

    /// 构造由调用方驱动的监督器组。
    pub fn manual(size: usize, clock: Arc<dyn Clock>, tick: Duration) -> Self {
        let supervisors = (0..size.max(1))
            .map(|_| IdleSupervisor::manual(Arc::clone(&clock), tick))
            .collect();
        Self::from_supervisors(supervisors)
    }

    fn from_supervisors(supervisors: Vec<IdleSupervisor>) -> Self {
        Self {
            supervisors: supervisors.into(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn next(&self) -> IdleSupervisor {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.supervisors.len();
        self.supervisors[index].clone()
    }

    pub fn supervisors(&self) -> &[IdleSupervisor] {
        &self.supervisors
    }

    /// 驱动组内全部监督器，返回触发的空闲事件总数。
    pub fn tick(&self, now: Instant) -> usize {
        self.supervisors.iter().map(|s| s.tick(now)).sum()
    }

    pub fn dispose(&self) {
        self.supervisors.iter().for_each(IdleSupervisor::dispose);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU8;

    use super::*;
    use crate::clock::{AtomicInstant, ManualClock};

    struct FakeTarget {
        key: u64,
        interval: Duration,
        activity: AtomicInstant,
        fired: Mutex<Vec<(IdleClass, Instant)>>,
        gate: AtomicU8,
    }

    impl FakeTarget {
        fn new(clock: &ManualClock, interval: Duration) -> Arc<Self> {
            let activity = AtomicInstant::new(clock.now());
            activity.store(clock.now());
            Arc::new(Self {
                key: 1,
                interval,
                activity,
                fired: Mutex::new(Vec::new()),
                gate: AtomicU8::new(0),
            })
        }

        fn fired(&self) -> Vec<(IdleClass, Instant)> {
            self.fired.lock().clone()
        }
    }

    impl IdleTarget for FakeTarget {
        fn idle_key(&self) -> u64 {
            self.key
        }

        fn idle_interval(&self, class: IdleClass) -> Duration {
            if class == IdleClass::Reader {
                self.interval
            } else {
                Duration::ZERO
            }
        }

        fn last_activity(&self, _class: IdleClass) -> Instant {
            self.activity.load()
        }

        fn last_idle_fire(&self, class: IdleClass) -> Option<Instant> {
            self.fired
                .lock()
                .iter()
                .rev()
                .find(|(fired, _)| *fired == class)
                .map(|(_, at)| *at)
        }

        fn idle_gate(&self) -> IdleGate {
            match self.gate.load(Ordering::SeqCst) {
                0 => IdleGate::Active,
                1 => IdleGate::Detached,
                _ => IdleGate::Closing,
            }
        }

        fn raise_idle(&self, class: IdleClass, at: Instant) {
            self.fired.lock().push((class, at));
        }
    }

    fn setup(interval: Duration) -> (ManualClock, IdleSupervisor, Arc<FakeTarget>) {
        let clock = ManualClock::new();
        let supervisor = IdleSupervisor::manual(Arc::new(clock.clone()), Duration::from_millis(100));
        let fake = FakeTarget::new(&clock, interval);
        let target: Arc<dyn IdleTarget> = fake.clone();
        supervisor.reschedule(&target, IdleClass::Reader);
        (clock, supervisor, fake)
    }

    #[test]
    fn fires_once_per_interval_without_io() {
        let (clock, supervisor, fake) = setup(Duration::from_secs(1));
        clock.advance(Duration::from_millis(900));
        assert_eq!(supervisor.tick(clock.now()), 0);
        clock.advance(Duration::from_millis(100));
        assert_eq!(supervisor.tick(clock.now()), 1);
        clock.advance(Duration::from_millis(500));
        assert_eq!(supervisor.tick(clock.now()), 0, "下一次触发以上次触发时间为基准");
        clock.advance(Duration::from_millis(500));
        assert_eq!(supervisor.tick(clock.now()), 1);
        assert_eq!(fake.fired().len(), 2);
    }

    #[test]
    fn io_before_deadline_defers_the_event() {
        let (clock, supervisor, fake) = setup(Duration::from_secs(1));
        clock.advance(Duration::from_millis(600));
        fake.activity.store(clock.now());

        clock.advance(Duration::from_millis(400));
        assert_eq!(supervisor.tick(clock.now()), 0, "原截止时间不得触发");
        assert_eq!(
            supervisor.deadline(1, IdleClass::Reader),
            Some(fake.activity.load() + Duration::from_secs(1)),
            "修正到最近 I/O 时间加周期"
        );

        clock.advance(Duration::from_millis(600));
        assert_eq!(supervisor.tick(clock.now()), 1);
        let (_, at) = fake.fired()[0];
        assert!(at >= fake.activity.load() + Duration::from_secs(1));
    }

    #[test]
    fn rescheduling_cancels_the_stale_entry() {
        let (clock, supervisor, fake) = setup(Duration::from_secs(1));
        let target: Arc<dyn IdleTarget> = fake.clone();
        supervisor.reschedule(&target, IdleClass::Reader);
        supervisor.reschedule(&target, IdleClass::Reader);
        clock.advance(Duration::from_secs(1));
        assert_eq!(supervisor.tick(clock.now()), 1, "同一类别只有一个有效截止时间");
        assert_eq!(supervisor.scheduled(), 1);
    }

    #[test]
    fn detached_target_keeps_timer_without_firing() {
        let (clock, supervisor, fake) = setup(Duration::from_secs(1));
        fake.gate.store(1, Ordering::SeqCst);
        clock.advance(Duration::from_secs(2));
        assert_eq!(supervisor.tick(clock.now()), 0);
        assert_eq!(supervisor.scheduled(), 1);

        fake.gate.store(0, Ordering::SeqCst);
        clock.advance(Duration::from_millis(100));
        assert_eq!(supervisor.tick(clock.now()), 1);
    }

    #[test]
    fn closing_target_is_deregistered() {
        let (clock, supervisor, fake) = setup(Duration::from_secs(1));
        fake.gate.store(2, Ordering::SeqCst);
        clock.advance(Duration::from_secs(1));
        assert_eq!(supervisor.tick(clock.now()), 0);
        assert_eq!(supervisor.scheduled(), 0);
    }

    #[test]
    fn dropped_target_is_forgotten() {
        let (clock, supervisor, fake) = setup(Duration::from_secs(1));
        drop(fake);
        clock.advance(Duration::from_secs(1));
        assert_eq!(supervisor.tick(clock.now()), 0);
        assert_eq!(supervisor.scheduled(), 0);
    }

    #[test]
    fn pool_hands_out_supervisors_round_robin() {
        let pool = IdleSupervisorPool::manual(2, Arc::new(ManualClock::new()), Duration::from_millis(100));
        let first = pool.next();
        let second = pool.next();
        let third = pool.next();
        assert!(!Arc::ptr_eq(&first.shared, &second.shared));
        assert!(Arc::ptr_eq(&first.shared, &third.shared));
    }

    #[test]
    fn background_thread_stops_on_dispose() {
        let supervisor = IdleSupervisor::spawn(
            Arc::new(crate::clock::SystemClock),
            Duration::from_millis(5),
            "idle-test".into(),
        )
        .expect("启动监督线程");
        supervisor.dispose();
        assert!(supervisor.worker.lock().is_none());
    }
}
