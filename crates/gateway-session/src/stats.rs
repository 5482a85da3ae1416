use std::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{clock::AtomicInstant, idle::IdleClass};

/// 会话级计数器。
///
/// 计数与时间戳全部使用原子量：写入只发生在亲和线程，但空闲监督线程与管理线程会并发读取。
#[derive(Debug)]
pub(crate) struct SessionStats {
    created_at: Instant,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    read_messages: AtomicU64,
    written_messages: AtomicU64,
    scheduled_write_bytes: AtomicUsize,
    scheduled_write_messages: AtomicUsize,
    last_read: AtomicInstant,
    last_write: AtomicInstant,
    idle_counts: [AtomicU64; 3],
    last_idle: [AtomicInstant; 3],
    idle_fired: [AtomicBool; 3],
    throughput: Mutex<Throughput>,
}

#[derive(Debug, Default)]
struct Throughput {
    last_calculated: Option<Instant>,
    last_read_bytes: u64,
    last_written_bytes: u64,
    read_bytes_per_sec: f64,
    written_bytes_per_sec: f64,
}

/// [`Session::statistics`](crate::Session::statistics) 返回的只读快照。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionStatistics {
    pub created_at: Instant,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub read_messages: u64,
    pub written_messages: u64,
    pub scheduled_write_bytes: usize,
    pub scheduled_write_messages: usize,
    pub last_read: Instant,
    pub last_write: Instant,
    pub reader_idle_count: u64,
    pub writer_idle_count: u64,
    pub both_idle_count: u64,
    pub read_bytes_throughput: f64,
    pub written_bytes_throughput: f64,
}

impl SessionStats {
    pub(crate) fn new(now: Instant) -> Self {
        let stamp = || {
            let instant = AtomicInstant::new(now);
            instant.store(now);
            instant
        };
        Self {
            created_at: now,
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            read_messages: AtomicU64::new(0),
            written_messages: AtomicU64::new(0),
            scheduled_write_bytes: AtomicUsize::new(0),
            scheduled_write_messages: AtomicUsize::new(0),
            last_read: stamp(),
            last_write: stamp(),
            idle_counts: Default::default(),
            last_idle: [stamp(), stamp(), stamp()],
            idle_fired: Default::default(),
            throughput: Mutex::new(Throughput::default()),
        }
    }

    pub(crate) fn record_read(&self, bytes: usize, now: Instant) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_messages.fetch_add(1, Ordering::Relaxed);
        self.last_read.store(now);
    }

    /// 传输层报告写出的字节数。
    pub(crate) fn record_written_bytes(&self, bytes: usize, now: Instant) {
        self.written_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_write.store(now);
    }

    pub(crate) fn record_message_sent(&self, now: Instant) {
        self.written_messages.fetch_add(1, Ordering::Relaxed);
        self.last_write.store(now);
    }

    pub(crate) fn schedule_write(&self, bytes: usize) {
        self.scheduled_write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.scheduled_write_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// 写请求结束（成功、失败或丢弃）时归还记账。
    pub(crate) fn unschedule_write(&self, bytes: usize) {
        saturating_sub(&self.scheduled_write_bytes, bytes);
        saturating_sub(&self.scheduled_write_messages, 1);
    }

    pub(crate) fn scheduled_write_messages(&self) -> usize {
        self.scheduled_write_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn scheduled_write_bytes(&self) -> usize {
        self.scheduled_write_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn last_read(&self) -> Instant {
        self.last_read.load()
    }

    pub(crate) fn last_write(&self) -> Instant {
        self.last_write.load()
    }

    /// 指定空闲类别的最近一次 I/O 时间；双向空闲取读写两者的较晚者。
    pub(crate) fn last_activity(&self, class: IdleClass) -> Instant {
        match class {
            IdleClass::Reader => self.last_read(),
            IdleClass::Writer => self.last_write(),
            IdleClass::Both => self.last_read().max(self.last_write()),
        }
    }

    pub(crate) fn record_idle(&self, class: IdleClass, at: Instant) {
        let index = class.index();
        self.idle_counts[index].fetch_add(1, Ordering::Relaxed);
        self.last_idle[index].store(at);
        self.idle_fired[index].store(true, Ordering::Release);
    }

    pub(crate) fn last_idle(&self, class: IdleClass) -> Option<Instant> {
        let index = class.index();
        self.idle_fired[index]
            .load(Ordering::Acquire)
            .then(|| self.last_idle[index].load())
    }

    pub(crate) fn idle_count(&self, class: IdleClass) -> u64 {
        self.idle_counts[class.index()].load(Ordering::Relaxed)
    }

    /// 距上次计算超过 `interval` 时重新计算吞吐；`force` 忽略间隔限制。
    pub(crate) fn update_throughput(&self, now: Instant, interval: Duration, force: bool) {
        let read = self.read_bytes.load(Ordering::Relaxed);
        let written = self.written_bytes.load(Ordering::Relaxed);
        let mut throughput = self.throughput.lock();
        let since = throughput.last_calculated.unwrap_or(self.created_at);
        let elapsed = now.saturating_duration_since(since);
        if elapsed.is_zero() || (!force && elapsed < interval) {
            return;
        }
        let seconds = elapsed.as_secs_f64();
        throughput.read_bytes_per_sec =
            read.saturating_sub(throughput.last_read_bytes) as f64 / seconds;
        throughput.written_bytes_per_sec =
            written.saturating_sub(throughput.last_written_bytes) as f64 / seconds;
        throughput.last_read_bytes = read;
        throughput.last_written_bytes = written;
        throughput.last_calculated = Some(now);
    }

    pub(crate) fn snapshot(&self) -> SessionStatistics {
        let throughput = self.throughput.lock();
        SessionStatistics {
            created_at: self.created_at,
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            read_messages: self.read_messages.load(Ordering::Relaxed),
            written_messages: self.written_messages.load(Ordering::Relaxed),
            scheduled_write_bytes: self.scheduled_write_bytes(),
            scheduled_write_messages: self.scheduled_write_messages(),
            last_read: self.last_read(),
            last_write: self.last_write(),
            reader_idle_count: self.idle_count(IdleClass::Reader),
            writer_idle_count: self.idle_count(IdleClass::Writer),
            both_idle_count: self.idle_count(IdleClass::Both),
            read_bytes_throughput: throughput.read_bytes_per_sec,
            written_bytes_throughput: throughput.written_bytes_per_sec,
        }
    }
}

/// 服务级计数器：当前受管会话数、峰值与累计数。
#[derive(Debug, Default)]
pub(crate) struct ServiceStats {
    managed: AtomicUsize,
    largest_managed: AtomicUsize,
    cumulative: AtomicU64,
}

/// [`ServiceStats`] 的快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStatistics {
    pub managed_sessions: usize,
    pub largest_managed_sessions: usize,
    pub cumulative_sessions: u64,
}

impl ServiceStats {
    pub(crate) fn session_added(&self) {
        let managed = self.managed.fetch_add(1, Ordering::AcqRel) + 1;
        self.largest_managed.fetch_max(managed, Ordering::AcqRel);
        self.cumulative.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_removed(&self) {
        saturating_sub(&self.managed, 1);
    }

    pub(crate) fn snapshot(&self) -> ServiceStatistics {
        ServiceStatistics {
            managed_sessions: self.managed.load(Ordering::Acquire),
            largest_managed_sessions: self.largest_managed.load(Ordering::Acquire),
            cumulative_sessions: self.cumulative.load(Ordering::Relaxed),
        }
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(value))
    });
}
