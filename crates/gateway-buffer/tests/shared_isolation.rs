//! 共享缓冲的游标隔离契约：一个消费者推进游标，绝不改变另一个消费者观察到的位置。

use std::{
    sync::{Arc, Barrier},
    thread,
};

use bytes::Bytes;
use gateway_buffer::{ConsumerId, IoBuffer, SharedBuffer};
use proptest::prelude::*;

#[test]
fn concurrent_threads_advance_independent_cursors() {
    let shared = SharedBuffer::new(Bytes::from(vec![7u8; 1024]));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [3usize, 500]
        .into_iter()
        .map(|step| {
            let shared = shared.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..(1024 / step) {
                    shared
                        .with_cursor(|cursor| cursor.skip(step))
                        .expect("在本线程游标上推进");
                }
                barrier.wait();
                shared.position()
            })
        })
        .collect();

    let positions: Vec<usize> = handles
        .into_iter()
        .map(|handle| handle.join().expect("消费者线程不应 panic"))
        .collect();
    assert_eq!(positions, vec![(1024 / 3) * 3, 1000]);
    assert_eq!(shared.position(), 0, "主线程游标保持初始位置");
}

#[test]
fn handoff_through_duplicate_survives_original_cursor_drop() {
    let shared = SharedBuffer::new(Bytes::from_static(b"handoff"));
    shared.with_cursor(|cursor| cursor.skip(4)).expect("推进");
    let handed = shared.duplicate();
    shared.release_cursor();

    let observed = thread::spawn(move || handed.as_slice().to_vec())
        .join()
        .expect("接收线程不应 panic");
    assert_eq!(observed, b"off");
}

#[test]
fn exclusive_buffer_into_shared_keeps_cursor_as_origin() {
    let mut buf = IoBuffer::allocate(16);
    buf.put_slice(b"header|body").expect("写入");
    buf.flip();
    buf.skip(7).expect("跳过头部");

    let shared = buf.into_shared();
    assert_eq!(shared.origin_bytes().as_ref(), b"body");
    assert_eq!(shared.with_cursor_for(ConsumerId::Custom(9), |c| c.remaining()), 4);
}

proptest! {
    #[test]
    fn advancing_one_consumer_never_moves_another(
        len in 1usize..256,
        steps in proptest::collection::vec((0u64..4, 0usize..32), 0..64),
    ) {
        let shared = SharedBuffer::new(Bytes::from(vec![0u8; len]));
        let mut expected = [0usize; 4];
        for (consumer, step) in steps {
            let id = ConsumerId::Custom(consumer);
            let index = consumer as usize;
            let advanced = shared.with_cursor_for(id, |cursor| cursor.skip(step).is_ok());
            if advanced {
                expected[index] += step;
            }
            for (other, position) in expected.iter().enumerate() {
                let observed = shared
                    .with_cursor_for(ConsumerId::Custom(other as u64), |cursor| cursor.position());
                prop_assert_eq!(observed, *position);
            }
        }
    }
}
