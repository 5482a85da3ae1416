use bytes::Bytes;
use gateway_buffer::{
    BufferAllocator, BufferMode, HeapAllocator, PooledAllocator, WrappedBuffer,
};

fn assert_fresh_exclusive(allocator: &dyn BufferAllocator) {
    let buf = allocator.allocate(48);
    assert_eq!(buf.mode(), BufferMode::Exclusive);
    assert_eq!(buf.position(), 0);
    assert_eq!(buf.limit(), 48);
    assert!(buf.capacity() >= 48);
    assert!(!buf.is_read_only());
}

#[test]
fn every_allocator_hands_out_fresh_exclusive_buffers() {
    assert_fresh_exclusive(&HeapAllocator);
    assert_fresh_exclusive(&PooledAllocator::new(8));
}

#[test]
fn reused_block_is_zero_filled_up_to_limit() {
    let pool = PooledAllocator::new(2);
    let mut dirty = pool.allocate(8);
    dirty.put_slice(b"dirtydat").expect("写满");
    pool.release(dirty);

    let reused = pool.allocate(8);
    assert_eq!(reused.as_slice(), &[0u8; 8]);
}

#[test]
fn wrap_does_not_copy_raw_bytes() {
    let raw = Bytes::from_static(b"zero-copy");
    let ptr = raw.as_ptr();
    match HeapAllocator.wrap(raw.clone(), BufferMode::Exclusive) {
        WrappedBuffer::Exclusive(buf) => assert_eq!(buf.as_slice().as_ptr(), ptr),
        WrappedBuffer::Shared(_) => panic!("请求独占模式却得到共享缓冲"),
    }
    match HeapAllocator.wrap(raw, BufferMode::Shared) {
        WrappedBuffer::Shared(shared) => assert_eq!(shared.origin_bytes().as_ptr(), ptr),
        WrappedBuffer::Exclusive(_) => panic!("请求共享模式却得到独占缓冲"),
    }
}

#[test]
fn free_list_respects_slot_cap_and_shrink() {
    let pool = PooledAllocator::new(1);
    let a = pool.allocate(16);
    let b = pool.allocate(16);
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.stats().free_slots, 1);
    assert!(pool.shrink() >= 16);
    assert_eq!(pool.stats().available_bytes, 0);
}
