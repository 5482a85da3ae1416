use std::{fs::File, io, path::Path, sync::Arc};

use bytes::Bytes;
use gateway_buffer::{IoBuffer, SharedBuffer};

/// 文件区间句柄：由传输层直接读出并写入通道，会话不持有其字节。
#[derive(Clone, Debug)]
pub struct FileRegion {
    file: Arc<File>,
    position: u64,
    count: u64,
}

impl FileRegion {
    pub fn new(file: File, position: u64, count: u64) -> Self {
        Self {
            file: Arc::new(file),
            position,
            count,
        }
    }

    /// 打开整个文件作为一个区间。
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let count = file.metadata()?.len();
        Ok(Self::new(file, 0, count))
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 读出区间内的全部字节；不移动共享文件句柄的偏移量。
    pub fn read_to_bytes(&self) -> io::Result<Bytes> {
        let len = usize::try_from(self.count)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file region too large"))?;
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, self.position)?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            read => {
                buf = &mut buf[read..];
                offset += read as u64;
            }
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(_file: &File, _buf: &mut [u8], _offset: u64) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// 出站消息。
///
/// - `Buffer`：独占缓冲，刷新时直接把 `[position, limit)` 交给传输层；
/// - `Shared`：共享缓冲，刷新时先复制游标再交出，会话侧的游标不受在途写出影响；
/// - `File`：文件区间，原样交给传输层。
#[derive(Debug)]
pub enum Message {
    Buffer(IoBuffer),
    Shared(SharedBuffer),
    File(FileRegion),
}

impl Message {
    /// 尚待写出的字节数；共享缓冲按当前线程的游标计算。
    pub fn remaining(&self) -> usize {
        match self {
            Message::Buffer(buffer) => buffer.remaining(),
            Message::Shared(shared) => shared.remaining(),
            Message::File(region) => usize::try_from(region.count()).unwrap_or(usize::MAX),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl From<IoBuffer> for Message {
    fn from(buffer: IoBuffer) -> Self {
        Message::Buffer(buffer)
    }
}

impl From<SharedBuffer> for Message {
    fn from(shared: SharedBuffer) -> Self {
        Message::Shared(shared)
    }
}

impl From<FileRegion> for Message {
    fn from(region: FileRegion) -> Self {
        Message::File(region)
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::Buffer(IoBuffer::wrap(bytes))
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::from(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Message {
    fn from(bytes: &'static [u8]) -> Self {
        Message::from(Bytes::from_static(bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_region_reads_only_its_window() {
        let path = std::env::temp_dir().join(format!("gateway-region-{}", std::process::id()));
        {
            let mut file = File::create(&path).expect("创建临时文件");
            file.write_all(b"0123456789").expect("写入临时文件");
        }
        let file = File::open(&path).expect("打开临时文件");
        let region = FileRegion::new(file, 3, 4);
        assert_eq!(region.read_to_bytes().expect("读取区间").as_ref(), b"3456");
        let whole = FileRegion::open(&path).expect("打开整个文件");
        assert_eq!(whole.count(), 10);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shared_message_remaining_follows_thread_cursor() {
        let shared = SharedBuffer::new(Bytes::from_static(b"abcdef"));
        shared.with_cursor(|cursor| cursor.skip(2)).expect("推进游标");
        assert_eq!(Message::from(shared).remaining(), 4);
    }
}
