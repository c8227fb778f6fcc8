//! Record types carried through the commit queue.

/// What a thread was blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingActivity {
    FileRead {
        fd: i32,
        count: usize,
        timed_out: bool,
    },
    FileWrite {
        fd: i32,
        count: usize,
    },
    SocketRead {
        fd: i32,
        count: usize,
        timed_out: bool,
    },
    SocketWrite {
        fd: i32,
        count: usize,
    },
    Wait,
    Lock,
    Select,
}

/// One blocking event, recorded by a producer that may be running in a
/// restricted context. Fixed size; copied into a queue slot by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingEvent {
    pub timestamp_ns: u64,
    pub latency_ns: u64,
    pub activity: BlockingActivity,
}
