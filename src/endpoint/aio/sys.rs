//! Linux-native AIO system calls.

use libc::{
    c_int, c_long, c_uint, c_ulong, syscall, timespec, SYS_io_cancel, SYS_io_destroy, SYS_io_getevents,
    SYS_io_setup, SYS_io_submit,
};
use std::{
    io::{Error, Result},
    os::fd::RawFd,
};

/// AIO context.
pub type ContextId = c_ulong;

/// Opcodes for [`IoCb::opcode`].
pub mod opcode {
    pub const PREAD: u16 = 0;
    pub const PWRITE: u16 = 1;
}

/// AIO completion event as delivered by the kernel.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IoEvent {
    /// [`IoCb::data`] of the completed request.
    pub data: u64,
    /// Address of the completed [`IoCb`].
    pub obj: u64,
    /// Bytes transferred or negated errno.
    pub res: i64,
    pub res2: i64,
}

/// AIO control block.
///
/// Layout of `struct iocb` from `linux/aio_abi.h`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IoCb {
    pub data: u64,

    #[cfg(target_endian = "little")]
    pub key: u32,
    #[cfg(target_endian = "little")]
    pub rw_flags: c_int,

    #[cfg(target_endian = "big")]
    pub rw_flags: c_int,
    #[cfg(target_endian = "big")]
    pub key: u32,

    /// Opcode from [`opcode`].
    pub opcode: u16,
    pub reqprio: i16,
    pub fildes: RawFd,

    /// Address of the transfer buffer.
    pub buf: u64,
    /// Size of the transfer buffer.
    pub nbytes: u64,
    /// Ignored by gadget endpoint files.
    pub offset: i64,

    pub _reserved2: u64,
    pub flags: u32,
    pub resfd: RawFd,
}

impl IoCb {
    pub fn new(opcode: u16, fildes: RawFd, buf: *mut u8, nbytes: u64, data: u64) -> Self {
        Self { opcode, fildes, buf: buf as usize as u64, nbytes, data, ..Default::default() }
    }
}

/// create an asynchronous I/O context
pub unsafe fn setup(nr_events: c_uint, ctx_idp: &mut ContextId) -> Result<()> {
    match syscall(SYS_io_setup, nr_events, ctx_idp as *mut _) {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// destroy an asynchronous I/O context
///
/// Blocks until all outstanding requests have completed.
pub unsafe fn destroy(ctx_id: ContextId) -> Result<()> {
    match syscall(SYS_io_destroy, ctx_id) as c_int {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// submit asynchronous I/O blocks for processing
pub unsafe fn submit(ctx_id: ContextId, nr: c_long, iocbpp: *mut *mut IoCb) -> Result<c_int> {
    match syscall(SYS_io_submit, ctx_id, nr, iocbpp) as c_int {
        -1 => Err(Error::last_os_error()),
        n => Ok(n),
    }
}

/// cancel an outstanding asynchronous I/O operation
pub unsafe fn cancel(ctx_id: ContextId, iocb: *mut IoCb, result: *mut IoEvent) -> Result<()> {
    match syscall(SYS_io_cancel, ctx_id, iocb, result) as c_int {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// read asynchronous I/O events from the completion queue
pub unsafe fn getevents(
    ctx_id: ContextId, min_nr: c_long, nr: c_long, events: *mut IoEvent, timeout: *const timespec,
) -> Result<c_int> {
    match syscall(SYS_io_getevents, ctx_id, min_nr, nr, events, timeout) as c_int {
        -1 => Err(Error::last_os_error()),
        n => Ok(n),
    }
}
