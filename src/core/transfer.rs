use std::io;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use super::device::BufferDevice;
use super::framebuffer::FrameBuffer;
use crate::error::{Error, Result};

/// Control message buffer, aligned for `cmsghdr` and large enough for one fd
#[repr(C, align(8))]
struct CmsgBuffer([u8; 32]);

fn cmsg_space() -> usize {
    // SAFETY: pure arithmetic
    unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) as usize }
}

/// Connected stream carrying one output-id byte plus one fd per message
#[derive(Debug)]
pub struct HandleChannel {
    stream: UnixStream,
    sent: u64,
}

impl HandleChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream, sent: 0 }
    }

    /// Messages sent so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Export `buffer` and ship the handle tagged with `output_id`.
    ///
    /// The exported fd is closed as soon as the write returns; the receiver
    /// holds its own duplicate from then on.
    pub fn send_buffer<D>(&mut self, device: &D, output_id: i32, buffer: &FrameBuffer) -> Result<()>
    where
        D: BufferDevice + ?Sized,
    {
        let tag = u8::try_from(output_id).map_err(|_| Error::OutputIdOutOfRange(output_id))?;
        let exported = device.export(buffer)?;
        self.send_handle(tag, exported.as_fd())?;
        drop(exported);
        Ok(())
    }

    /// One `sendmsg`: a single payload byte with `fd` as `SCM_RIGHTS`
    pub fn send_handle(&mut self, tag: u8, fd: BorrowedFd<'_>) -> Result<()> {
        let mut payload = [tag];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };

        let mut control = CmsgBuffer([0; 32]);
        let space = cmsg_space();
        debug_assert!(space <= control.0.len());

        // SAFETY: msghdr is plain data, zero is a valid initial state
        let mut msg: libc::msghdr = unsafe { MaybeUninit::zeroed().assume_init() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points at `space` aligned bytes, enough for one
        // header plus one fd
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
        }

        // SAFETY: msg and everything it points at outlive the call
        let sent = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if sent < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if sent as usize != payload.len() {
            return Err(Error::ShortWrite { sent: sent as usize });
        }

        self.sent += 1;
        Ok(())
    }
}

impl AsFd for HandleChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Read one message sent by [`HandleChannel::send_handle`].
///
/// Returns `None` once the peer has closed the stream.
pub fn recv_handle(stream: &UnixStream) -> io::Result<Option<(u8, OwnedFd)>> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    let mut control = CmsgBuffer([0; 32]);

    // SAFETY: msghdr is plain data, zero is a valid initial state
    let mut msg: libc::msghdr = unsafe { MaybeUninit::zeroed().assume_init() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space() as _;

    // SAFETY: buffers referenced by msg outlive the call
    let received = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received == 0 {
        return Ok(None);
    }

    // SAFETY: the kernel filled msg_control; walk it with the CMSG helpers
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message carried no fd"));
        }
        let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
        Ok(Some((payload[0], OwnedFd::from_raw_fd(raw))))
    }
}
