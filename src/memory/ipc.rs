//! Shareable-handle transport over unix sockets.
//!
//! The wire protocol is one message per handle: the rkyv-serialized
//! [`PoolDesc`] travels as the payload and the backing memfd as an
//! `SCM_RIGHTS` control message. A message carries exactly one fd; anything
//! else is rejected on receive. There is no framing beyond the message
//! itself, so one send pairs with exactly one receive.

use crate::error::{Error, Result};
use crate::memory::shareable::{PoolDesc, ShareableHandle};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Upper bound on the serialized descriptor accepted on receive.
const DESC_WIRE_MAX: usize = 128;

/// Send a [`ShareableHandle`] over a unix socket.
///
/// The handle is borrowed; send it to several peers if needed.
pub fn send_shareable_handle(socket: &UnixStream, handle: &ShareableHandle) -> Result<()> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(handle.desc())
        .map_err(|e| Error::ExportFailed(format!("descriptor serialization failed: {e}")))?;
    if payload.len() > DESC_WIRE_MAX {
        return Err(Error::ExportFailed(format!(
            "descriptor is {} bytes, wire limit is {DESC_WIRE_MAX}",
            payload.len()
        )));
    }

    let backing = [handle.fd()];
    let mut control: Vec<MaybeUninit<u8>> =
        vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut ancillary = SendAncillaryBuffer::new(&mut control);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&backing)) {
        return Err(Error::ExportFailed(
            "backing fd does not fit the control message".into(),
        ));
    }

    let iov = [IoSlice::new(&payload)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// Receive a [`ShareableHandle`] sent by [`send_shareable_handle`].
///
/// Fails with [`Error::ImportFailed`] when the message carries no fd, more
/// than one fd, or a payload that is not a valid descriptor.
pub fn recv_shareable_handle(socket: &UnixStream) -> Result<ShareableHandle> {
    let mut payload = [0u8; DESC_WIRE_MAX];
    let mut control: Vec<MaybeUninit<u8>> =
        vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut ancillary = RecvAncillaryBuffer::new(&mut control);

    let mut iov = [IoSliceMut::new(&mut payload)];
    let received = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;

    let mut backing_fd = None;
    for message in ancillary.drain() {
        let RecvAncillaryMessage::ScmRights(rights) = message else {
            continue;
        };
        for fd in rights {
            if backing_fd.replace(fd).is_some() {
                return Err(Error::ImportFailed(
                    "message carries more than one backing fd".into(),
                ));
            }
        }
    }
    let Some(fd) = backing_fd else {
        return Err(Error::ImportFailed("message carries no backing fd".into()));
    };

    // Archived access needs aligned bytes; the socket buffer is not.
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(&payload[..received.bytes]);
    let desc: PoolDesc = rkyv::from_bytes::<PoolDesc, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::ImportFailed(format!("malformed pool descriptor: {e}")))?;

    Ok(ShareableHandle::from_parts(fd, desc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::memory::shareable::{ShareableMempool, SharedMempool};
    use std::io::Write;

    #[test]
    fn test_shareable_handle_roundtrip() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let device = Device::new(0).unwrap();
        let pool = ShareableMempool::new(&device, 8192).unwrap();
        let handle = pool.get_shareable_handle().unwrap();

        send_shareable_handle(&sender, &handle).unwrap();
        let received = recv_shareable_handle(&receiver).unwrap();

        assert_eq!(received.desc(), handle.desc());

        // The received handle opens a working view of the same pool.
        let imported = SharedMempool::new(&device, &received).unwrap();
        assert_eq!(imported.pool_id(), pool.pool_id());
    }

    #[test]
    fn test_recv_without_backing_fd_fails() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();

        // Plain bytes with no control message cannot become a handle.
        sender.write_all(b"payload without an fd").unwrap();
        assert!(matches!(
            recv_shareable_handle(&receiver),
            Err(Error::ImportFailed(_))
        ));
    }

    #[test]
    fn test_recv_garbage_payload_fails() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let device = Device::new(0).unwrap();
        let pool = ShareableMempool::new(&device, 4096).unwrap();
        let handle = pool.get_shareable_handle().unwrap();

        // A valid fd with a payload that is not a descriptor is rejected.
        let backing = [handle.fd()];
        let mut control: Vec<MaybeUninit<u8>> =
            vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
        let mut ancillary = SendAncillaryBuffer::new(&mut control);
        assert!(ancillary.push(SendAncillaryMessage::ScmRights(&backing)));
        let iov = [IoSlice::new(b"not a descriptor")];
        sendmsg(&sender, &iov, &mut ancillary, SendFlags::empty()).unwrap();

        assert!(matches!(
            recv_shareable_handle(&receiver),
            Err(Error::ImportFailed(_))
        ));
    }

    #[test]
    fn test_one_send_pairs_with_one_recv() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let device = Device::new(0).unwrap();
        let pool = ShareableMempool::new(&device, 4096).unwrap();

        let first = pool.get_shareable_handle().unwrap();
        let second = pool.get_shareable_handle().unwrap();
        send_shareable_handle(&sender, &first).unwrap();
        send_shareable_handle(&sender, &second).unwrap();

        let a = recv_shareable_handle(&receiver).unwrap();
        let b = recv_shareable_handle(&receiver).unwrap();
        assert_eq!(a.desc(), first.desc());
        assert_eq!(b.desc(), second.desc());
    }
}
