// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket I/O for the control protocol: the `{u16 msg_type, u32 len}`
//! little-endian header, msgpack payload encode/decode, the blocking
//! and non-blocking read paths, and SCM_RIGHTS fd passing.

use std::{
    io::{self, IoSlice, IoSliceMut, Read, Write},
    os::unix::{io::RawFd, net::UnixStream},
    path::Path,
    thread, time,
};

use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use hexe_protocol::{CtlMessage, MsgType, CTL_HEADER_LEN, MAX_CTL_PAYLOAD};
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Backoff while spin-reading the tail of a message that has started
/// arriving on a non-blocking fd.
const SPIN_SLEEP: time::Duration = time::Duration::from_micros(50);

/// The error kinds callers of the codec branch on. Everything else in
/// the tree uses anyhow; this one enum exists because connection
/// handling differs per kind: `Closed` drops the peer quietly,
/// `WouldBlock` returns to the poll loop, `Malformed` drops the peer
/// with prejudice.
#[derive(Debug)]
pub enum WireError {
    /// The peer hung up (EOF, EPIPE, ECONNRESET).
    Closed,
    /// Non-blocking read found no data. Only ever raised before the
    /// first header byte of a message.
    WouldBlock,
    /// The peer sent something we refuse to parse. Always closing.
    Malformed(String),
    /// Any other I/O failure.
    Io(io::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Closed => write!(f, "connection closed"),
            WireError::WouldBlock => write!(f, "would block"),
            WireError::Malformed(msg) => write!(f, "malformed message: {msg}"),
            WireError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> WireError {
        match e.kind() {
            io::ErrorKind::WouldBlock => WireError::WouldBlock,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => WireError::Closed,
            _ => WireError::Io(e),
        }
    }
}

/// The centralized encoding function that should be used for all
/// control payload serialization.
pub fn encode_to<T, W>(d: &T, w: W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    // msgpack in struct-map mode has a notion of an object, so decoders
    // skip fields they don't know about instead of mangling the stream.
    let mut serializer = rmp_serde::Serializer::new(w).with_struct_map();
    d.serialize(&mut serializer).context("serializing data")?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// control payload deserialization.
pub fn decode_from<T, R>(r: R) -> anyhow::Result<T>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let mut deserializer = rmp_serde::Deserializer::new(r);
    let d: T = Deserialize::deserialize(&mut deserializer).context("deserializing from reader")?;
    Ok(d)
}

fn to_vec<T: Serialize>(d: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![];
    encode_to(d, &mut buf)?;
    Ok(buf)
}

/// Serialize one message's payload. Unit messages have an empty payload.
pub fn encode_payload(msg: &CtlMessage) -> anyhow::Result<Vec<u8>> {
    use CtlMessage as M;
    Ok(match msg {
        M::Register(d) => to_vec(d)?,
        M::SyncState(d) => to_vec(d)?,
        M::CreatePane(d) => to_vec(d)?,
        M::FindSticky(d) => to_vec(d)?,
        M::AdoptPane(d) => to_vec(d)?,
        M::OrphanPane(d) => to_vec(d)?,
        M::KillPane(d) => to_vec(d)?,
        M::SetSticky(d) => to_vec(d)?,
        M::UpdatePaneAux(d) => to_vec(d)?,
        M::UpdatePaneShell(d) => to_vec(d)?,
        M::GetPaneCwd(d) => to_vec(d)?,
        M::GetPaneInfo(d) => to_vec(d)?,
        M::DetachSession(d) => to_vec(d)?,
        M::Reattach(d) => to_vec(d)?,
        M::ListSessions => vec![],
        M::ListOrphaned => vec![],
        M::Status(d) => to_vec(d)?,
        M::Notify(d) => to_vec(d)?,
        M::SendKeys(d) => to_vec(d)?,
        M::PopConfirm(d) => to_vec(d)?,
        M::PopChoose(d) => to_vec(d)?,
        M::PopResponse(d) => to_vec(d)?,
        M::FocusMove(d) => to_vec(d)?,
        M::ExitIntent(d) => to_vec(d)?,
        M::ExitIntentResponse(d) => to_vec(d)?,
        M::FloatRequest(d) => to_vec(d)?,
        M::FloatAck(d) => to_vec(d)?,
        M::Ok => vec![],
        M::Error(d) => to_vec(d)?,
        M::Registered(d) => to_vec(d)?,
        M::PaneCreated(d) => to_vec(d)?,
        M::PaneFound(d) => to_vec(d)?,
        M::PaneNotFound => vec![],
        M::PaneCwd(d) => to_vec(d)?,
        M::PaneInfo(d) => to_vec(d)?,
        M::SessionReattached(d) => to_vec(d)?,
        M::SessionsList(d) => to_vec(d)?,
        M::OrphanedPanes(d) => to_vec(d)?,
        M::StatusReply(d) => to_vec(d)?,
        M::PopReply(d) => to_vec(d)?,
        M::ExitIntentReply(d) => to_vec(d)?,
        M::FloatCreated(d) => to_vec(d)?,
        M::FloatResult(d) => to_vec(d)?,
        M::PaneExited(d) => to_vec(d)?,
        M::NotifyEvent(d) => to_vec(d)?,
        M::ShellEvent(d) => to_vec(d)?,
        M::PopConfirmEvent(d) => to_vec(d)?,
        M::PopChooseEvent(d) => to_vec(d)?,
        M::ExitIntentEvent(d) => to_vec(d)?,
        M::FocusMoveEvent(d) => to_vec(d)?,
        M::FloatOpenEvent(d) => to_vec(d)?,
        M::PodCwd(d) => to_vec(d)?,
        M::PodForeground(d) => to_vec(d)?,
        M::PodBell(d) => to_vec(d)?,
        M::PodShell(d) => to_vec(d)?,
        M::PodExited(d) => to_vec(d)?,
    })
}

fn from_slice<T>(payload: &[u8]) -> Result<T, WireError>
where
    for<'de> T: Deserialize<'de>,
{
    decode_from(payload).map_err(|e| WireError::Malformed(format!("{e:#}")))
}

/// Decoding is a single match over the closed tag set.
pub fn decode_payload(msg_type: MsgType, payload: &[u8]) -> Result<CtlMessage, WireError> {
    use CtlMessage as M;
    Ok(match msg_type {
        MsgType::Register => M::Register(from_slice(payload)?),
        MsgType::SyncState => M::SyncState(from_slice(payload)?),
        MsgType::CreatePane => M::CreatePane(from_slice(payload)?),
        MsgType::FindSticky => M::FindSticky(from_slice(payload)?),
        MsgType::AdoptPane => M::AdoptPane(from_slice(payload)?),
        MsgType::OrphanPane => M::OrphanPane(from_slice(payload)?),
        MsgType::KillPane => M::KillPane(from_slice(payload)?),
        MsgType::SetSticky => M::SetSticky(from_slice(payload)?),
        MsgType::UpdatePaneAux => M::UpdatePaneAux(from_slice(payload)?),
        MsgType::UpdatePaneShell => M::UpdatePaneShell(from_slice(payload)?),
        MsgType::GetPaneCwd => M::GetPaneCwd(from_slice(payload)?),
        MsgType::GetPaneInfo => M::GetPaneInfo(from_slice(payload)?),
        MsgType::DetachSession => M::DetachSession(from_slice(payload)?),
        MsgType::Reattach => M::Reattach(from_slice(payload)?),
        MsgType::ListSessions => M::ListSessions,
        MsgType::ListOrphaned => M::ListOrphaned,
        MsgType::Status => M::Status(from_slice(payload)?),
        MsgType::Notify => M::Notify(from_slice(payload)?),
        MsgType::SendKeys => M::SendKeys(from_slice(payload)?),
        MsgType::PopConfirm => M::PopConfirm(from_slice(payload)?),
        MsgType::PopChoose => M::PopChoose(from_slice(payload)?),
        MsgType::PopResponse => M::PopResponse(from_slice(payload)?),
        MsgType::FocusMove => M::FocusMove(from_slice(payload)?),
        MsgType::ExitIntent => M::ExitIntent(from_slice(payload)?),
        MsgType::ExitIntentResponse => M::ExitIntentResponse(from_slice(payload)?),
        MsgType::FloatRequest => M::FloatRequest(from_slice(payload)?),
        MsgType::FloatAck => M::FloatAck(from_slice(payload)?),
        MsgType::Ok => M::Ok,
        MsgType::Error => M::Error(from_slice(payload)?),
        MsgType::Registered => M::Registered(from_slice(payload)?),
        MsgType::PaneCreated => M::PaneCreated(from_slice(payload)?),
        MsgType::PaneFound => M::PaneFound(from_slice(payload)?),
        MsgType::PaneNotFound => M::PaneNotFound,
        MsgType::PaneCwd => M::PaneCwd(from_slice(payload)?),
        MsgType::PaneInfo => M::PaneInfo(from_slice(payload)?),
        MsgType::SessionReattached => M::SessionReattached(from_slice(payload)?),
        MsgType::SessionsList => M::SessionsList(from_slice(payload)?),
        MsgType::OrphanedPanes => M::OrphanedPanes(from_slice(payload)?),
        MsgType::StatusReply => M::StatusReply(from_slice(payload)?),
        MsgType::PopReply => M::PopReply(from_slice(payload)?),
        MsgType::ExitIntentReply => M::ExitIntentReply(from_slice(payload)?),
        MsgType::FloatCreated => M::FloatCreated(from_slice(payload)?),
        MsgType::FloatResult => M::FloatResult(from_slice(payload)?),
        MsgType::PaneExited => M::PaneExited(from_slice(payload)?),
        MsgType::NotifyEvent => M::NotifyEvent(from_slice(payload)?),
        MsgType::ShellEvent => M::ShellEvent(from_slice(payload)?),
        MsgType::PopConfirmEvent => M::PopConfirmEvent(from_slice(payload)?),
        MsgType::PopChooseEvent => M::PopChooseEvent(from_slice(payload)?),
        MsgType::ExitIntentEvent => M::ExitIntentEvent(from_slice(payload)?),
        MsgType::FocusMoveEvent => M::FocusMoveEvent(from_slice(payload)?),
        MsgType::FloatOpenEvent => M::FloatOpenEvent(from_slice(payload)?),
        MsgType::PodCwd => M::PodCwd(from_slice(payload)?),
        MsgType::PodForeground => M::PodForeground(from_slice(payload)?),
        MsgType::PodBell => M::PodBell(from_slice(payload)?),
        MsgType::PodShell => M::PodShell(from_slice(payload)?),
        MsgType::PodExited => M::PodExited(from_slice(payload)?),
    })
}

/// Serialize one message to its full wire form: header then payload.
pub fn encode_msg(msg: &CtlMessage) -> Result<Vec<u8>, WireError> {
    let payload = encode_payload(msg).map_err(|e| WireError::Malformed(format!("{e:#}")))?;
    if payload.len() > MAX_CTL_PAYLOAD {
        return Err(WireError::Malformed(format!("payload of {} bytes", payload.len())));
    }
    let mut buf = Vec::with_capacity(CTL_HEADER_LEN + payload.len());
    buf.write_u16::<LittleEndian>(msg.msg_type() as u16)?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Write one message: header then payload, one flush.
pub fn write_msg<W: Write>(w: &mut W, msg: &CtlMessage) -> Result<(), WireError> {
    let buf = encode_msg(msg)?;
    w.write_all(&buf)?;
    w.flush()?;
    trace!("wrote {:?} ({} bytes)", msg.msg_type(), buf.len());
    Ok(())
}

/// `write_all` against a non-blocking fd, spinning through short
/// writes so a message is never left half-sent.
pub fn write_all_spinning<W: Write>(w: &mut W, buf: &[u8]) -> Result<(), WireError> {
    let mut sent = 0;
    while sent < buf.len() {
        match w.write(&buf[sent..]) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(SPIN_SLEEP),
            Err(e) => return Err(WireError::from(e)),
        }
    }
    Ok(())
}

fn parse_header(header: &[u8; CTL_HEADER_LEN]) -> Result<(MsgType, usize), WireError> {
    let mut r = io::Cursor::new(header);
    let raw_type = r.read_u16::<LittleEndian>()?;
    let len = r.read_u32::<LittleEndian>()? as usize;
    let msg_type =
        MsgType::try_from(raw_type).map_err(|e| WireError::Malformed(format!("{e:#}")))?;
    if len > MAX_CTL_PAYLOAD {
        return Err(WireError::Malformed(format!("{} byte payload declared", len)));
    }
    Ok((msg_type, len))
}

fn read_exact_blocking<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::from(e)),
        }
    }
    Ok(())
}

/// Blocking read of one complete message.
pub fn read_msg<R: Read>(r: &mut R) -> Result<CtlMessage, WireError> {
    let mut header = [0u8; CTL_HEADER_LEN];
    read_exact_blocking(r, &mut header)?;
    let (msg_type, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    read_exact_blocking(r, &mut payload)?;
    decode_payload(msg_type, &payload)
}

/// Spin-read the rest of a message whose first bytes have arrived on a
/// non-blocking fd. Control messages are small and peers are trusted,
/// so the spin is bounded in practice.
fn read_exact_spinning<R: Read>(r: &mut R, buf: &mut [u8], mut filled: usize) -> Result<(), WireError> {
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(SPIN_SLEEP),
            Err(e) => return Err(WireError::from(e)),
        }
    }
    Ok(())
}

/// Spin-read an exact buffer from a non-blocking fd. Used for the
/// short fixed-size handshake tails (the pod uplink's raw id bytes).
pub fn read_exact_spin<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    read_exact_spinning(r, buf, 0)
}

/// Non-blocking read of one message. Returns `WouldBlock` only when no
/// header byte is available at all; once a message has started to
/// arrive it is read to completion.
pub fn read_msg_nonblocking<R: Read>(r: &mut R) -> Result<CtlMessage, WireError> {
    let mut header = [0u8; CTL_HEADER_LEN];
    let first = match r.read(&mut header[..1]) {
        Ok(0) => return Err(WireError::Closed),
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(WireError::WouldBlock),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(WireError::WouldBlock),
        Err(e) => return Err(WireError::from(e)),
    };
    read_exact_spinning(r, &mut header, first)?;
    let (msg_type, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    read_exact_spinning(r, &mut payload, 0)?;
    decode_payload(msg_type, &payload)
}

/// Read one handshake byte without blocking.
pub fn read_handshake_byte<R: Read>(r: &mut R) -> Result<u8, WireError> {
    let mut b = [0u8; 1];
    match r.read(&mut b) {
        Ok(0) => Err(WireError::Closed),
        Ok(_) => Ok(b[0]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(WireError::WouldBlock),
        Err(e) => Err(WireError::from(e)),
    }
}

/// Send a data payload with at most one fd attached via SCM_RIGHTS.
pub fn send_with_fd(sock: RawFd, data: &[u8], fd: Option<RawFd>) -> anyhow::Result<usize> {
    let iov = [IoSlice::new(data)];
    let fd_arr;
    let cmsgs: Vec<ControlMessage> = match fd {
        Some(f) => {
            fd_arr = [f];
            vec![ControlMessage::ScmRights(&fd_arr)]
        }
        None => vec![],
    };
    let n = socket::sendmsg::<UnixAddr>(sock, &iov, &cmsgs, MsgFlags::empty(), None)
        .context("sendmsg with fd")?;
    Ok(n)
}

/// Receive a data payload, plus the fd if the peer attached one.
pub fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> anyhow::Result<(usize, Option<RawFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = socket::recvmsg::<UnixAddr>(sock, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .context("recvmsg with fd")?;
    let mut fd = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fd = received.first().copied();
        }
    }
    Ok((msg.bytes, fd))
}

/// A control channel to a daemon, opened with the kind-selecting
/// handshake byte.
pub struct Channel {
    pub stream: UnixStream,
}

impl Channel {
    pub fn connect<P: AsRef<Path>>(sock: P, handshake: u8) -> anyhow::Result<Channel> {
        let mut stream = UnixStream::connect(&sock)
            .context(format!("connecting to {:?}", sock.as_ref()))?;
        stream.write_all(&[handshake]).context("writing handshake byte")?;
        Ok(Channel { stream })
    }

    pub fn send(&mut self, msg: &CtlMessage) -> Result<(), WireError> {
        write_msg(&mut self.stream, msg)
    }

    pub fn recv(&mut self) -> Result<CtlMessage, WireError> {
        read_msg(&mut self.stream)
    }

    /// One request, one reply. `Error` replies become errors.
    pub fn roundtrip(&mut self, msg: &CtlMessage) -> anyhow::Result<CtlMessage> {
        self.send(msg).context("sending request")?;
        let reply = self.recv().context("reading reply")?;
        if let CtlMessage::Error(e) = reply {
            return Err(anyhow::anyhow!("{}", e.msg));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use hexe_protocol::{CreatePane, ErrorReply, Register, SendKeys, Uid};

    use super::*;

    fn round_trip(msg: CtlMessage) -> CtlMessage {
        let mut buf = vec![];
        write_msg(&mut buf, &msg).expect("write to succeed");
        let mut cursor = io::Cursor::new(buf);
        read_msg(&mut cursor).expect("read to succeed")
    }

    #[test]
    fn messages_round_trip() {
        let cases = vec![
            CtlMessage::Register(Register {
                session_id: Uid::generate(),
                keepalive: true,
                name: String::from("snorlax"),
            }),
            CtlMessage::CreatePane(CreatePane {
                shell: String::from("/bin/sh"),
                cwd: String::from("/tmp"),
                sticky_key: Some('1'),
                sticky_pwd: Some(String::from("/tmp")),
                isolate: false,
                env: vec![(String::from("FOO"), String::from("bar"))],
            }),
            CtlMessage::SendKeys(SendKeys { target: None, data: vec![0x1b, b'[', b'A'] }),
            CtlMessage::ListSessions,
            CtlMessage::Ok,
            CtlMessage::PaneNotFound,
            CtlMessage::Error(ErrorReply { msg: String::from("nope") }),
        ];
        for msg in cases {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn header_is_little_endian() {
        let mut buf = vec![];
        write_msg(&mut buf, &CtlMessage::ListSessions).expect("write to succeed");
        // ListSessions = 15, empty payload
        assert_eq!(&buf, &[15, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn short_read_is_closed() {
        let mut cursor = io::Cursor::new(vec![15u8, 0, 0, 0]);
        assert!(matches!(read_msg(&mut cursor), Err(WireError::Closed)));
    }

    #[test]
    fn oversize_payload_is_malformed() {
        let mut buf = vec![];
        buf.write_u16::<LittleEndian>(15).unwrap();
        buf.write_u32::<LittleEndian>((MAX_CTL_PAYLOAD + 1) as u32).unwrap();
        let mut cursor = io::Cursor::new(buf);
        assert!(matches!(read_msg(&mut cursor), Err(WireError::Malformed(_))));
    }

    #[test]
    fn unknown_msg_type_is_malformed() {
        let mut buf = vec![];
        buf.write_u16::<LittleEndian>(999).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        let mut cursor = io::Cursor::new(buf);
        assert!(matches!(read_msg(&mut cursor), Err(WireError::Malformed(_))));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let mut buf = vec![];
        buf.write_u16::<LittleEndian>(MsgType::Register as u16).unwrap();
        buf.write_u32::<LittleEndian>(3).unwrap();
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        let mut cursor = io::Cursor::new(buf);
        assert!(matches!(read_msg(&mut cursor), Err(WireError::Malformed(_))));
    }

    #[test]
    fn fd_passing_over_a_socketpair() {
        use std::{
            io::{Seek as _, SeekFrom},
            os::unix::{io::AsRawFd, net::UnixStream},
        };

        let (left, right) = UnixStream::pair().expect("socketpair");

        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"through the wall").expect("write");
        file.seek(SeekFrom::Start(0)).expect("seek");

        let sent = send_with_fd(left.as_raw_fd(), b"here", Some(file.as_raw_fd()))
            .expect("send with fd");
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (n, fd) = recv_with_fd(right.as_raw_fd(), &mut buf).expect("recv with fd");
        assert_eq!(&buf[..n], b"here");
        let fd = fd.expect("an fd should have come along");

        // the received fd is a real handle onto the same file
        let mut received = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        let mut contents = String::new();
        received.read_to_string(&mut contents).expect("read received fd");
        assert_eq!(contents, "through the wall");
    }

    #[test]
    fn plain_data_passes_no_fd() {
        use std::os::unix::{io::AsRawFd, net::UnixStream};

        let (left, right) = UnixStream::pair().expect("socketpair");
        send_with_fd(left.as_raw_fd(), b"alone", None).expect("send without fd");
        let mut buf = [0u8; 16];
        let (n, fd) = recv_with_fd(right.as_raw_fd(), &mut buf).expect("recv");
        assert_eq!(&buf[..n], b"alone");
        assert!(fd.is_none());
    }

    #[test]
    fn uid_survives_the_wire() {
        let uid = Uid::from_str("00112233445566778899aabbccddeeff").unwrap();
        let msg = CtlMessage::AdoptPane(hexe_protocol::PaneRef { pane: uid });
        match round_trip(msg) {
            CtlMessage::AdoptPane(r) => assert_eq!(r.pane, uid),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
