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

//! The pod daemon: sole owner of one pty and its child process.
//!
//! A single poll loop multiplexes the pty master, the pod socket, and
//! every connected channel. VT consumers get the backlog replayed
//! before any live output; aux input goes straight into the pty; shp
//! control frames and /proc observations flow up to ses. The pod
//! outlives both mux and ses crashes; only losing its child ends it.

use std::{
    collections::VecDeque,
    fs,
    io::{self, Read as _, Write as _},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::{UnixListener, UnixStream},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use hexe_protocol::{
    encode_frame_header, CtlMessage, Frame, FrameKind, FrameReader, PodCwd, PodForeground,
    PaneExited, PodBell, PodHandshake, SesHandshake, ShellEventMsg, ShellUpdate, Uid,
};
use nix::{
    poll::{poll, PollFd, PollFlags},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, Pid},
};
use serde_derive::Serialize;
use tracing::{debug, info, warn};

use crate::{
    consts,
    discovery::PodRecord,
    paths::Layout,
    pod::{backlog::Backlog, pty, sandbox},
    protocol, signals,
    tty::Size,
};

pub struct PodArgs {
    pub uuid: Uid,
    pub name: Option<String>,
    pub shell: String,
    pub cwd: String,
    pub isolate: bool,
    pub labels: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// The one-line readiness handshake printed to stdout in foreground
/// mode once the socket listens and the child is forked.
#[derive(Serialize)]
struct ReadyLine<'a> {
    r#type: &'a str,
    uuid: String,
    pid: i32,
    pod_pid: i32,
    socket: String,
}

struct Consumer {
    id: u64,
    stream: UnixStream,
    kind: Option<PodHandshake>,
    reader: FrameReader,
    /// Encoded frames waiting for the socket to accept them. The
    /// front may be partially written.
    queue: VecDeque<Vec<u8>>,
    front_offset: usize,
}

impl Consumer {
    fn wants_write(&self) -> bool {
        !self.queue.is_empty()
    }
}

enum FdTag {
    Listener,
    Master,
    Consumer(u64),
}

struct PodServer {
    layout: Layout,
    uuid: Uid,
    name: Option<String>,
    master: RawFd,
    child: Pid,
    backlog: Backlog,
    consumers: Vec<Consumer>,
    next_consumer_id: u64,
    uplink: Option<UnixStream>,
    last_tick: Instant,
    last_cwd: String,
    last_foreground: (String, i32),
    master_open: bool,
}

/// Run a pod daemon until its child exits or a termination signal
/// arrives.
pub fn run(layout: Layout, args: PodArgs) -> anyhow::Result<()> {
    signals::ignore_sigpipe();
    // detach from the spawning session so a ^C aimed at ses or a mux
    // never reaches us
    let _ = unistd::setsid();

    let shutdown = signals::Shutdown::register()?;
    let reap_flag = signals::ChildFlag::register()?;

    layout.ensure_runtime_dir()?;
    let sock_path = layout.pod_sock(args.uuid);
    if UnixStream::connect(&sock_path).is_ok() {
        return Err(anyhow::anyhow!("pod socket {:?} is already in use", sock_path));
    }
    let _ = fs::remove_file(&sock_path);
    let listener =
        UnixListener::bind(&sock_path).context(format!("binding pod socket {:?}", sock_path))?;
    listener.set_nonblocking(true).context("setting listener non-blocking")?;

    let isolate = args.isolate
        || std::env::var(consts::ENV_ISOLATE).map(|v| v == "1").unwrap_or(false);
    let mut extra_env = vec![
        (String::from(consts::ENV_PANE_UUID), args.uuid.hex()),
        (String::from(consts::ENV_POD_SOCKET), sock_path.to_string_lossy().into_owned()),
    ];
    extra_env.extend(args.env.iter().cloned());
    if isolate {
        extra_env.push((String::from(consts::ENV_ISOLATE), String::from("1")));
    }

    let child = pty::spawn(&pty::SpawnArgs {
        shell: args.shell.clone(),
        cwd: args.cwd.clone(),
        extra_env,
        isolate,
        size: Size { rows: 24, cols: 80 },
    })
    .context("spawning pty child")?;
    let uuid8 = String::from(&args.uuid.hex()[..8]);
    sandbox::apply_cgroup(&uuid8, child.pid.as_raw());

    let record = PodRecord {
        uuid: args.uuid,
        name: args.name.clone().unwrap_or_default(),
        pid: std::process::id() as i32,
        child_pid: child.pid.as_raw(),
        cwd: args.cwd.clone(),
        shell: args.shell.clone(),
        isolated: isolate,
        labels: args.labels.clone(),
        created_at: crate::ses::registry::now_unix(),
    };
    record.write(&layout)?;
    if let Some(name) = &args.name {
        let alias = layout.pod_alias(name);
        let _ = fs::remove_file(&alias);
        if let Some(target) = sock_path.file_name() {
            let _ = std::os::unix::fs::symlink(target, &alias);
        }
    }

    // the readiness handshake: callers block on this line
    let ready = ReadyLine {
        r#type: "pod_ready",
        uuid: args.uuid.hex(),
        pid: child.pid.as_raw(),
        pod_pid: std::process::id() as i32,
        socket: sock_path.to_string_lossy().into_owned(),
    };
    println!("{}", serde_json::to_string(&ready).context("encoding ready line")?);
    let _ = io::stdout().flush();

    let mut server = PodServer {
        uuid: args.uuid,
        name: args.name.clone(),
        master: child.master,
        child: child.pid,
        backlog: Backlog::new(consts::BACKLOG_BYTES),
        consumers: vec![],
        next_consumer_id: 0,
        uplink: None,
        last_tick: Instant::now(),
        last_cwd: args.cwd.clone(),
        last_foreground: (String::new(), 0),
        master_open: true,
        layout,
    };
    server.connect_uplink();

    let mut exit_status: Option<i32> = None;
    while exit_status.is_none() {
        if shutdown.requested() {
            info!("termination signal, tearing down child");
            exit_status = Some(server.terminate_child());
            break;
        }

        let mut tags = vec![FdTag::Listener];
        let mut fds = vec![PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN)];
        if server.master_open {
            tags.push(FdTag::Master);
            fds.push(PollFd::new(server.master, PollFlags::POLLIN));
        }
        for consumer in server.consumers.iter() {
            let mut flags = PollFlags::POLLIN;
            if consumer.wants_write() {
                flags |= PollFlags::POLLOUT;
            }
            tags.push(FdTag::Consumer(consumer.id));
            fds.push(PollFd::new(consumer.stream.as_raw_fd(), flags));
        }

        match poll(&mut fds, consts::TICK_MS) {
            Ok(_) => {}
            // interrupted by SIGCHLD/SIGTERM; revents are untouched,
            // fall through so the reap check runs now
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(e).context("polling pod fds"),
        }

        for (i, tag) in tags.iter().enumerate() {
            let revents = match fds[i].revents() {
                Some(r) => r,
                None => continue,
            };
            match tag {
                FdTag::Listener if revents.contains(PollFlags::POLLIN) => {
                    server.accept_all(&listener);
                }
                FdTag::Master
                    if revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) =>
                {
                    server.drain_master();
                }
                FdTag::Consumer(id) => {
                    let id = *id;
                    if revents.contains(PollFlags::POLLOUT) {
                        server.flush_consumer(id);
                    }
                    if revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    {
                        server.read_consumer(id);
                    }
                }
                _ => {}
            }
        }

        if reap_flag.take() {
            if let Some(status) = server.try_reap() {
                // pick up anything the child wrote on its way out
                server.drain_master();
                exit_status = Some(status);
            }
        }
        server.tick();
    }

    let status = exit_status.unwrap_or(1);
    info!("child exited with status {}", status);
    server.finish(status);
    Ok(())
}

impl PodServer {
    fn accept_all(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    self.next_consumer_id += 1;
                    debug!("accepted consumer {}", self.next_consumer_id);
                    self.consumers.push(Consumer {
                        id: self.next_consumer_id,
                        stream,
                        kind: None,
                        reader: FrameReader::new(),
                        queue: VecDeque::new(),
                        front_offset: 0,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accepting consumer: {}", e);
                    break;
                }
            }
        }
    }

    fn consumer_index(&self, id: u64) -> Option<usize> {
        self.consumers.iter().position(|c| c.id == id)
    }

    fn drop_consumer(&mut self, id: u64) {
        if let Some(i) = self.consumer_index(id) {
            debug!("dropping consumer {}", id);
            self.consumers.remove(i);
        }
    }

    /// Handle readable bytes on one consumer: handshake first, frames
    /// after.
    fn read_consumer(&mut self, id: u64) {
        let i = match self.consumer_index(id) {
            Some(i) => i,
            None => return,
        };

        if self.consumers[i].kind.is_none() {
            let byte = match protocol::read_handshake_byte(&mut self.consumers[i].stream) {
                Ok(b) => b,
                Err(protocol::WireError::WouldBlock) => return,
                Err(_) => {
                    self.drop_consumer(id);
                    return;
                }
            };
            let kind = match PodHandshake::try_from(byte) {
                Ok(k) => k,
                Err(e) => {
                    warn!("consumer {}: {:#}", id, e);
                    self.drop_consumer(id);
                    return;
                }
            };
            self.consumers[i].kind = Some(kind);
            debug!("consumer {} is {:?}", id, kind);
            if kind == PodHandshake::Vt {
                self.replay_backlog(id);
            }
        }

        // frames, possibly many per readable event
        let mut buf = [0u8; consts::BUF_SIZE];
        loop {
            let i = match self.consumer_index(id) {
                Some(i) => i,
                None => return,
            };
            let n = match self.consumers[i].stream.read(&mut buf) {
                Ok(0) => {
                    self.drop_consumer(id);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.drop_consumer(id);
                    return;
                }
            };

            let kind = self.consumers[i].kind;
            // the reader is taken so frame handling can borrow self
            let mut reader = std::mem::take(&mut self.consumers[i].reader);
            let mut inputs: Vec<Vec<u8>> = vec![];
            let mut resizes: Vec<Size> = vec![];
            let mut controls: Vec<Vec<u8>> = vec![];
            reader.feed(&buf[..n], |frame: Frame| match (kind, frame.kind) {
                (Some(PodHandshake::Vt) | Some(PodHandshake::AuxInput), FrameKind::Input) => {
                    inputs.push(frame.data.to_vec());
                }
                (Some(PodHandshake::Vt) | Some(PodHandshake::AuxInput), FrameKind::Resize) => {
                    if let Some(size) = Size::from_frame_payload(frame.data) {
                        resizes.push(size);
                    }
                }
                (Some(PodHandshake::ShellCtl), FrameKind::Control) => {
                    controls.push(frame.data.to_vec());
                }
                _ => {
                    debug!("ignoring {:?} frame from consumer {}", frame.kind, id);
                }
            });
            if let Some(i) = self.consumer_index(id) {
                self.consumers[i].reader = reader;
            }

            for input in inputs {
                self.write_master(&input);
            }
            for size in resizes {
                if let Err(e) = size.set_fd(self.master) {
                    warn!("resizing pty: {:#}", e);
                }
            }
            for control in controls {
                self.handle_shell_ctl(&control);
            }
        }
    }

    /// Input bytes go straight into the pty master. A full pty buffer
    /// gets a bounded retry, then the rest is dropped; the pod must
    /// not hang on a child that stopped reading.
    fn write_master(&mut self, mut data: &[u8]) {
        if !self.master_open {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while !data.is_empty() {
            match unistd::write(self.master, data) {
                Ok(n) => data = &data[n..],
                Err(nix::errno::Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        warn!("pty write stalled, dropping {} input bytes", data.len());
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    debug!("pty write failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Pull everything the pty has for us: into the backlog, out to
    /// every VT consumer.
    fn drain_master(&mut self) {
        if !self.master_open {
            return;
        }
        let mut buf = [0u8; consts::BUF_SIZE];
        loop {
            match unistd::read(self.master, &mut buf) {
                Ok(0) => {
                    self.master_open = false;
                    return;
                }
                Ok(n) => {
                    let chunk = &buf[..n];
                    if chunk.contains(&0x07) {
                        self.uplink_send(&CtlMessage::PodBell(PodBell { pane: self.uuid }));
                    }
                    self.backlog.push(chunk);
                    self.broadcast_output(chunk);
                }
                Err(nix::errno::Errno::EAGAIN) => return,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => {
                    // EIO: the slave side is gone, the child is done
                    self.master_open = false;
                    return;
                }
            }
        }
    }

    /// Queue one live output frame on every VT consumer. Consumers
    /// that cannot keep up are dropped; backlog replay catches them up
    /// if they come back.
    fn broadcast_output(&mut self, chunk: &[u8]) {
        let mut slow = vec![];
        let header = encode_frame_header(FrameKind::Output, chunk.len());
        for consumer in self.consumers.iter_mut() {
            if consumer.kind != Some(PodHandshake::Vt) {
                continue;
            }
            let mut frame = Vec::with_capacity(header.len() + chunk.len());
            frame.extend_from_slice(&header);
            frame.extend_from_slice(chunk);
            consumer.queue.push_back(frame);
            if consumer.queue.len() > consts::CONSUMER_QUEUE_MAX {
                slow.push(consumer.id);
            }
        }
        for id in slow {
            warn!("consumer {} fell too far behind, dropping", id);
            self.drop_consumer(id);
        }
        let ids: Vec<u64> = self
            .consumers
            .iter()
            .filter(|c| c.kind == Some(PodHandshake::Vt) && c.wants_write())
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.flush_consumer(id);
        }
    }

    /// The attach contract: the entire backlog, chunked, then one
    /// backlog_end, all queued before any future live output.
    fn replay_backlog(&mut self, id: u64) {
        let mut frames: Vec<Vec<u8>> = vec![];
        let (a, b) = self.backlog.as_slices();
        for chunk in a.chunks(consts::REPLAY_CHUNK).chain(b.chunks(consts::REPLAY_CHUNK)) {
            let mut frame =
                Vec::with_capacity(hexe_protocol::FRAME_HEADER_LEN + chunk.len());
            frame.extend_from_slice(&encode_frame_header(FrameKind::Output, chunk.len()));
            frame.extend_from_slice(chunk);
            frames.push(frame);
        }
        frames.push(encode_frame_header(FrameKind::BacklogEnd, 0).to_vec());

        if let Some(i) = self.consumer_index(id) {
            info!("replaying {} backlog bytes to consumer {}", self.backlog.len(), id);
            for frame in frames {
                self.consumers[i].queue.push_back(frame);
            }
        }
        self.flush_consumer(id);
    }

    /// Write queued frames until the socket pushes back.
    fn flush_consumer(&mut self, id: u64) {
        let i = match self.consumer_index(id) {
            Some(i) => i,
            None => return,
        };
        let consumer = &mut self.consumers[i];
        let mut dead = false;
        while let Some(front) = consumer.queue.front() {
            match consumer.stream.write(&front[consumer.front_offset..]) {
                Ok(0) => {
                    dead = true;
                    break;
                }
                Ok(n) => {
                    consumer.front_offset += n;
                    if consumer.front_offset >= front.len() {
                        consumer.queue.pop_front();
                        consumer.front_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    dead = true;
                    break;
                }
            }
        }
        if dead {
            self.drop_consumer(id);
        }
    }

    /// shp control frames are JSON shell lifecycle events; parse and
    /// forward, never interpret.
    fn handle_shell_ctl(&mut self, data: &[u8]) {
        let update: ShellUpdate = match serde_json::from_slice(data) {
            Ok(u) => u,
            Err(e) => {
                warn!("mangled shell event: {}", e);
                return;
            }
        };
        if !update.cwd.is_empty() {
            self.last_cwd = update.cwd.clone();
        }
        self.uplink_send(&CtlMessage::PodShell(ShellEventMsg { pane: self.uuid, update }));
    }

    //
    // uplink
    //

    fn connect_uplink(&mut self) {
        if self.uplink.is_some() {
            return;
        }
        let mut stream = match UnixStream::connect(self.layout.ses_sock()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let handshake = [SesHandshake::PodUplink as u8];
        if stream.write_all(&handshake).is_err()
            || stream.write_all(self.uuid.as_bytes()).is_err()
        {
            return;
        }
        info!("uplink to ses established");
        self.uplink = Some(stream);
    }

    /// Report upward, shrugging off a dead ses. The pod keeps running
    /// and retries the uplink on the timer tick.
    fn uplink_send(&mut self, msg: &CtlMessage) {
        let stream = match self.uplink.as_mut() {
            Some(s) => s,
            None => return,
        };
        if protocol::write_msg(stream, msg).is_err() {
            debug!("uplink lost");
            self.uplink = None;
        }
    }

    //
    // child lifecycle
    //

    fn try_reap(&mut self) -> Option<i32> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            Ok(_) => None,
            Err(_) => None,
        }
    }

    /// SIGHUP first (the graceful signal for shells), SIGKILL if the
    /// child ignores it.
    fn terminate_child(&mut self) -> i32 {
        let _ = kill(self.child, Signal::SIGHUP);
        let deadline = Instant::now() + consts::CHILD_KILL_TIMEOUT;
        loop {
            if let Some(status) = self.try_reap() {
                return status;
            }
            if Instant::now() >= deadline {
                info!("child ignored SIGHUP, no longer being polite");
                let _ = kill(self.child, Signal::SIGKILL);
                return match waitpid(self.child, None) {
                    Ok(WaitStatus::Exited(_, code)) => code,
                    Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                    _ => 1,
                };
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Periodic /proc observation: cwd and foreground process, pushed
    /// up only on change.
    fn tick(&mut self) {
        if self.last_tick.elapsed() < Duration::from_millis(consts::TICK_MS as u64) {
            return;
        }
        self.last_tick = Instant::now();
        self.connect_uplink();

        let child = self.child.as_raw();
        if let Ok(cwd) = fs::read_link(format!("/proc/{child}/cwd")) {
            let cwd = cwd.to_string_lossy().into_owned();
            if cwd != self.last_cwd {
                self.last_cwd = cwd.clone();
                self.uplink_send(&CtlMessage::PodCwd(PodCwd { pane: self.uuid, cwd }));
            }
        }

        // Safety: basic ffi; the master fd is owned by this process.
        let fg_pid = unsafe { libc::tcgetpgrp(self.master) };
        if fg_pid > 0 {
            let name = fs::read_to_string(format!("/proc/{fg_pid}/comm"))
                .map(|s| s.trim_end().to_string())
                .unwrap_or_default();
            if (name.clone(), fg_pid) != self.last_foreground {
                self.last_foreground = (name.clone(), fg_pid);
                self.uplink_send(&CtlMessage::PodForeground(PodForeground {
                    pane: self.uuid,
                    foreground: hexe_protocol::Foreground { name, pid: fg_pid },
                }));
            }
        }
    }

    /// Final teardown: tell ses and every consumer, then scrub the
    /// runtime dir.
    fn finish(&mut self, status: i32) {
        self.uplink_send(&CtlMessage::PodExited(PaneExited { pane: self.uuid, status }));

        let exit_note = format!("{{\"type\":\"exited\",\"status\":{status}}}");
        let ids: Vec<u64> = self
            .consumers
            .iter()
            .filter(|c| c.kind == Some(PodHandshake::Vt))
            .map(|c| c.id)
            .collect();
        for id in ids {
            if let Some(i) = self.consumer_index(id) {
                let mut frame = encode_frame_header(FrameKind::Control, exit_note.len()).to_vec();
                frame.extend_from_slice(exit_note.as_bytes());
                self.consumers[i].queue.push_back(frame);
            }
            self.flush_consumer(id);
        }
        self.consumers.clear();

        let _ = fs::remove_file(self.layout.pod_meta(self.uuid));
        let _ = fs::remove_file(self.layout.pod_sock(self.uuid));
        if let Some(name) = &self.name {
            let _ = fs::remove_file(self.layout.pod_alias(name));
        }
        sandbox::cleanup_cgroup(&self.uuid.hex()[..8]);
        let _ = unistd::close(self.master);
    }
}
