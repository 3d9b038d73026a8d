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

//! The ses daemon: one poll loop over the listener and every live
//! channel. Owns the registry, spawns pods, routes popups and
//! notifications, and persists state on a one second cadence.
//!
//! A request error never kills the daemon; it becomes an `Error` reply
//! on that channel. A malformed message closes only that channel.

use std::{
    collections::HashMap,
    fs,
    io::{self, Read as _},
    os::unix::{
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    CtlMessage, ErrorReply, ExitIntentEvent, ExitIntentReply, FloatCreated, FloatOpenEvent,
    FloatResult, NotifyEvent, PaneExited, PaneState, PopChooseEvent, PopConfirmEvent, PopOutcome,
    PopReply, SesHandshake, ShellEventMsg, Uid, UpdatePaneShell, FLOAT_WAIT_FOR_EXIT,
};
use nix::{
    poll::{poll, PollFd, PollFlags},
    sys::{
        socket::{self, sockopt},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, Pid},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    consts,
    paths::Layout,
    pod,
    protocol::{self, WireError},
    ses::{
        persist,
        registry::{NewPane, Registry},
    },
    signals,
};

enum ConnKind {
    /// Waiting for the kind byte.
    Handshaking,
    /// A mux control channel. `client_id` is set by `register`.
    MuxCtl { client_id: Option<u64> },
    /// Reserved VT multiplexing channel: drained, never interpreted.
    MuxVt,
    /// A pod event uplink for one pane.
    PodUplink { pane: Uid },
    /// A one-shot CLI channel.
    Cli,
}

struct Conn {
    id: u64,
    stream: UnixStream,
    kind: ConnKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RoutedKind {
    Confirm,
    Choose,
    ExitIntent,
}

/// One popup (or exit intent) in flight, keyed under the mux conn it
/// was forwarded to so a dropped mux is a single lookup.
struct PendingPop {
    request_id: u64,
    cli_conn: u64,
    kind: RoutedKind,
    deadline: Option<Instant>,
}

struct PendingFloat {
    request_id: u64,
    cli_conn: u64,
    mux_conn: u64,
    pane: Option<Uid>,
    wait_for_exit: bool,
    result_path: String,
}

pub struct Server {
    layout: Layout,
    registry: Registry,
    conns: HashMap<u64, Conn>,
    next_conn_id: u64,
    next_request_id: u64,
    pops: HashMap<u64, Vec<PendingPop>>,
    floats: Vec<PendingFloat>,
    orphan_timeout_secs: i64,
    last_tick: Instant,
}

/// Run the registry daemon until a termination signal.
pub fn run(layout: Layout) -> anyhow::Result<()> {
    signals::ignore_sigpipe();

    let sock_path = layout.ses_sock();
    // Dedup: a connectable socket means a live daemon owns this
    // instance. Exit silently rather than clobber it.
    if UnixStream::connect(&sock_path).is_ok() {
        info!("ses daemon already running at {:?}", sock_path);
        return Ok(());
    }

    layout.ensure_runtime_dir()?;
    let _ = fs::remove_file(&sock_path);
    let listener =
        UnixListener::bind(&sock_path).context(format!("binding ses socket {:?}", sock_path))?;
    listener.set_nonblocking(true).context("setting listener non-blocking")?;
    info!("listening at {:?}", sock_path);

    let shutdown = signals::Shutdown::register()?;
    let reap_flag = signals::ChildFlag::register()?;

    let mut server = Server {
        registry: Registry::new(),
        conns: HashMap::new(),
        next_conn_id: 0,
        next_request_id: 0,
        pops: HashMap::new(),
        floats: vec![],
        orphan_timeout_secs: orphan_timeout_secs(),
        last_tick: Instant::now(),
        layout,
    };
    persist::load(&server.layout, &mut server.registry);

    while !shutdown.requested() {
        let mut ids = vec![];
        let mut fds = vec![PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN)];
        for conn in server.conns.values() {
            ids.push(conn.id);
            fds.push(PollFd::new(conn.stream.as_raw_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, server.poll_timeout_ms()) {
            Ok(_) => {}
            // interrupted by a signal; revents are untouched, fall
            // through so shutdown and reaping run promptly
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(e).context("polling ses sockets"),
        }

        if readable(&fds[0]) {
            server.accept_all(&listener);
        }
        let mut closed = vec![];
        for (i, id) in ids.iter().enumerate() {
            if readable(&fds[i + 1]) && !server.drive_conn(*id) {
                closed.push(*id);
            }
        }
        for id in closed {
            server.close_conn(id);
        }

        if reap_flag.take() {
            reap_pods();
        }
        server.tick();
    }

    info!("shutting down");
    server.registry.shutdown();
    if let Err(e) = persist::save(&server.layout, &server.registry) {
        error!("saving state on shutdown: {:?}", e);
    }
    let _ = fs::remove_file(&sock_path);
    Ok(())
}

fn readable(fd: &PollFd) -> bool {
    fd.revents()
        .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
        .unwrap_or(false)
}

/// Pods spawned for create_pane are direct children, so the ses
/// process reaps them to avoid zombies. Their lifecycle is otherwise
/// tracked via the uplink, not the exit status.
fn reap_pods() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => debug!("reaped pod: {:?}", status),
            Err(_) => break,
        }
    }
}

fn orphan_timeout_secs() -> i64 {
    let hours = std::env::var(consts::ENV_ORPHAN_TIMEOUT_HOURS)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(consts::DEFAULT_ORPHAN_TIMEOUT_HOURS);
    (hours * 3600.0) as i64
}

/// check_peer makes sure that a process dialing in on the ses socket
/// has the same UID as the daemon.
fn check_peer(stream: &UnixStream) -> anyhow::Result<()> {
    let creds = socket::getsockopt(stream.as_raw_fd(), sockopt::PeerCredentials)
        .context("could not get peer creds from socket")?;
    let peer_uid = unistd::Uid::from_raw(creds.uid());
    if peer_uid != unistd::Uid::current() {
        return Err(anyhow!("ses prohibits connections across users"));
    }
    Ok(())
}

impl Server {
    fn accept_all(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = check_peer(&stream) {
                        warn!("rejecting connection: {:?}", e);
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("setting conn non-blocking: {}", e);
                        continue;
                    }
                    self.next_conn_id += 1;
                    let id = self.next_conn_id;
                    debug!("accepted conn {}", id);
                    self.conns.insert(id, Conn { id, stream, kind: ConnKind::Handshaking });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accepting stream: {:?}", e);
                    break;
                }
            }
        }
    }

    /// Poll timeout: the regular tick, shortened when a popup deadline
    /// lands sooner.
    fn poll_timeout_ms(&self) -> i32 {
        let mut timeout = consts::TICK_MS as u128;
        let now = Instant::now();
        for pending in self.pops.values().flatten() {
            if let Some(deadline) = pending.deadline {
                let left = deadline.saturating_duration_since(now).as_millis().max(1);
                timeout = timeout.min(left);
            }
        }
        timeout as i32
    }

    /// Service one readable connection. Returns false once the conn
    /// should be dropped.
    fn drive_conn(&mut self, conn_id: u64) -> bool {
        loop {
            let conn = match self.conns.get_mut(&conn_id) {
                Some(c) => c,
                None => return false,
            };
            match conn.kind {
                ConnKind::Handshaking => {
                    let byte = match protocol::read_handshake_byte(&mut conn.stream) {
                        Ok(b) => b,
                        Err(WireError::WouldBlock) => return true,
                        Err(_) => return false,
                    };
                    if !self.handshake(conn_id, byte) {
                        return false;
                    }
                }
                ConnKind::MuxVt => {
                    // reserved channel: drain and ignore
                    let mut sink = [0u8; consts::BUF_SIZE];
                    match conn.stream.read(&mut sink) {
                        Ok(0) => return false,
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                        Err(_) => return false,
                    }
                }
                _ => match protocol::read_msg_nonblocking(&mut conn.stream) {
                    Ok(msg) => self.dispatch(conn_id, msg),
                    Err(WireError::WouldBlock) => return true,
                    Err(WireError::Closed) => return false,
                    Err(e) => {
                        warn!("closing conn {}: {}", conn_id, e);
                        return false;
                    }
                },
            }
        }
    }

    /// The first byte names the channel kind. A pod uplink handshake
    /// is followed by the 16 raw pane id bytes.
    fn handshake(&mut self, conn_id: u64, byte: u8) -> bool {
        let kind = match SesHandshake::try_from(byte) {
            Ok(k) => k,
            Err(e) => {
                warn!("conn {}: {:#}", conn_id, e);
                return false;
            }
        };
        let conn = match self.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return false,
        };
        conn.kind = match kind {
            SesHandshake::MuxCtl => ConnKind::MuxCtl { client_id: None },
            SesHandshake::MuxVt => ConnKind::MuxVt,
            SesHandshake::Cli => ConnKind::Cli,
            SesHandshake::PodUplink => {
                let mut raw = [0u8; 16];
                if protocol::read_exact_spin(&mut conn.stream, &mut raw).is_err() {
                    return false;
                }
                let pane = Uid::from_bytes(raw);
                debug!("conn {} is the uplink for pane {}", conn_id, pane);
                ConnKind::PodUplink { pane }
            }
        };
        true
    }

    fn close_conn(&mut self, conn_id: u64) {
        let conn = match self.conns.remove(&conn_id) {
            Some(c) => c,
            None => return,
        };
        debug!("closing conn {}", conn_id);
        match conn.kind {
            ConnKind::MuxCtl { client_id: Some(client_id) } => {
                self.registry.client_disconnected(client_id);
                self.cancel_mux_pendings(conn_id);
            }
            _ => {
                // drop any popups this CLI was waiting on
                for pendings in self.pops.values_mut() {
                    pendings.retain(|p| p.cli_conn != conn_id);
                }
                self.floats.retain(|f| f.cli_conn != conn_id);
            }
        }
    }

    /// A mux went away: every popup routed to it cancels back to its
    /// CLI, and in-flight float requests fail.
    fn cancel_mux_pendings(&mut self, mux_conn: u64) {
        if let Some(pendings) = self.pops.remove(&mux_conn) {
            for pending in pendings {
                self.reply_cancelled(&pending);
            }
        }
        let stale = drain_matching(&mut self.floats, |f| f.mux_conn == mux_conn);
        for float in stale {
            self.send_to(
                float.cli_conn,
                &CtlMessage::Error(ErrorReply { msg: String::from("mux disconnected") }),
            );
        }
    }

    fn reply_cancelled(&mut self, pending: &PendingPop) {
        let reply = match pending.kind {
            RoutedKind::Confirm | RoutedKind::Choose => {
                CtlMessage::PopReply(PopReply { outcome: PopOutcome::Cancelled })
            }
            RoutedKind::ExitIntent => CtlMessage::ExitIntentReply(ExitIntentReply { allow: false }),
        };
        self.send_to(pending.cli_conn, &reply);
    }

    /// Best-effort message delivery; a send failure closes the conn.
    fn send_to(&mut self, conn_id: u64, msg: &CtlMessage) {
        let bytes = match protocol::encode_msg(msg) {
            Ok(b) => b,
            Err(e) => {
                error!("encoding {:?}: {}", msg.msg_type(), e);
                return;
            }
        };
        let failed = match self.conns.get_mut(&conn_id) {
            Some(conn) => protocol::write_all_spinning(&mut conn.stream, &bytes).is_err(),
            None => false,
        };
        if failed {
            debug!("conn {} went away mid-write", conn_id);
            self.close_conn(conn_id);
        }
    }

    fn client_of(&self, conn_id: u64) -> anyhow::Result<u64> {
        match self.conns.get(&conn_id).map(|c| &c.kind) {
            Some(ConnKind::MuxCtl { client_id: Some(id) }) => Ok(*id),
            Some(ConnKind::MuxCtl { client_id: None }) => {
                Err(anyhow!("register must precede this request"))
            }
            _ => Err(anyhow!("this request needs a mux control channel")),
        }
    }

    /// Find the conn id serving a registered client.
    fn conn_of_client(&self, client_id: u64) -> Option<u64> {
        self.conns.iter().find_map(|(id, conn)| match conn.kind {
            ConnKind::MuxCtl { client_id: Some(c) } if c == client_id => Some(*id),
            _ => None,
        })
    }

    #[instrument(skip_all, fields(conn = conn_id))]
    fn dispatch(&mut self, conn_id: u64, msg: CtlMessage) {
        if let Some(ConnKind::PodUplink { pane }) = self.conns.get(&conn_id).map(|c| &c.kind) {
            let pane = *pane;
            self.dispatch_uplink(pane, msg);
            return;
        }

        let reply = match self.handle_request(conn_id, msg) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("request failed: {:#}", e);
                Some(CtlMessage::Error(ErrorReply { msg: format!("{e:#}") }))
            }
        };
        if let Some(reply) = reply {
            self.send_to(conn_id, &reply);
        }
    }

    /// Handle one mux/cli request. `Ok(None)` means the reply is
    /// deferred (popups, floats). Errors become `Error` replies.
    fn handle_request(
        &mut self,
        conn_id: u64,
        msg: CtlMessage,
    ) -> anyhow::Result<Option<CtlMessage>> {
        use CtlMessage as M;

        let reply = match msg {
            M::Register(req) => {
                let registered = self.registry.register(&req);
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    if let ConnKind::MuxCtl { client_id } = &mut conn.kind {
                        *client_id = Some(registered.client_id);
                    }
                }
                Some(M::Registered(registered))
            }
            M::SyncState(req) => {
                let client_id = self.client_of(conn_id)?;
                self.registry.sync_state(client_id, req.layout)?;
                Some(M::Ok)
            }
            M::CreatePane(req) => {
                let client_id = self.client_of(conn_id)?;
                Some(self.handle_create_pane(client_id, req)?)
            }
            M::FindSticky(req) => Some(match self.registry.find_sticky(&req.pwd, req.key) {
                Some(pane) => M::PaneFound(hexe_protocol::PaneFound {
                    pane: pane.id,
                    state: pane.state,
                    pod_pid: pane.pod_pid,
                    child_pid: pane.child_pid,
                    socket: pane.socket.to_string_lossy().into_owned(),
                }),
                None => M::PaneNotFound,
            }),
            M::AdoptPane(req) => {
                let client_id = self.client_of(conn_id)?;
                let pane = self.registry.adopt_pane(client_id, req.pane)?;
                Some(M::PaneFound(hexe_protocol::PaneFound {
                    pane: pane.id,
                    state: pane.state,
                    pod_pid: pane.pod_pid,
                    child_pid: pane.child_pid,
                    socket: pane.socket.to_string_lossy().into_owned(),
                }))
            }
            M::OrphanPane(req) => {
                self.registry.orphan_pane(req.pane)?;
                Some(M::Ok)
            }
            M::KillPane(req) => {
                self.registry.kill_pane(req.pane)?;
                Some(M::Ok)
            }
            M::SetSticky(req) => {
                self.registry.set_sticky(req.pane, req.key, req.pwd)?;
                Some(M::Ok)
            }
            M::UpdatePaneAux(req) => {
                self.registry.update_aux(&req)?;
                Some(M::Ok)
            }
            M::UpdatePaneShell(req) => {
                self.registry.update_shell(&req)?;
                Some(M::Ok)
            }
            M::GetPaneCwd(req) => {
                let pane = self.registry.pane(req.pane)?;
                Some(M::PaneCwd(hexe_protocol::PaneCwd { cwd: pane.cwd.clone() }))
            }
            M::GetPaneInfo(req) => {
                let pane = self.registry.pane(req.pane)?;
                Some(M::PaneInfo(pane.snapshot()))
            }
            M::DetachSession(req) => {
                let client_id = self.client_of(conn_id)?;
                self.registry.detach_session(client_id, &req)?;
                Some(M::Ok)
            }
            M::Reattach(req) => {
                let session = self.registry.reattach(&req.prefix)?;
                self.registry.mark_dirty();
                Some(M::SessionReattached(hexe_protocol::SessionReattached {
                    layout: session.layout,
                    panes: session.panes,
                    session_name: session.session_name,
                }))
            }
            M::ListSessions => Some(M::SessionsList(hexe_protocol::SessionsList {
                sessions: self.registry.list_sessions(),
            })),
            M::ListOrphaned => Some(M::OrphanedPanes(hexe_protocol::OrphanedPanes {
                panes: self.registry.list_orphaned(),
            })),
            M::Status(req) => Some(M::StatusReply(self.registry.status(&req))),
            M::Notify(req) => Some(self.handle_notify(req)),
            M::SendKeys(req) => Some(self.handle_send_keys(req)),
            M::PopConfirm(req) => self.handle_pop_confirm(conn_id, req),
            M::PopChoose(req) => self.handle_pop_choose(conn_id, req),
            M::PopResponse(req) => {
                self.handle_pop_response(conn_id, req);
                None
            }
            M::FocusMove(req) => Some(match self.registry.route_target(req.pane) {
                Some((client_id, _)) => match self.conn_of_client(client_id) {
                    Some(mux_conn) => {
                        self.send_to(mux_conn, &M::FocusMoveEvent(req));
                        M::Ok
                    }
                    None => M::Error(ErrorReply { msg: String::from("mux not connected") }),
                },
                None => M::Error(ErrorReply { msg: String::from("not found") }),
            }),
            M::ExitIntent(req) => {
                self.handle_exit_intent(conn_id, req.pane);
                None
            }
            M::ExitIntentResponse(req) => {
                self.handle_exit_intent_response(conn_id, req);
                None
            }
            M::FloatRequest(req) => self.handle_float_request(conn_id, req),
            M::FloatAck(req) => {
                self.handle_float_ack(req);
                None
            }
            other => {
                warn!("unexpected {:?} on conn {}", other.msg_type(), conn_id);
                Some(M::Error(ErrorReply { msg: String::from("unexpected message") }))
            }
        };
        Ok(reply)
    }

    fn handle_create_pane(
        &mut self,
        client_id: u64,
        req: hexe_protocol::CreatePane,
    ) -> anyhow::Result<CtlMessage> {
        let shell = if req.shell.is_empty() {
            std::env::var("SHELL").unwrap_or_else(|_| String::from("/bin/sh"))
        } else {
            req.shell.clone()
        };
        let uuid = Uid::generate();
        let opts = pod::SpawnOpts {
            uuid,
            name: None,
            shell,
            cwd: req.cwd.clone(),
            isolate: req.isolate,
            labels: vec![],
            env: req.env.clone(),
        };
        let spawned = pod::spawn_pod(&self.layout, &opts).context("spawning pod")?;
        let pane = self.registry.add_pane(
            client_id,
            NewPane {
                id: uuid,
                pod_pid: spawned.pod_pid,
                child_pid: spawned.child_pid,
                socket: spawned.socket.clone(),
                cwd: req.cwd,
                sticky_key: req.sticky_key,
                sticky_pwd: req.sticky_pwd,
            },
        )?;
        Ok(CtlMessage::PaneCreated(hexe_protocol::PaneCreated {
            pane: uuid,
            pod_pid: spawned.pod_pid,
            child_pid: spawned.child_pid,
            seq: pane.seq,
            socket: spawned.socket.to_string_lossy().into_owned(),
        }))
    }

    fn handle_notify(&mut self, req: hexe_protocol::Notify) -> CtlMessage {
        match req.target.filter(|t| !t.is_nil()) {
            None => {
                let mux_conns: Vec<u64> = self
                    .conns
                    .values()
                    .filter(|c| matches!(c.kind, ConnKind::MuxCtl { client_id: Some(_) }))
                    .map(|c| c.id)
                    .collect();
                for conn in mux_conns {
                    self.send_to(
                        conn,
                        &CtlMessage::NotifyEvent(NotifyEvent {
                            pane: None,
                            msg: req.msg.clone(),
                            timeout_ms: req.timeout_ms,
                        }),
                    );
                }
                CtlMessage::Ok
            }
            Some(target) => match self.registry.route_target(target) {
                Some((client_id, pane)) => match self.conn_of_client(client_id) {
                    Some(conn) => {
                        self.send_to(
                            conn,
                            &CtlMessage::NotifyEvent(NotifyEvent {
                                pane,
                                msg: req.msg,
                                timeout_ms: req.timeout_ms,
                            }),
                        );
                        CtlMessage::Ok
                    }
                    None => CtlMessage::Error(ErrorReply { msg: String::from("not found") }),
                },
                None => CtlMessage::Error(ErrorReply { msg: String::from("not found") }),
            },
        }
    }

    /// Forward bytes into the pty of one pane (or every attached pane)
    /// by dialing the pod's aux input channel.
    fn handle_send_keys(&mut self, req: hexe_protocol::SendKeys) -> CtlMessage {
        let targets: Vec<Uid> = match req.target.filter(|t| !t.is_nil()) {
            Some(target) => {
                if self.registry.panes.contains_key(&target) {
                    vec![target]
                } else {
                    return CtlMessage::Error(ErrorReply { msg: String::from("not found") });
                }
            }
            None => self
                .registry
                .panes
                .values()
                .filter(|p| p.state == PaneState::Attached)
                .map(|p| p.id)
                .collect(),
        };

        let mut delivered = 0;
        for target in targets.iter() {
            let socket = match self.registry.pane(*target) {
                Ok(pane) => pane.socket.clone(),
                Err(_) => continue,
            };
            match pod::send_input(&socket, &req.data) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("send_keys to {}: {:#}", target, e),
            }
        }
        if delivered == 0 && !targets.is_empty() {
            CtlMessage::Error(ErrorReply { msg: String::from("no pod accepted the input") })
        } else {
            CtlMessage::Ok
        }
    }

    fn route_to_mux(&mut self, target: Uid) -> Option<u64> {
        let (client_id, _) = self.registry.route_target(target)?;
        self.conn_of_client(client_id)
    }

    fn handle_pop_confirm(
        &mut self,
        conn_id: u64,
        req: hexe_protocol::PopConfirm,
    ) -> Option<CtlMessage> {
        let mux_conn = match self.route_to_mux(req.target) {
            Some(c) => c,
            None => return Some(CtlMessage::Error(ErrorReply { msg: String::from("not found") })),
        };
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let deadline = req.timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.pops.entry(mux_conn).or_default().push(PendingPop {
            request_id,
            cli_conn: conn_id,
            kind: RoutedKind::Confirm,
            deadline,
        });
        self.send_to(
            mux_conn,
            &CtlMessage::PopConfirmEvent(PopConfirmEvent {
                request_id,
                target: req.target,
                message: req.message,
                timeout_ms: req.timeout_ms,
            }),
        );
        None
    }

    fn handle_pop_choose(
        &mut self,
        conn_id: u64,
        req: hexe_protocol::PopChoose,
    ) -> Option<CtlMessage> {
        let mux_conn = match self.route_to_mux(req.target) {
            Some(c) => c,
            None => return Some(CtlMessage::Error(ErrorReply { msg: String::from("not found") })),
        };
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let deadline = req.timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.pops.entry(mux_conn).or_default().push(PendingPop {
            request_id,
            cli_conn: conn_id,
            kind: RoutedKind::Choose,
            deadline,
        });
        self.send_to(
            mux_conn,
            &CtlMessage::PopChooseEvent(PopChooseEvent {
                request_id,
                target: req.target,
                title: req.title,
                items: req.items,
            }),
        );
        None
    }

    fn handle_pop_response(&mut self, mux_conn: u64, req: hexe_protocol::PopResponse) {
        let pending = match self.pops.get_mut(&mux_conn) {
            Some(pendings) => match pendings.iter().position(|p| p.request_id == req.request_id) {
                Some(i) => pendings.remove(i),
                // raced with a timeout or a CLI hangup; nothing to do
                None => return,
            },
            None => return,
        };
        let reply = match pending.kind {
            RoutedKind::Confirm | RoutedKind::Choose => {
                CtlMessage::PopReply(PopReply { outcome: req.outcome })
            }
            RoutedKind::ExitIntent => CtlMessage::ExitIntentReply(ExitIntentReply {
                allow: !matches!(req.outcome, PopOutcome::Cancelled),
            }),
        };
        self.send_to(pending.cli_conn, &reply);
    }

    fn handle_exit_intent(&mut self, conn_id: u64, pane: Uid) {
        let mux_conn = match self.route_to_mux(pane) {
            Some(c) => c,
            None => {
                // nobody to ask; let the shell go
                self.send_to(conn_id, &CtlMessage::ExitIntentReply(ExitIntentReply { allow: true }));
                return;
            }
        };
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.pops.entry(mux_conn).or_default().push(PendingPop {
            request_id,
            cli_conn: conn_id,
            kind: RoutedKind::ExitIntent,
            deadline: None,
        });
        self.send_to(mux_conn, &CtlMessage::ExitIntentEvent(ExitIntentEvent { request_id, pane }));
    }

    fn handle_exit_intent_response(
        &mut self,
        mux_conn: u64,
        req: hexe_protocol::ExitIntentResponse,
    ) {
        let pending = match self.pops.get_mut(&mux_conn) {
            Some(pendings) => match pendings.iter().position(|p| p.request_id == req.request_id) {
                Some(i) => pendings.remove(i),
                None => return,
            },
            None => return,
        };
        self.send_to(
            pending.cli_conn,
            &CtlMessage::ExitIntentReply(ExitIntentReply { allow: req.allow }),
        );
    }

    fn handle_float_request(
        &mut self,
        conn_id: u64,
        req: hexe_protocol::FloatRequest,
    ) -> Option<CtlMessage> {
        let mux_conn = if req.target.is_nil() {
            // any connected mux will do
            self.conns
                .values()
                .find(|c| matches!(c.kind, ConnKind::MuxCtl { client_id: Some(_) }))
                .map(|c| c.id)
        } else {
            self.route_to_mux(req.target)
        };
        let mux_conn = match mux_conn {
            Some(c) => c,
            None => {
                return Some(CtlMessage::Error(ErrorReply {
                    msg: String::from("no mux to host the float"),
                }))
            }
        };
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.floats.push(PendingFloat {
            request_id,
            cli_conn: conn_id,
            mux_conn,
            pane: None,
            wait_for_exit: req.flags & FLOAT_WAIT_FOR_EXIT != 0,
            result_path: req.result_path.clone(),
        });
        self.send_to(
            mux_conn,
            &CtlMessage::FloatOpenEvent(FloatOpenEvent {
                request_id,
                flags: req.flags,
                cmd: req.cmd,
                title: req.title,
                cwd: req.cwd,
                result_path: req.result_path,
                env: req.env,
            }),
        );
        None
    }

    fn handle_float_ack(&mut self, req: hexe_protocol::FloatAck) {
        let i = match self.floats.iter().position(|f| f.request_id == req.request_id) {
            Some(i) => i,
            None => return,
        };
        if self.floats[i].wait_for_exit {
            // hold the CLI until the pod reports the exit
            self.floats[i].pane = Some(req.pane);
        } else {
            let float = self.floats.remove(i);
            self.send_to(float.cli_conn, &CtlMessage::FloatCreated(FloatCreated { pane: req.pane }));
        }
    }

    //
    // pod uplink
    //

    fn dispatch_uplink(&mut self, uplink_pane: Uid, msg: CtlMessage) {
        use CtlMessage as M;
        match msg {
            M::PodCwd(report) => {
                self.registry.update_cwd(report.pane, report.cwd);
            }
            M::PodForeground(report) => {
                self.registry.update_foreground(report.pane, report.foreground);
            }
            M::PodBell(report) => {
                if let Some((client_id, pane)) = self.registry.route_target(report.pane) {
                    if let Some(conn) = self.conn_of_client(client_id) {
                        self.send_to(
                            conn,
                            &M::NotifyEvent(NotifyEvent {
                                pane,
                                msg: String::from("bell"),
                                timeout_ms: None,
                            }),
                        );
                    }
                }
            }
            M::PodShell(report) => {
                let _ = self.registry.update_shell(&UpdatePaneShell {
                    pane: report.pane,
                    update: report.update.clone(),
                });
                if let Some((client_id, _)) = self.registry.route_target(report.pane) {
                    if let Some(conn) = self.conn_of_client(client_id) {
                        self.send_to(
                            conn,
                            &M::ShellEvent(ShellEventMsg {
                                pane: report.pane,
                                update: report.update,
                            }),
                        );
                    }
                }
            }
            M::PodExited(report) => {
                info!("pane {} reported exit {}", report.pane, report.status);
                self.resolve_floats_for(report.pane, report.status);
                if let Some(owner) = self.registry.pane_exited(report.pane) {
                    if let Some(conn) = self.conn_of_client(owner) {
                        self.send_to(
                            conn,
                            &M::PaneExited(PaneExited { pane: report.pane, status: report.status }),
                        );
                    }
                }
            }
            other => {
                warn!("unexpected {:?} on uplink for {}", other.msg_type(), uplink_pane);
            }
        }
    }

    fn resolve_floats_for(&mut self, pane: Uid, status: i32) {
        let done =
            drain_matching(&mut self.floats, |f| f.pane == Some(pane) && f.wait_for_exit);
        for float in done {
            let output = if float.result_path.is_empty() {
                String::new()
            } else {
                fs::read_to_string(&float.result_path).unwrap_or_default()
            };
            self.send_to(
                float.cli_conn,
                &CtlMessage::FloatResult(FloatResult { pane, exit_code: status, output }),
            );
        }
    }

    /// Once-a-second work: dirty-state save and orphan GC. Popup
    /// deadlines are sub-second, so they run every pass.
    fn tick(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<PendingPop> = vec![];
        for pendings in self.pops.values_mut() {
            let mut i = 0;
            while i < pendings.len() {
                if pendings[i].deadline.map(|d| d <= now).unwrap_or(false) {
                    expired.push(pendings.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for pending in expired {
            debug!("popup {} timed out", pending.request_id);
            self.reply_cancelled(&pending);
        }

        if self.last_tick.elapsed() < Duration::from_millis(consts::TICK_MS as u64) {
            return;
        }
        self.last_tick = now;

        let killed = self.registry.gc(self.orphan_timeout_secs);
        for pane in killed {
            self.resolve_floats_for(pane, 1);
        }

        if self.registry.take_dirty() {
            if let Err(e) = persist::save(&self.layout, &self.registry) {
                error!("saving state: {:?}", e);
            }
        }
    }
}

fn drain_matching<T, F: Fn(&T) -> bool>(items: &mut Vec<T>, pred: F) -> Vec<T> {
    let mut taken = vec![];
    let mut i = 0;
    while i < items.len() {
        if pred(&items[i]) {
            taken.push(items.remove(i));
        } else {
            i += 1;
        }
    }
    taken
}
