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

//! The authoritative pane/client/session tables and the pane state
//! machine. Everything here is pure bookkeeping; socket traffic and
//! pod spawning live in `server`.
//!
//! The allowed transitions:
//!
//! ```text
//!        create_pane
//! ()  ───────────────▶ Attached
//! Attached  ──orphan──▶ Orphaned (or Sticky when sticky fields set)
//! Attached  ──detach / keepalive disconnect──▶ Detached
//! Orphaned | Sticky | Detached ──adopt──▶ Attached
//! any ──kill──▶ gone
//! ```
//!
//! Anything else is rejected without mutating state.

use std::{
    collections::HashMap,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use hexe_protocol::{
    ClientStatus, Cursor, DetachSession, Foreground, PaneKind, PaneSnapshot, PaneState, Register,
    Registered, SessionSummary, ShellUpdate, StatusReply, StatusRequest, Uid, UpdatePaneAux,
    UpdatePaneShell,
};
use nix::{sys::signal, unistd::Pid};
use tracing::{info, warn};

use crate::names;

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// One pane record. The registry owns these; pods own the actual ptys.
#[derive(Debug, Clone)]
pub struct Pane {
    pub id: Uid,
    pub pod_pid: i32,
    pub child_pid: i32,
    pub socket: PathBuf,
    pub state: PaneState,
    pub name: String,
    pub kind: PaneKind,
    pub is_focused: bool,
    pub created_from: Uid,
    pub focused_from: Uid,
    pub cwd: String,
    pub foreground: Option<Foreground>,
    pub cursor: Cursor,
    pub alt_screen: bool,
    pub last_shell: Option<ShellUpdate>,
    pub sticky_key: Option<char>,
    pub sticky_pwd: Option<String>,
    pub attached_to: Option<u64>,
    pub session_id: Option<Uid>,
    pub seq: u16,
    pub created_at: i64,
    pub orphaned_at: Option<i64>,
}

impl Pane {
    pub fn snapshot(&self) -> PaneSnapshot {
        PaneSnapshot {
            pane: self.id,
            state: self.state,
            name: self.name.clone(),
            kind: self.kind,
            pod_pid: self.pod_pid,
            child_pid: self.child_pid,
            socket: self.socket.to_string_lossy().into_owned(),
            session_id: self.session_id,
            cwd: self.cwd.clone(),
            foreground: self.foreground.clone(),
            cursor: self.cursor,
            alt_screen: self.alt_screen,
            last_shell: self.last_shell.clone(),
            sticky_key: self.sticky_key,
            sticky_pwd: self.sticky_pwd.clone(),
            is_focused: self.is_focused,
            created_from: self.created_from,
            focused_from: self.focused_from,
            created_at_unix: self.created_at,
            orphaned_at_unix: self.orphaned_at,
            seq: self.seq,
        }
    }

    fn has_sticky_fields(&self) -> bool {
        self.sticky_key.is_some() && self.sticky_pwd.is_some()
    }
}

/// One connected mux control channel.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: u64,
    pub session_id: Uid,
    pub session_name: String,
    pub keepalive: bool,
    pub panes: Vec<Uid>,
    pub layout: String,
}

/// A snapshot of a disconnected mux, enabling later reattach.
#[derive(Debug, Clone)]
pub struct DetachedSession {
    pub session_id: Uid,
    pub session_name: String,
    pub layout: String,
    pub panes: Vec<Uid>,
    pub detached_at: i64,
}

impl DetachedSession {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            session_name: self.session_name.clone(),
            pane_count: self.panes.len() as u32,
            detached_at_unix: self.detached_at,
        }
    }
}

#[derive(Default)]
pub struct Registry {
    pub panes: HashMap<Uid, Pane>,
    pub clients: HashMap<u64, Client>,
    pub detached: HashMap<Uid, DetachedSession>,
    next_client_id: u64,
    next_seq: u16,
    dirty: bool,
}

/// Arguments for inserting a freshly spawned pane.
pub struct NewPane {
    pub id: Uid,
    pub pod_pid: i32,
    pub child_pid: i32,
    pub socket: PathBuf,
    pub cwd: String,
    pub sticky_key: Option<char>,
    pub sticky_pwd: Option<String>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Seed the tables from persisted state. Panes recorded as
    /// attached have lost their client across the restart, so they are
    /// normalised into sticky/orphaned.
    pub fn restore(&mut self, panes: Vec<Pane>, detached: Vec<DetachedSession>) {
        for mut pane in panes {
            if pane.state == PaneState::Attached {
                pane.attached_to = None;
                pane.state = if pane.has_sticky_fields() {
                    PaneState::Sticky
                } else {
                    PaneState::Orphaned
                };
                pane.orphaned_at = Some(now_unix());
            }
            self.next_seq = self.next_seq.max(pane.seq.wrapping_add(1));
            self.panes.insert(pane.id, pane);
        }
        for session in detached {
            self.detached.insert(session.session_id, session);
        }
    }

    //
    // client lifecycle
    //

    pub fn register(&mut self, req: &Register) -> Registered {
        self.next_client_id += 1;
        let id = self.next_client_id;

        let session_id = if req.session_id.is_nil() { Uid::generate() } else { req.session_id };
        let session_name = if req.name.is_empty() {
            names::session_name(session_id)
        } else {
            req.name.clone()
        };

        self.clients.insert(
            id,
            Client {
                id,
                session_id,
                session_name: session_name.clone(),
                keepalive: req.keepalive,
                panes: vec![],
                layout: String::new(),
            },
        );
        info!("registered client {} session {} ({})", id, session_id, session_name);
        Registered { session_id, session_name, client_id: id }
    }

    pub fn sync_state(&mut self, client_id: u64, layout: String) -> anyhow::Result<()> {
        let client = self.client_mut(client_id)?;
        client.layout = layout;
        Ok(())
    }

    /// A client's socket went away without a detach. With keepalive the
    /// session becomes reattachable; without it the panes die.
    pub fn client_disconnected(&mut self, client_id: u64) {
        let client = match self.clients.remove(&client_id) {
            Some(c) => c,
            None => return,
        };
        if client.keepalive && !client.panes.is_empty() {
            info!(
                "client {} lost with keepalive, stashing session {}",
                client_id, client.session_name
            );
            self.stash_detached(&client, client.layout.clone());
        } else {
            for pane in client.panes.iter() {
                self.kill_pane_record(*pane);
            }
        }
        self.dirty = true;
    }

    /// Graceful shutdown: every connected client is treated like a
    /// disconnect, so keepalive sessions survive the restart.
    pub fn shutdown(&mut self) {
        let ids: Vec<u64> = self.clients.keys().copied().collect();
        for id in ids {
            self.client_disconnected(id);
        }
    }

    fn stash_detached(&mut self, client: &Client, layout: String) {
        for pane_id in client.panes.iter() {
            if let Some(pane) = self.panes.get_mut(pane_id) {
                pane.state = PaneState::Detached;
                pane.attached_to = None;
                pane.session_id = Some(client.session_id);
            }
        }
        self.detached.insert(
            client.session_id,
            DetachedSession {
                session_id: client.session_id,
                session_name: client.session_name.clone(),
                layout,
                panes: client.panes.clone(),
                detached_at: now_unix(),
            },
        );
    }

    //
    // pane lifecycle
    //

    pub fn add_pane(&mut self, client_id: u64, new: NewPane) -> anyhow::Result<&Pane> {
        let session_id = self.client(client_id)?.session_id;
        self.next_seq = self.next_seq.wrapping_add(1);
        let seq = self.next_seq;
        let pane = Pane {
            id: new.id,
            pod_pid: new.pod_pid,
            child_pid: new.child_pid,
            socket: new.socket,
            state: PaneState::Attached,
            name: String::new(),
            kind: PaneKind::Split,
            is_focused: false,
            created_from: Uid::nil(),
            focused_from: Uid::nil(),
            cwd: new.cwd,
            foreground: None,
            cursor: Cursor::default(),
            alt_screen: false,
            last_shell: None,
            sticky_key: new.sticky_key,
            sticky_pwd: new.sticky_pwd,
            attached_to: Some(client_id),
            session_id: Some(session_id),
            seq,
            created_at: now_unix(),
            orphaned_at: None,
        };
        let id = pane.id;
        self.panes.insert(id, pane);
        self.client_mut(client_id)?.panes.push(id);
        self.dirty = true;
        Ok(self.panes.get(&id).ok_or(anyhow!("pane vanished"))?)
    }

    /// Match an exact (pwd, key) among panes carrying sticky fields.
    /// Anything not currently attached qualifies: a sticky half-orphan,
    /// but also a detached or orphaned pane that was created with a
    /// sticky binding. The hit is not transitioned; the caller follows
    /// up with `adopt_pane`.
    pub fn find_sticky(&self, pwd: &str, key: char) -> Option<&Pane> {
        self.panes.values().find(|p| {
            p.state != PaneState::Attached
                && p.sticky_key == Some(key)
                && p.sticky_pwd.as_deref() == Some(pwd)
        })
    }

    /// Move an orphaned, sticky, or detached pane under the caller.
    pub fn adopt_pane(&mut self, client_id: u64, pane_id: Uid) -> anyhow::Result<&Pane> {
        if self.clients.get(&client_id).is_none() {
            return Err(anyhow!("client {} is not registered", client_id));
        }
        let pane = self.panes.get_mut(&pane_id).ok_or(anyhow!("no pane {}", pane_id))?;
        match pane.state {
            PaneState::Orphaned | PaneState::Sticky | PaneState::Detached => {}
            PaneState::Attached => {
                return Err(anyhow!("pane {} is already attached", pane_id));
            }
        }
        let was_detached_under = pane.session_id;

        pane.state = PaneState::Attached;
        pane.attached_to = Some(client_id);
        pane.orphaned_at = None;
        let client = self.client_mut(client_id)?;
        pane_list_add(&mut client.panes, pane_id);
        let session_id = client.session_id;
        if let Some(pane) = self.panes.get_mut(&pane_id) {
            pane.session_id = Some(session_id);
        }

        // adopting the last pane out of a lingering detached session
        // retires the snapshot
        if let Some(old_session) = was_detached_under {
            let empty = if let Some(d) = self.detached.get_mut(&old_session) {
                d.panes.retain(|p| *p != pane_id);
                d.panes.is_empty()
            } else {
                false
            };
            if empty {
                self.detached.remove(&old_session);
            }
        }

        self.dirty = true;
        Ok(self.panes.get(&pane_id).ok_or(anyhow!("pane vanished"))?)
    }

    /// Release a pane from its client without killing it. It becomes
    /// sticky when sticky fields are set, orphaned otherwise.
    pub fn orphan_pane(&mut self, pane_id: Uid) -> anyhow::Result<()> {
        let pane = self.panes.get_mut(&pane_id).ok_or(anyhow!("no pane {}", pane_id))?;
        if pane.state != PaneState::Attached {
            return Err(anyhow!("pane {} is not attached", pane_id));
        }
        let owner = pane.attached_to.take();
        pane.state =
            if pane.has_sticky_fields() { PaneState::Sticky } else { PaneState::Orphaned };
        pane.session_id = None;
        pane.orphaned_at = Some(now_unix());
        if let Some(client_id) = owner {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.panes.retain(|p| *p != pane_id);
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn set_sticky(&mut self, pane_id: Uid, key: char, pwd: String) -> anyhow::Result<()> {
        let pane = self.panes.get_mut(&pane_id).ok_or(anyhow!("no pane {}", pane_id))?;
        pane.sticky_key = Some(key);
        pane.sticky_pwd = Some(pwd);
        self.dirty = true;
        Ok(())
    }

    /// Terminate a pane's pod and drop the record. The pod owns the
    /// actual child teardown; we only ever signal the pod.
    pub fn kill_pane(&mut self, pane_id: Uid) -> anyhow::Result<()> {
        if !self.panes.contains_key(&pane_id) {
            return Err(anyhow!("no pane {}", pane_id));
        }
        self.kill_pane_record(pane_id);
        self.dirty = true;
        Ok(())
    }

    fn kill_pane_record(&mut self, pane_id: Uid) {
        if let Some(pane) = self.panes.remove(&pane_id) {
            if pane.pod_pid > 0 {
                if let Err(e) = signal::kill(Pid::from_raw(pane.pod_pid), signal::Signal::SIGTERM)
                {
                    warn!("signaling pod {} for pane {}: {}", pane.pod_pid, pane_id, e);
                }
            }
        }
        for client in self.clients.values_mut() {
            client.panes.retain(|p| *p != pane_id);
        }
        let mut empty_sessions = vec![];
        for session in self.detached.values_mut() {
            session.panes.retain(|p| *p != pane_id);
            if session.panes.is_empty() {
                empty_sessions.push(session.session_id);
            }
        }
        for id in empty_sessions {
            self.detached.remove(&id);
        }
    }

    /// The pod reported its child gone; drop the record without
    /// signaling anything.
    pub fn pane_exited(&mut self, pane_id: Uid) -> Option<u64> {
        let owner = self.panes.get(&pane_id).and_then(|p| p.attached_to);
        if let Some(pane) = self.panes.remove(&pane_id) {
            info!("pane {} exited (pod {})", pane_id, pane.pod_pid);
            for client in self.clients.values_mut() {
                client.panes.retain(|p| *p != pane_id);
            }
            for session in self.detached.values_mut() {
                session.panes.retain(|p| *p != pane_id);
            }
            self.detached.retain(|_, s| !s.panes.is_empty());
            self.dirty = true;
        }
        owner
    }

    //
    // pane bookkeeping sync
    //

    pub fn update_aux(&mut self, req: &UpdatePaneAux) -> anyhow::Result<()> {
        let pane = self.panes.get_mut(&req.pane).ok_or(anyhow!("no pane {}", req.pane))?;
        pane.name = req.name.clone();
        pane.kind = req.kind;
        pane.is_focused = req.is_focused;
        pane.created_from = req.created_from;
        pane.focused_from = req.focused_from;
        self.dirty = true;
        Ok(())
    }

    pub fn update_shell(&mut self, req: &UpdatePaneShell) -> anyhow::Result<()> {
        let pane = self.panes.get_mut(&req.pane).ok_or(anyhow!("no pane {}", req.pane))?;
        if !req.update.cwd.is_empty() {
            pane.cwd = req.update.cwd.clone();
        }
        pane.last_shell = Some(req.update.clone());
        self.dirty = true;
        Ok(())
    }

    pub fn update_cwd(&mut self, pane_id: Uid, cwd: String) {
        if let Some(pane) = self.panes.get_mut(&pane_id) {
            if pane.cwd != cwd {
                pane.cwd = cwd;
                self.dirty = true;
            }
        }
    }

    pub fn update_foreground(&mut self, pane_id: Uid, foreground: Foreground) {
        if let Some(pane) = self.panes.get_mut(&pane_id) {
            pane.foreground = Some(foreground);
        }
    }

    //
    // sessions
    //

    pub fn detach_session(&mut self, client_id: u64, req: &DetachSession) -> anyhow::Result<()> {
        let client = self.client(client_id)?.clone();
        if client.panes.is_empty() {
            return Err(anyhow!("session {} has no panes to detach", client.session_name));
        }
        let mut stash = client.clone();
        if !req.session_id.is_nil() {
            stash.session_id = req.session_id;
        }
        if !req.session_name.is_empty() {
            stash.session_name = req.session_name.clone();
        }
        let layout = if req.layout.is_empty() { client.layout } else { req.layout.clone() };
        self.stash_detached(&stash, layout);
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.panes.clear();
        }
        self.dirty = true;
        Ok(())
    }

    /// Find and remove a detached session by id prefix (or exact
    /// name). The panes stay detached until the caller adopts each
    /// one; they get an orphan timestamp so that a caller that dies
    /// mid-adoption leaves them to the GC rather than stranding them.
    pub fn reattach(&mut self, prefix: &str) -> anyhow::Result<DetachedSession> {
        let matches: Vec<Uid> = self
            .detached
            .keys()
            .filter(|id| id.hex().starts_with(prefix) || {
                self.detached.get(id).map(|d| d.session_name == prefix).unwrap_or(false)
            })
            .copied()
            .collect();
        match matches.len() {
            0 => Err(anyhow!("no detached session matches '{}'", prefix)),
            1 => {
                let session =
                    self.detached.remove(&matches[0]).ok_or(anyhow!("session vanished"))?;
                for pane_id in session.panes.iter() {
                    if let Some(pane) = self.panes.get_mut(pane_id) {
                        pane.orphaned_at = Some(now_unix());
                    }
                }
                Ok(session)
            }
            n => Err(anyhow!("'{}' is ambiguous ({} detached sessions match)", prefix, n)),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.detached.values().map(|d| d.summary()).collect();
        sessions.sort_by(|a, b| a.detached_at_unix.cmp(&b.detached_at_unix));
        sessions
    }

    pub fn list_orphaned(&self) -> Vec<PaneSnapshot> {
        let mut panes: Vec<PaneSnapshot> = self
            .panes
            .values()
            .filter(|p| matches!(p.state, PaneState::Orphaned | PaneState::Sticky))
            .map(|p| p.snapshot())
            .collect();
        panes.sort_by_key(|p| p.created_at_unix);
        panes
    }

    pub fn status(&self, req: &StatusRequest) -> StatusReply {
        let mut clients: Vec<ClientStatus> = self
            .clients
            .values()
            .map(|c| ClientStatus {
                client_id: c.id,
                session_id: c.session_id,
                session_name: c.session_name.clone(),
                keepalive: c.keepalive,
                panes: c.panes.clone(),
                layout: if req.full { Some(c.layout.clone()) } else { None },
            })
            .collect();
        clients.sort_by_key(|c| c.client_id);

        let mut panes: Vec<PaneSnapshot> = self.panes.values().map(|p| p.snapshot()).collect();
        panes.sort_by_key(|p| p.created_at_unix);

        StatusReply { clients, detached: self.list_sessions(), panes }
    }

    /// Reap panes and detached sessions that have sat unadopted past
    /// the timeout. Returns the panes that were killed.
    pub fn gc(&mut self, timeout_secs: i64) -> Vec<Uid> {
        let cutoff = now_unix() - timeout_secs;
        // orphaned and sticky panes age out on their timestamp; so do
        // detached panes whose reattach was started but never finished
        // (those are the only detached panes carrying a timestamp)
        let stale: Vec<Uid> = self
            .panes
            .values()
            .filter(|p| {
                p.state != PaneState::Attached
                    && p.orphaned_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|p| p.id)
            .collect();
        for pane in stale.iter() {
            info!("gc: reaping unadopted pane {}", pane);
            self.kill_pane_record(*pane);
        }

        let stale_sessions: Vec<Uid> = self
            .detached
            .values()
            .filter(|d| d.detached_at < cutoff)
            .map(|d| d.session_id)
            .collect();
        let mut killed = stale;
        for session_id in stale_sessions {
            if let Some(session) = self.detached.remove(&session_id) {
                info!("gc: reaping detached session {}", session.session_name);
                for pane in session.panes {
                    self.kill_pane_record(pane);
                    killed.push(pane);
                }
            }
        }

        if !killed.is_empty() {
            self.dirty = true;
        }
        killed
    }

    //
    // lookups
    //

    pub fn pane(&self, id: Uid) -> anyhow::Result<&Pane> {
        self.panes.get(&id).ok_or(anyhow!("no pane {}", id))
    }

    pub fn client(&self, id: u64) -> anyhow::Result<&Client> {
        self.clients.get(&id).ok_or(anyhow!("client {} is not registered", id))
    }

    fn client_mut(&mut self, id: u64) -> anyhow::Result<&mut Client> {
        self.clients.get_mut(&id).ok_or(anyhow!("client {} is not registered", id))
    }

    /// Resolve a notification/popup target to a client: either a
    /// session id of a connected client, or a pane owned by one.
    pub fn route_target(&self, target: Uid) -> Option<(u64, Option<Uid>)> {
        if let Some(client) = self.clients.values().find(|c| c.session_id == target) {
            return Some((client.id, None));
        }
        if let Some(pane) = self.panes.get(&target) {
            if let Some(owner) = pane.attached_to {
                return Some((owner, Some(target)));
            }
        }
        None
    }
}

fn pane_list_add(panes: &mut Vec<Uid>, id: Uid) {
    if !panes.contains(&id) {
        panes.push(id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_pane(registry: &mut Registry, client_id: u64) -> Uid {
        let id = Uid::generate();
        registry
            .add_pane(
                client_id,
                NewPane {
                    id,
                    pod_pid: 0, // no real pod to signal
                    child_pid: 0,
                    socket: PathBuf::from("/tmp/nowhere.sock"),
                    cwd: String::from("/tmp"),
                    sticky_key: None,
                    sticky_pwd: None,
                },
            )
            .expect("add_pane to succeed");
        id
    }

    fn register(registry: &mut Registry, keepalive: bool) -> Registered {
        registry.register(&Register {
            session_id: Uid::nil(),
            keepalive,
            name: String::new(),
        })
    }

    #[test]
    fn register_assigns_session_and_name() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        assert!(!reg.session_id.is_nil());
        assert!(!reg.session_name.is_empty());

        let named = registry.register(&Register {
            session_id: Uid::nil(),
            keepalive: true,
            name: String::from("work"),
        });
        assert_eq!(named.session_name, "work");
        assert_ne!(reg.client_id, named.client_id);
    }

    #[test]
    fn create_makes_attached() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);

        let p = registry.pane(pane).unwrap();
        assert_eq!(p.state, PaneState::Attached);
        assert_eq!(p.attached_to, Some(reg.client_id));
        assert_eq!(p.session_id, Some(reg.session_id));
        assert_eq!(registry.client(reg.client_id).unwrap().panes, vec![pane]);
    }

    #[test]
    fn orphan_then_adopt() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);

        registry.orphan_pane(pane).expect("orphan to succeed");
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Orphaned);
        assert!(registry.pane(pane).unwrap().attached_to.is_none());
        assert!(registry.pane(pane).unwrap().orphaned_at.is_some());
        assert!(registry.client(reg.client_id).unwrap().panes.is_empty());

        // double orphan is an illegal transition and must not mutate
        assert!(registry.orphan_pane(pane).is_err());
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Orphaned);

        let adopter = register(&mut registry, true);
        registry.adopt_pane(adopter.client_id, pane).expect("adopt to succeed");
        let p = registry.pane(pane).unwrap();
        assert_eq!(p.state, PaneState::Attached);
        assert_eq!(p.attached_to, Some(adopter.client_id));
        assert!(p.orphaned_at.is_none());
    }

    #[test]
    fn adopt_attached_is_rejected() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);

        let other = register(&mut registry, true);
        assert!(registry.adopt_pane(other.client_id, pane).is_err());
        // unchanged
        assert_eq!(registry.pane(pane).unwrap().attached_to, Some(reg.client_id));
    }

    #[test]
    fn sticky_flow() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);
        registry.set_sticky(pane, '1', String::from("/tmp")).unwrap();

        registry.orphan_pane(pane).unwrap();
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Sticky);

        assert!(registry.find_sticky("/tmp", '2').is_none());
        assert!(registry.find_sticky("/var", '1').is_none());
        let hit = registry.find_sticky("/tmp", '1').expect("sticky hit");
        assert_eq!(hit.id, pane);
        // find does not transition
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Sticky);

        let adopter = register(&mut registry, true);
        registry.adopt_pane(adopter.client_id, pane).unwrap();
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Attached);
        // attached panes are never sticky hits
        assert!(registry.find_sticky("/tmp", '1').is_none());
    }

    #[test]
    fn detached_pane_with_sticky_fields_is_found() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);
        registry.set_sticky(pane, '1', String::from("/tmp")).unwrap();

        // ungraceful keepalive disconnect leaves the pane detached,
        // not sticky, but the (pwd, key) binding still matches
        registry.client_disconnected(reg.client_id);
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Detached);
        let hit = registry.find_sticky("/tmp", '1').expect("sticky hit");
        assert_eq!(hit.id, pane);

        let adopter = register(&mut registry, true);
        registry.adopt_pane(adopter.client_id, pane).unwrap();
        assert_eq!(registry.pane(pane).unwrap().state, PaneState::Attached);
        // adopting the only pane retires the detached session snapshot
        assert!(registry.detached.is_empty());
    }

    #[test]
    fn keepalive_disconnect_detaches() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let a = test_pane(&mut registry, reg.client_id);
        let b = test_pane(&mut registry, reg.client_id);
        registry.sync_state(reg.client_id, String::from("{\"layout\":1}")).unwrap();

        registry.client_disconnected(reg.client_id);

        assert_eq!(registry.pane(a).unwrap().state, PaneState::Detached);
        assert_eq!(registry.pane(b).unwrap().state, PaneState::Detached);
        let detached = registry.detached.get(&reg.session_id).expect("detached session");
        assert_eq!(detached.layout, "{\"layout\":1}");
        assert_eq!(detached.panes.len(), 2);
    }

    #[test]
    fn no_keepalive_disconnect_kills() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, false);
        let pane = test_pane(&mut registry, reg.client_id);

        registry.client_disconnected(reg.client_id);
        assert!(registry.pane(pane).is_err());
        assert!(registry.detached.is_empty());
    }

    #[test]
    fn detach_reattach_round_trip() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let panes: Vec<Uid> = (0..3).map(|_| test_pane(&mut registry, reg.client_id)).collect();
        registry.sync_state(reg.client_id, String::from("layout-blob")).unwrap();
        registry.client_disconnected(reg.client_id);

        // reattach by prefix
        let prefix = &reg.session_id.hex()[..8];
        let session = registry.reattach(prefix).expect("reattach to succeed");
        assert_eq!(session.layout, "layout-blob");
        assert_eq!(session.panes.len(), 3);
        for p in session.panes.iter() {
            assert!(panes.contains(p));
            // panes stay detached until adopted
            assert_eq!(registry.pane(*p).unwrap().state, PaneState::Detached);
        }
        // the snapshot is consumed
        assert!(registry.reattach(prefix).is_err());

        let adopter = register(&mut registry, true);
        for p in session.panes.iter() {
            registry.adopt_pane(adopter.client_id, *p).unwrap();
        }
        assert_eq!(registry.client(adopter.client_id).unwrap().panes.len(), 3);
        for p in session.panes.iter() {
            assert_eq!(registry.pane(*p).unwrap().state, PaneState::Attached);
        }
    }

    #[test]
    fn reattach_by_name() {
        let mut registry = Registry::new();
        let reg = registry.register(&Register {
            session_id: Uid::nil(),
            keepalive: true,
            name: String::from("myproj"),
        });
        test_pane(&mut registry, reg.client_id);
        registry.client_disconnected(reg.client_id);

        assert!(registry.reattach("myproj").is_ok());
    }

    #[test]
    fn ambiguous_prefix_is_rejected() {
        let mut registry = Registry::new();
        for _ in 0..2 {
            let reg = register(&mut registry, true);
            test_pane(&mut registry, reg.client_id);
            registry.client_disconnected(reg.client_id);
        }
        assert!(registry.reattach("").is_err());
    }

    #[test]
    fn gc_reaps_old_orphans() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);
        registry.orphan_pane(pane).unwrap();

        // young orphan survives
        assert!(registry.gc(60).is_empty());
        assert!(registry.pane(pane).is_ok());

        // backdate it past the cutoff
        registry.panes.get_mut(&pane).unwrap().orphaned_at = Some(now_unix() - 120);
        let killed = registry.gc(60);
        assert_eq!(killed, vec![pane]);
        assert!(registry.pane(pane).is_err());
    }

    #[test]
    fn gc_reaps_old_detached_sessions() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);
        registry.client_disconnected(reg.client_id);

        registry.detached.get_mut(&reg.session_id).unwrap().detached_at = now_unix() - 120;
        let killed = registry.gc(60);
        assert_eq!(killed, vec![pane]);
        assert!(registry.detached.is_empty());
    }

    #[test]
    fn pane_exited_cleans_tables() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);

        let owner = registry.pane_exited(pane);
        assert_eq!(owner, Some(reg.client_id));
        assert!(registry.pane(pane).is_err());
        assert!(registry.client(reg.client_id).unwrap().panes.is_empty());
    }

    #[test]
    fn route_target_resolves_sessions_and_panes() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let pane = test_pane(&mut registry, reg.client_id);

        assert_eq!(registry.route_target(reg.session_id), Some((reg.client_id, None)));
        assert_eq!(registry.route_target(pane), Some((reg.client_id, Some(pane))));
        assert_eq!(registry.route_target(Uid::generate()), None);
    }

    #[test]
    fn restore_normalises_attached_panes() {
        let mut registry = Registry::new();
        let reg = register(&mut registry, true);
        let sticky = test_pane(&mut registry, reg.client_id);
        let plain = test_pane(&mut registry, reg.client_id);
        registry.set_sticky(sticky, 'k', String::from("/w")).unwrap();

        let panes: Vec<Pane> = registry.panes.values().cloned().collect();
        let mut fresh = Registry::new();
        fresh.restore(panes, vec![]);

        assert_eq!(fresh.pane(sticky).unwrap().state, PaneState::Sticky);
        assert_eq!(fresh.pane(plain).unwrap().state, PaneState::Orphaned);
        assert!(fresh.pane(plain).unwrap().orphaned_at.is_some());
    }
}
