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

//! The typed mux-side client for the ses control channel.
//!
//! One socket, one owner, no threads: requests are written and their
//! replies matched by message class; asynchronous events that arrive
//! in between are queued and handed out via [`MuxClient::poll_event`].

use std::{
    collections::VecDeque,
    os::unix::{io::AsRawFd, net::UnixStream},
    time::Duration,
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    CreatePane, CtlMessage, PaneFound, PaneSnapshot, PaneCreated, Register, Registered,
    SesHandshake, SessionReattached, StatusReply, StatusRequest, Uid,
};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{info, warn};

use crate::{paths::Layout, protocol};

pub struct MuxClient {
    stream: UnixStream,
    events: VecDeque<CtlMessage>,
    pub session_id: Uid,
    pub session_name: String,
    pub client_id: u64,
}

impl MuxClient {
    /// Dial the ses socket and identify as a mux control channel.
    pub fn connect(layout: &Layout) -> anyhow::Result<MuxClient> {
        MuxClient::connect_to(layout.ses_sock())
    }

    /// Like `connect`, against an explicit socket path.
    pub fn connect_to<P: AsRef<std::path::Path>>(sock: P) -> anyhow::Result<MuxClient> {
        let channel = protocol::Channel::connect(sock, SesHandshake::MuxCtl as u8)
            .context("connecting to ses")?;
        Ok(MuxClient {
            stream: channel.stream,
            events: VecDeque::new(),
            session_id: Uid::nil(),
            session_name: String::new(),
            client_id: 0,
        })
    }

    /// Bind this channel to a session. Must be the first request.
    pub fn register(
        &mut self,
        session_id: Option<Uid>,
        keepalive: bool,
        name: &str,
    ) -> anyhow::Result<Registered> {
        let reply = self.request(&CtlMessage::Register(Register {
            session_id: session_id.unwrap_or_else(Uid::nil),
            keepalive,
            name: String::from(name),
        }))?;
        match reply {
            CtlMessage::Registered(registered) => {
                self.session_id = registered.session_id;
                self.session_name = registered.session_name.clone();
                self.client_id = registered.client_id;
                info!("registered as session {} ({})", self.session_id, self.session_name);
                Ok(registered)
            }
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    /// One request, one reply; events that interleave are queued.
    pub fn request(&mut self, msg: &CtlMessage) -> anyhow::Result<CtlMessage> {
        protocol::write_msg(&mut self.stream, msg).context("sending request")?;
        loop {
            let reply = protocol::read_msg(&mut self.stream).context("reading reply")?;
            if reply.is_event() {
                self.events.push_back(reply);
                continue;
            }
            return Ok(reply);
        }
    }

    /// Fire-and-forget, for popup/exit-intent/float responses.
    pub fn send(&mut self, msg: &CtlMessage) -> anyhow::Result<()> {
        protocol::write_msg(&mut self.stream, msg).context("sending message")?;
        Ok(())
    }

    /// The next asynchronous event, waiting at most `timeout`.
    pub fn poll_event(&mut self, timeout: Duration) -> anyhow::Result<Option<CtlMessage>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        let mut fds = [PollFd::new(self.stream.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout.as_millis() as i32) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(e).context("polling ses stream"),
        }
        let msg = protocol::read_msg(&mut self.stream).context("reading event")?;
        if msg.is_event() {
            Ok(Some(msg))
        } else {
            warn!("dropping stray {:?} outside a request", msg.msg_type());
            Ok(None)
        }
    }

    fn expect_ok(&mut self, msg: &CtlMessage) -> anyhow::Result<()> {
        match self.request(msg)? {
            CtlMessage::Ok => Ok(()),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    //
    // typed calls
    //

    pub fn sync_state(&mut self, layout_json: &str) -> anyhow::Result<()> {
        self.expect_ok(&CtlMessage::SyncState(hexe_protocol::SyncState {
            layout: String::from(layout_json),
        }))
    }

    pub fn create_pane(&mut self, req: CreatePane) -> anyhow::Result<PaneCreated> {
        match self.request(&CtlMessage::CreatePane(req))? {
            CtlMessage::PaneCreated(created) => Ok(created),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    pub fn find_sticky(&mut self, pwd: &str, key: char) -> anyhow::Result<Option<PaneFound>> {
        match self.request(&CtlMessage::FindSticky(hexe_protocol::FindSticky {
            pwd: String::from(pwd),
            key,
        }))? {
            CtlMessage::PaneFound(found) => Ok(Some(found)),
            CtlMessage::PaneNotFound => Ok(None),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    pub fn adopt_pane(&mut self, pane: Uid) -> anyhow::Result<PaneFound> {
        match self.request(&CtlMessage::AdoptPane(hexe_protocol::PaneRef { pane }))? {
            CtlMessage::PaneFound(found) => Ok(found),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    pub fn orphan_pane(&mut self, pane: Uid) -> anyhow::Result<()> {
        self.expect_ok(&CtlMessage::OrphanPane(hexe_protocol::PaneRef { pane }))
    }

    pub fn kill_pane(&mut self, pane: Uid) -> anyhow::Result<()> {
        self.expect_ok(&CtlMessage::KillPane(hexe_protocol::PaneRef { pane }))
    }

    pub fn set_sticky(&mut self, pane: Uid, key: char, pwd: &str) -> anyhow::Result<()> {
        self.expect_ok(&CtlMessage::SetSticky(hexe_protocol::SetSticky {
            pane,
            key,
            pwd: String::from(pwd),
        }))
    }

    pub fn detach_session(&mut self, layout_json: &str) -> anyhow::Result<()> {
        self.expect_ok(&CtlMessage::DetachSession(hexe_protocol::DetachSession {
            session_id: self.session_id,
            session_name: self.session_name.clone(),
            layout: String::from(layout_json),
        }))
    }

    pub fn reattach(&mut self, prefix: &str) -> anyhow::Result<SessionReattached> {
        match self.request(&CtlMessage::Reattach(hexe_protocol::Reattach {
            prefix: String::from(prefix),
        }))? {
            CtlMessage::SessionReattached(session) => Ok(session),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    pub fn pane_info(&mut self, pane: Uid) -> anyhow::Result<PaneSnapshot> {
        match self.request(&CtlMessage::GetPaneInfo(hexe_protocol::PaneRef { pane }))? {
            CtlMessage::PaneInfo(info) => Ok(info),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }

    pub fn status(&mut self, full: bool) -> anyhow::Result<StatusReply> {
        match self.request(&CtlMessage::Status(StatusRequest { full }))? {
            CtlMessage::StatusReply(status) => Ok(status),
            CtlMessage::Error(e) => Err(anyhow!("{}", e.msg)),
            other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
        }
    }
}
