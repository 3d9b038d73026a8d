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

//! Wire-level types shared by every hexe process.
//!
//! Control channels (mux<->ses, cli->ses, pod->ses) carry [`CtlMessage`]s:
//! a little-endian `{u16 msg_type, u32 payload_len}` header followed by a
//! msgpack payload. Pod VT channels carry [`FrameKind`]-tagged frames with
//! a big-endian length. The actual socket I/O lives in `libhexe::protocol`;
//! this crate only knows about bytes.

use std::{fmt, str::FromStr};

use anyhow::anyhow;
use serde::{Deserializer, Serializer};
use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard cap on a control message payload. Anything bigger is treated
/// as a protocol violation and closes the connection.
pub const MAX_CTL_PAYLOAD: usize = 4 * 1024 * 1024;

/// Hard cap on a pod frame payload. Oversized frames are skipped
/// rather than closing the stream.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Size of the `{u16 msg_type, u32 payload_len}` control header.
pub const CTL_HEADER_LEN: usize = 6;

/// Size of the `{u8 frame_type, u32 len}` pod frame header.
pub const FRAME_HEADER_LEN: usize = 5;

/// The first byte written on a fresh connection to the ses socket
/// determines what the channel carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SesHandshake {
    /// A mux control channel. Bidirectional, long-lived.
    MuxCtl = 1,
    /// Reserved for multiplexing many pane VT streams over one fd.
    /// Accepted and drained, never interpreted. Do not repurpose.
    MuxVt = 2,
    /// A pod event uplink. Followed by the 16 raw pane id bytes.
    PodUplink = 3,
    /// A one-shot CLI request channel.
    Cli = 4,
}

impl TryFrom<u8> for SesHandshake {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            1 => Ok(SesHandshake::MuxCtl),
            2 => Ok(SesHandshake::MuxVt),
            3 => Ok(SesHandshake::PodUplink),
            4 => Ok(SesHandshake::Cli),
            _ => Err(anyhow!("unknown ses handshake {}", v)),
        }
    }
}

/// The first byte written on a fresh connection to a pod socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PodHandshake {
    /// A VT consumer. Gets the backlog replayed, then live output.
    Vt = 1,
    /// The shell prompt integration (shp) control channel.
    ShellCtl = 2,
    /// Auxiliary input. Frames are written to the pty, no backlog,
    /// no echo beyond what the pty itself produces.
    AuxInput = 3,
}

impl TryFrom<u8> for PodHandshake {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            1 => Ok(PodHandshake::Vt),
            2 => Ok(PodHandshake::ShellCtl),
            3 => Ok(PodHandshake::AuxInput),
            _ => Err(anyhow!("unknown pod handshake {}", v)),
        }
    }
}

/// A 128 bit random identifier for a pane or a session.
///
/// The canonical wire form is 32 lowercase hex bytes. The all-zero
/// id means "unset"; `Uid::nil()` makes one and `is_nil()` spots it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Uid([u8; 16]);

impl Uid {
    pub fn generate() -> Uid {
        Uid(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn nil() -> Uid {
        Uid([0; 16])
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Uid {
        Uid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The 32 lowercase hex chars, allocated fresh.
    pub fn hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0.iter() {
            s.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
            s.push(char::from_digit((b & 0xf) as u32, 16).unwrap_or('0'));
        }
        s
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.hex())
    }
}

/// The error for parsing a [`Uid`] out of its 32 hex char wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseUidError {
    msg: String,
}

impl fmt::Display for ParseUidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for ParseUidError {}

impl FromStr for Uid {
    type Err = ParseUidError;

    fn from_str(s: &str) -> Result<Uid, ParseUidError> {
        if s.len() != 32 {
            return Err(ParseUidError { msg: format!("uid must be 32 hex chars, got {}", s.len()) });
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char)
                .to_digit(16)
                .ok_or(ParseUidError { msg: String::from("bad hex in uid") })?;
            let lo = (chunk[1] as char)
                .to_digit(16)
                .ok_or(ParseUidError { msg: String::from("bad hex in uid") })?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Ok(Uid(bytes))
    }
}

impl serde::Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> serde::Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Uid, D::Error> {
        struct UidVisitor;
        impl serde::de::Visitor<'_> for UidVisitor {
            type Value = Uid;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a 32 char hex string")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Uid, E> {
                Uid::from_str(v).map_err(E::custom)
            }
        }
        deserializer.deserialize_str(UidVisitor)
    }
}

/// Where a pane sits in its lifecycle. See the transition table in the
/// ses registry for what is allowed to move where.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaneState {
    Attached,
    Detached,
    Sticky,
    #[default]
    Orphaned,
}

impl fmt::Display for PaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaneState::Attached => write!(f, "attached"),
            PaneState::Detached => write!(f, "detached"),
            PaneState::Sticky => write!(f, "sticky"),
            PaneState::Orphaned => write!(f, "orphaned"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaneKind {
    #[default]
    Split,
    Float,
}

#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FocusDir {
    #[default]
    Left,
    Right,
    Up,
    Down,
}

/// The foreground process a pod last observed in its pty.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Foreground {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pid: i32,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct Cursor {
    #[serde(default)]
    pub x: u16,
    #[serde(default)]
    pub y: u16,
    #[serde(default)]
    pub style: u8,
    #[serde(default)]
    pub visible: bool,
}

/// One shell lifecycle report from the prompt integration. Also the
/// shape of the most-recent-command bookkeeping on a pane.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ShellUpdate {
    /// true between command start and command end
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub jobs: u32,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub started_at_unix: Option<i64>,
}

/// Everything ses knows about one pane, as reported by `pane_info`
/// and `status`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PaneSnapshot {
    pub pane: Uid,
    #[serde(default)]
    pub state: PaneState,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: PaneKind,
    #[serde(default)]
    pub pod_pid: i32,
    #[serde(default)]
    pub child_pid: i32,
    #[serde(default)]
    pub socket: String,
    #[serde(default)]
    pub session_id: Option<Uid>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub foreground: Option<Foreground>,
    #[serde(default)]
    pub cursor: Cursor,
    #[serde(default)]
    pub alt_screen: bool,
    #[serde(default)]
    pub last_shell: Option<ShellUpdate>,
    #[serde(default)]
    pub sticky_key: Option<char>,
    #[serde(default)]
    pub sticky_pwd: Option<String>,
    #[serde(default)]
    pub is_focused: bool,
    #[serde(default)]
    pub created_from: Uid,
    #[serde(default)]
    pub focused_from: Uid,
    #[serde(default)]
    pub created_at_unix: i64,
    #[serde(default)]
    pub orphaned_at_unix: Option<i64>,
    #[serde(default)]
    pub seq: u16,
}

//
// Requests
//

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Register {
    /// The session id the mux wants to run under. Nil means
    /// "assign me one".
    #[serde(default)]
    pub session_id: Uid,
    #[serde(default)]
    pub keepalive: bool,
    /// Empty means "pick a name for me".
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SyncState {
    /// The mux's opaque layout blob, stored for detach snapshots.
    #[serde(default)]
    pub layout: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct CreatePane {
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub sticky_key: Option<char>,
    #[serde(default)]
    pub sticky_pwd: Option<String>,
    #[serde(default)]
    pub isolate: bool,
    /// Extra environment entries for the child, applied in order.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FindSticky {
    #[serde(default)]
    pub pwd: String,
    #[serde(default)]
    pub key: char,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PaneRef {
    pub pane: Uid,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SetSticky {
    pub pane: Uid,
    #[serde(default)]
    pub key: char,
    #[serde(default)]
    pub pwd: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct UpdatePaneAux {
    pub pane: Uid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: PaneKind,
    #[serde(default)]
    pub is_focused: bool,
    #[serde(default)]
    pub created_from: Uid,
    #[serde(default)]
    pub focused_from: Uid,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct UpdatePaneShell {
    pub pane: Uid,
    #[serde(default)]
    pub update: ShellUpdate,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct DetachSession {
    pub session_id: Uid,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub layout: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Reattach {
    /// A full session id or any unambiguous hex prefix of one.
    #[serde(default)]
    pub prefix: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct StatusRequest {
    /// Include layout blobs and full pane snapshots.
    #[serde(default)]
    pub full: bool,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Notify {
    /// A pane id (pane realm) or session id (mux realm). None or nil
    /// broadcasts to every connected mux.
    #[serde(default)]
    pub target: Option<Uid>,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SendKeys {
    /// None broadcasts to every attached pane.
    #[serde(default)]
    pub target: Option<Uid>,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PopConfirm {
    pub target: Uid,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PopChoose {
    pub target: Uid,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub items: Vec<String>,
}

/// What came back from a popup.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub enum PopOutcome {
    Confirmed(bool),
    Chosen(u32),
    #[default]
    Cancelled,
}

/// The mux's answer to a routed popup.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PopResponse {
    pub request_id: u64,
    #[serde(default)]
    pub outcome: PopOutcome,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FocusMove {
    pub pane: Uid,
    #[serde(default)]
    pub dir: FocusDir,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ExitIntentResponse {
    pub request_id: u64,
    #[serde(default)]
    pub allow: bool,
}

/// Flag bit: the CLI blocks until the float's pod reports an exit.
pub const FLOAT_WAIT_FOR_EXIT: u32 = 1 << 0;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FloatRequest {
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cwd: String,
    /// File the float command writes its result into; relayed back
    /// verbatim in `float_result`.
    #[serde(default)]
    pub result_path: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// A session id selecting the mux. Nil means "any connected mux".
    #[serde(default)]
    pub target: Uid,
}

/// The mux reporting that it created the requested float.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FloatAck {
    pub request_id: u64,
    pub pane: Uid,
}

//
// Replies
//

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ErrorReply {
    #[serde(default)]
    pub msg: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Registered {
    pub session_id: Uid,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub client_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PaneCreated {
    pub pane: Uid,
    #[serde(default)]
    pub pod_pid: i32,
    #[serde(default)]
    pub child_pid: i32,
    #[serde(default)]
    pub seq: u16,
    #[serde(default)]
    pub socket: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PaneFound {
    pub pane: Uid,
    #[serde(default)]
    pub state: PaneState,
    #[serde(default)]
    pub pod_pid: i32,
    #[serde(default)]
    pub child_pid: i32,
    #[serde(default)]
    pub socket: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PaneCwd {
    #[serde(default)]
    pub cwd: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SessionReattached {
    #[serde(default)]
    pub layout: String,
    #[serde(default)]
    pub panes: Vec<Uid>,
    #[serde(default)]
    pub session_name: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uid,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub pane_count: u32,
    #[serde(default)]
    pub detached_at_unix: i64,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SessionsList {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct OrphanedPanes {
    #[serde(default)]
    pub panes: Vec<PaneSnapshot>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ClientStatus {
    pub client_id: u64,
    #[serde(default)]
    pub session_id: Uid,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub keepalive: bool,
    #[serde(default)]
    pub panes: Vec<Uid>,
    /// Only present on `status full`.
    #[serde(default)]
    pub layout: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct StatusReply {
    #[serde(default)]
    pub clients: Vec<ClientStatus>,
    #[serde(default)]
    pub detached: Vec<SessionSummary>,
    #[serde(default)]
    pub panes: Vec<PaneSnapshot>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PopReply {
    #[serde(default)]
    pub outcome: PopOutcome,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ExitIntentReply {
    #[serde(default)]
    pub allow: bool,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FloatCreated {
    pub pane: Uid,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FloatResult {
    pub pane: Uid,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
}

//
// Events (ses -> mux) and uplink reports (pod -> ses)
//

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PaneExited {
    pub pane: Uid,
    #[serde(default)]
    pub status: i32,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct NotifyEvent {
    /// Set when the notification is pane-realm rather than mux-realm.
    #[serde(default)]
    pub pane: Option<Uid>,
    #[serde(default)]
    pub msg: String,
    /// Display-duration hint, relayed from the requester.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ShellEventMsg {
    pub pane: Uid,
    #[serde(default)]
    pub update: ShellUpdate,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PopConfirmEvent {
    pub request_id: u64,
    pub target: Uid,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PopChooseEvent {
    pub request_id: u64,
    pub target: Uid,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ExitIntentEvent {
    pub request_id: u64,
    pub pane: Uid,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct FloatOpenEvent {
    pub request_id: u64,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub result_path: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PodCwd {
    pub pane: Uid,
    #[serde(default)]
    pub cwd: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PodForeground {
    pub pane: Uid,
    #[serde(default)]
    pub foreground: Foreground,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PodBell {
    pub pane: Uid,
}

/// Every message that can cross a control channel, tagged on the wire
/// by [`MsgType`]. Kept as one closed enum so that decoding is a single
/// match and routing can branch on the tag without parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum CtlMessage {
    // requests
    Register(Register),
    SyncState(SyncState),
    CreatePane(CreatePane),
    FindSticky(FindSticky),
    AdoptPane(PaneRef),
    OrphanPane(PaneRef),
    KillPane(PaneRef),
    SetSticky(SetSticky),
    UpdatePaneAux(UpdatePaneAux),
    UpdatePaneShell(UpdatePaneShell),
    GetPaneCwd(PaneRef),
    GetPaneInfo(PaneRef),
    DetachSession(DetachSession),
    Reattach(Reattach),
    ListSessions,
    ListOrphaned,
    Status(StatusRequest),
    Notify(Notify),
    SendKeys(SendKeys),
    PopConfirm(PopConfirm),
    PopChoose(PopChoose),
    PopResponse(PopResponse),
    FocusMove(FocusMove),
    ExitIntent(PaneRef),
    ExitIntentResponse(ExitIntentResponse),
    FloatRequest(FloatRequest),
    FloatAck(FloatAck),

    // replies
    Ok,
    Error(ErrorReply),
    Registered(Registered),
    PaneCreated(PaneCreated),
    PaneFound(PaneFound),
    PaneNotFound,
    PaneCwd(PaneCwd),
    PaneInfo(PaneSnapshot),
    SessionReattached(SessionReattached),
    SessionsList(SessionsList),
    OrphanedPanes(OrphanedPanes),
    StatusReply(StatusReply),
    PopReply(PopReply),
    ExitIntentReply(ExitIntentReply),
    FloatCreated(FloatCreated),
    FloatResult(FloatResult),

    // events
    PaneExited(PaneExited),
    NotifyEvent(NotifyEvent),
    ShellEvent(ShellEventMsg),
    PopConfirmEvent(PopConfirmEvent),
    PopChooseEvent(PopChooseEvent),
    ExitIntentEvent(ExitIntentEvent),
    FocusMoveEvent(FocusMove),
    FloatOpenEvent(FloatOpenEvent),

    // pod uplink reports
    PodCwd(PodCwd),
    PodForeground(PodForeground),
    PodBell(PodBell),
    PodShell(ShellEventMsg),
    PodExited(PaneExited),
}

/// The u16 wire tag for a control message. Requests sit in 1..,
/// replies in 64.., mux events in 128.., pod uplink reports in 192..
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Register = 1,
    SyncState = 2,
    CreatePane = 3,
    FindSticky = 4,
    AdoptPane = 5,
    OrphanPane = 6,
    KillPane = 7,
    SetSticky = 8,
    UpdatePaneAux = 9,
    UpdatePaneShell = 10,
    GetPaneCwd = 11,
    GetPaneInfo = 12,
    DetachSession = 13,
    Reattach = 14,
    ListSessions = 15,
    ListOrphaned = 16,
    Status = 17,
    Notify = 18,
    SendKeys = 19,
    PopConfirm = 20,
    PopChoose = 21,
    PopResponse = 22,
    FocusMove = 23,
    ExitIntent = 24,
    ExitIntentResponse = 25,
    FloatRequest = 26,
    FloatAck = 27,

    Ok = 64,
    Error = 65,
    Registered = 66,
    PaneCreated = 67,
    PaneFound = 68,
    PaneNotFound = 69,
    PaneCwd = 70,
    PaneInfo = 71,
    SessionReattached = 72,
    SessionsList = 73,
    OrphanedPanes = 74,
    StatusReply = 75,
    PopReply = 76,
    ExitIntentReply = 77,
    FloatCreated = 78,
    FloatResult = 79,

    PaneExited = 128,
    NotifyEvent = 129,
    ShellEvent = 130,
    PopConfirmEvent = 131,
    PopChooseEvent = 132,
    ExitIntentEvent = 133,
    FocusMoveEvent = 134,
    FloatOpenEvent = 135,

    PodCwd = 192,
    PodForeground = 193,
    PodBell = 194,
    PodShell = 195,
    PodExited = 196,
}

impl TryFrom<u16> for MsgType {
    type Error = anyhow::Error;

    fn try_from(v: u16) -> anyhow::Result<Self> {
        type M = MsgType;
        Ok(match v {
            1 => M::Register,
            2 => M::SyncState,
            3 => M::CreatePane,
            4 => M::FindSticky,
            5 => M::AdoptPane,
            6 => M::OrphanPane,
            7 => M::KillPane,
            8 => M::SetSticky,
            9 => M::UpdatePaneAux,
            10 => M::UpdatePaneShell,
            11 => M::GetPaneCwd,
            12 => M::GetPaneInfo,
            13 => M::DetachSession,
            14 => M::Reattach,
            15 => M::ListSessions,
            16 => M::ListOrphaned,
            17 => M::Status,
            18 => M::Notify,
            19 => M::SendKeys,
            20 => M::PopConfirm,
            21 => M::PopChoose,
            22 => M::PopResponse,
            23 => M::FocusMove,
            24 => M::ExitIntent,
            25 => M::ExitIntentResponse,
            26 => M::FloatRequest,
            27 => M::FloatAck,
            64 => M::Ok,
            65 => M::Error,
            66 => M::Registered,
            67 => M::PaneCreated,
            68 => M::PaneFound,
            69 => M::PaneNotFound,
            70 => M::PaneCwd,
            71 => M::PaneInfo,
            72 => M::SessionReattached,
            73 => M::SessionsList,
            74 => M::OrphanedPanes,
            75 => M::StatusReply,
            76 => M::PopReply,
            77 => M::ExitIntentReply,
            78 => M::FloatCreated,
            79 => M::FloatResult,
            128 => M::PaneExited,
            129 => M::NotifyEvent,
            130 => M::ShellEvent,
            131 => M::PopConfirmEvent,
            132 => M::PopChooseEvent,
            133 => M::ExitIntentEvent,
            134 => M::FocusMoveEvent,
            135 => M::FloatOpenEvent,
            192 => M::PodCwd,
            193 => M::PodForeground,
            194 => M::PodBell,
            195 => M::PodShell,
            196 => M::PodExited,
            _ => return Err(anyhow!("unknown msg type {}", v)),
        })
    }
}

impl CtlMessage {
    pub fn msg_type(&self) -> MsgType {
        use CtlMessage as M;
        match self {
            M::Register(_) => MsgType::Register,
            M::SyncState(_) => MsgType::SyncState,
            M::CreatePane(_) => MsgType::CreatePane,
            M::FindSticky(_) => MsgType::FindSticky,
            M::AdoptPane(_) => MsgType::AdoptPane,
            M::OrphanPane(_) => MsgType::OrphanPane,
            M::KillPane(_) => MsgType::KillPane,
            M::SetSticky(_) => MsgType::SetSticky,
            M::UpdatePaneAux(_) => MsgType::UpdatePaneAux,
            M::UpdatePaneShell(_) => MsgType::UpdatePaneShell,
            M::GetPaneCwd(_) => MsgType::GetPaneCwd,
            M::GetPaneInfo(_) => MsgType::GetPaneInfo,
            M::DetachSession(_) => MsgType::DetachSession,
            M::Reattach(_) => MsgType::Reattach,
            M::ListSessions => MsgType::ListSessions,
            M::ListOrphaned => MsgType::ListOrphaned,
            M::Status(_) => MsgType::Status,
            M::Notify(_) => MsgType::Notify,
            M::SendKeys(_) => MsgType::SendKeys,
            M::PopConfirm(_) => MsgType::PopConfirm,
            M::PopChoose(_) => MsgType::PopChoose,
            M::PopResponse(_) => MsgType::PopResponse,
            M::FocusMove(_) => MsgType::FocusMove,
            M::ExitIntent(_) => MsgType::ExitIntent,
            M::ExitIntentResponse(_) => MsgType::ExitIntentResponse,
            M::FloatRequest(_) => MsgType::FloatRequest,
            M::FloatAck(_) => MsgType::FloatAck,
            M::Ok => MsgType::Ok,
            M::Error(_) => MsgType::Error,
            M::Registered(_) => MsgType::Registered,
            M::PaneCreated(_) => MsgType::PaneCreated,
            M::PaneFound(_) => MsgType::PaneFound,
            M::PaneNotFound => MsgType::PaneNotFound,
            M::PaneCwd(_) => MsgType::PaneCwd,
            M::PaneInfo(_) => MsgType::PaneInfo,
            M::SessionReattached(_) => MsgType::SessionReattached,
            M::SessionsList(_) => MsgType::SessionsList,
            M::OrphanedPanes(_) => MsgType::OrphanedPanes,
            M::StatusReply(_) => MsgType::StatusReply,
            M::PopReply(_) => MsgType::PopReply,
            M::ExitIntentReply(_) => MsgType::ExitIntentReply,
            M::FloatCreated(_) => MsgType::FloatCreated,
            M::FloatResult(_) => MsgType::FloatResult,
            M::PaneExited(_) => MsgType::PaneExited,
            M::NotifyEvent(_) => MsgType::NotifyEvent,
            M::ShellEvent(_) => MsgType::ShellEvent,
            M::PopConfirmEvent(_) => MsgType::PopConfirmEvent,
            M::PopChooseEvent(_) => MsgType::PopChooseEvent,
            M::ExitIntentEvent(_) => MsgType::ExitIntentEvent,
            M::FocusMoveEvent(_) => MsgType::FocusMoveEvent,
            M::FloatOpenEvent(_) => MsgType::FloatOpenEvent,
            M::PodCwd(_) => MsgType::PodCwd,
            M::PodForeground(_) => MsgType::PodForeground,
            M::PodBell(_) => MsgType::PodBell,
            M::PodShell(_) => MsgType::PodShell,
            M::PodExited(_) => MsgType::PodExited,
        }
    }

    /// true for the asynchronous ses->mux messages that can interleave
    /// with request/response traffic on a mux control channel.
    pub fn is_event(&self) -> bool {
        (self.msg_type() as u16) >= MsgType::PaneExited as u16
            && (self.msg_type() as u16) < MsgType::PodCwd as u16
    }
}

/// Reserved header for multiplexing many pane VT streams over one
/// ses connection (handshake byte 2). Not produced or consumed today;
/// the handshake byte must not be repurposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxVtHeader {
    pub pane_seq: u16,
    pub frame_type: u8,
    pub len: u32,
}

mod frame;
pub use frame::{encode_frame_header, Frame, FrameKind, FrameReader};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_hex_round_trip() {
        let uid = Uid::generate();
        let hex = uid.hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        let parsed = Uid::from_str(&hex).expect("parse to succeed");
        assert_eq!(uid, parsed);
    }

    #[test]
    fn uid_rejects_bad_input() {
        assert!(Uid::from_str("").is_err());
        assert!(Uid::from_str("abcd").is_err());
        assert!(Uid::from_str("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn nil_uid() {
        assert!(Uid::nil().is_nil());
        assert!(!Uid::generate().is_nil());
        assert_eq!(Uid::nil().hex(), "00000000000000000000000000000000");
    }

    #[test]
    fn handshake_bytes() {
        assert_eq!(SesHandshake::try_from(1).unwrap(), SesHandshake::MuxCtl);
        assert_eq!(SesHandshake::try_from(3).unwrap(), SesHandshake::PodUplink);
        assert_eq!(SesHandshake::try_from(4).unwrap(), SesHandshake::Cli);
        assert!(SesHandshake::try_from(0).is_err());
        assert!(SesHandshake::try_from(9).is_err());

        assert_eq!(PodHandshake::try_from(1).unwrap(), PodHandshake::Vt);
        assert_eq!(PodHandshake::try_from(3).unwrap(), PodHandshake::AuxInput);
        assert!(PodHandshake::try_from(42).is_err());
    }

    #[test]
    fn msg_type_round_trip() {
        for t in [
            MsgType::Register,
            MsgType::CreatePane,
            MsgType::Status,
            MsgType::Error,
            MsgType::PaneExited,
            MsgType::PodExited,
        ] {
            assert_eq!(MsgType::try_from(t as u16).unwrap(), t);
        }
        assert!(MsgType::try_from(0).is_err());
        assert!(MsgType::try_from(4096).is_err());
    }

    #[test]
    fn event_classification() {
        let ev = CtlMessage::PaneExited(PaneExited { pane: Uid::generate(), status: 0 });
        assert!(ev.is_event());
        let req = CtlMessage::ListSessions;
        assert!(!req.is_event());
        let uplink = CtlMessage::PodBell(PodBell { pane: Uid::generate() });
        assert!(!uplink.is_event());
    }
}
