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

//! The mux-facing CLI verbs. The real mux front end (rendering,
//! splits, keybindings) lives elsewhere; these verbs drive the same
//! control plane it does: register, create or adopt panes, attach to
//! pods, and fire one-shot requests at ses.

use std::{env, os::unix::net::UnixStream, process, str::FromStr, time};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    CreatePane, CtlMessage, FloatRequest, FocusDir, FocusMove, Notify, PaneRef, PodHandshake,
    SendKeys, Uid, FLOAT_WAIT_FOR_EXIT,
};
use tracing::{info, warn};

use crate::{consts, paths::Layout, pod, ses};

pub mod client;

pub use client::MuxClient;

/// Make sure a ses daemon serves this instance, starting one (which
/// self-daemonizes) if nothing answers.
pub fn ensure_ses(layout: &Layout) -> anyhow::Result<()> {
    if UnixStream::connect(layout.ses_sock()).is_ok() {
        return Ok(());
    }
    info!("no ses daemon, starting one");
    let exe = env::current_exe().context("resolving own binary path")?;
    let mut cmd = process::Command::new(exe);
    if let Some(instance) = &layout.instance {
        cmd.arg("-I").arg(instance);
    }
    layout.ensure_runtime_dir()?;
    cmd.arg("--log-file").arg(layout.runtime_dir().join("ses.log"));
    cmd.arg("ses").arg("daemon");
    cmd.env(consts::AUTODAEMONIZE_VAR, "true");
    cmd.stdin(process::Stdio::null())
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null());
    let mut child = cmd.spawn().context("spawning ses daemon")?;
    // the autodaemonizing intermediate exits immediately; reap it
    let _ = child.wait();

    // spin until we can dial the socket successfully
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if UnixStream::connect(layout.ses_sock()).is_ok() {
            return Ok(());
        }
        std::thread::sleep(sleep_dur);
        sleep_dur *= 2;
    }
    Err(anyhow!("ses daemon did not come up"))
}

pub struct NewArgs {
    pub name: Option<String>,
    pub shell: Option<String>,
    pub keepalive: bool,
    pub sticky_key: Option<char>,
    pub isolate: bool,
}

/// `mux new`: register a session, create (or sticky-adopt) one pane,
/// and attach interactively. Returns the child's exit status.
pub fn run_new(layout: &Layout, args: NewArgs) -> anyhow::Result<i32> {
    ensure_ses(layout)?;
    let mut client = MuxClient::connect(layout)?;
    client.register(None, args.keepalive, args.name.as_deref().unwrap_or(""))?;

    let cwd = env::current_dir()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();

    // a sticky pane waiting at this (cwd, key) beats a fresh shell
    let adopted = match args.sticky_key {
        Some(key) => match client.find_sticky(&cwd, key)? {
            Some(found) => {
                info!("adopting sticky pane {}", found.pane);
                Some(client.adopt_pane(found.pane)?)
            }
            None => None,
        },
        None => None,
    };

    let (pane, socket) = match adopted {
        Some(found) => (found.pane, found.socket),
        None => {
            let created = client.create_pane(CreatePane {
                shell: args.shell.unwrap_or_default(),
                cwd: cwd.clone(),
                sticky_key: args.sticky_key,
                sticky_pwd: args.sticky_key.map(|_| cwd.clone()),
                isolate: args.isolate,
                env: vec![],
            })?;
            (created.pane, created.socket)
        }
    };
    client.sync_state(&format!("{{\"panes\":[\"{pane}\"]}}"))?;

    attach_pane(&socket)
}

/// `mux attach`: consume a detached session and reattach every pane.
pub fn run_attach(layout: &Layout, prefix: &str) -> anyhow::Result<i32> {
    ensure_ses(layout)?;
    let mut client = MuxClient::connect(layout)?;
    client.register(None, true, "")?;

    let session = client.reattach(prefix)?;
    if session.panes.is_empty() {
        return Err(anyhow!("session has no panes"));
    }
    let mut sockets = vec![];
    for pane in session.panes.iter() {
        let found = client.adopt_pane(*pane)?;
        sockets.push(found.socket);
    }
    client.sync_state(&session.layout)?;
    info!(
        "reattached {} ({} panes); attaching to the first",
        session.session_name,
        sockets.len()
    );

    attach_pane(&sockets[0])
}

fn attach_pane(socket: &str) -> anyhow::Result<i32> {
    let mut stream = UnixStream::connect(socket)
        .context(format!("connecting to pod at {socket:?}"))?;
    use std::io::Write as _;
    stream.write_all(&[PodHandshake::Vt as u8]).context("writing pod handshake")?;
    pod::attach_stream(stream)
}

pub struct FloatArgs {
    pub cmd: String,
    pub title: String,
    pub cwd: String,
    pub result_path: String,
    pub wait: bool,
    pub target: Option<Uid>,
    pub env: Vec<(String, String)>,
}

/// `mux float`: ask a connected mux to open a transient float pane.
pub fn run_float(layout: &Layout, args: FloatArgs) -> anyhow::Result<i32> {
    let mut channel = ses::cli_channel(layout)?;
    let flags = if args.wait { FLOAT_WAIT_FOR_EXIT } else { 0 };
    let reply = channel.roundtrip(&CtlMessage::FloatRequest(FloatRequest {
        flags,
        cmd: args.cmd,
        title: args.title,
        cwd: args.cwd,
        result_path: args.result_path,
        env: args.env,
        target: args.target.unwrap_or_else(Uid::nil),
    }))?;
    match reply {
        CtlMessage::FloatCreated(created) => {
            println!("{}", created.pane);
            Ok(0)
        }
        CtlMessage::FloatResult(result) => {
            if !result.output.is_empty() {
                print!("{}", result.output);
            }
            Ok(result.exit_code)
        }
        other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    }
}

/// `mux notify`: broadcast (no uuid) or target a session/pane.
pub fn run_notify(layout: &Layout, target: Option<&str>, msg: &str) -> anyhow::Result<i32> {
    let target = parse_target(target)?;
    let mut channel = ses::cli_channel(layout)?;
    channel.roundtrip(&CtlMessage::Notify(Notify {
        target,
        msg: String::from(msg),
        timeout_ms: None,
    }))?;
    Ok(0)
}

/// `mux send`: bytes into a pane's pty via ses.
pub fn run_send(layout: &Layout, target: Option<&str>, data: &[u8]) -> anyhow::Result<i32> {
    let target = parse_target(target)?;
    let mut channel = ses::cli_channel(layout)?;
    channel.roundtrip(&CtlMessage::SendKeys(SendKeys { target, data: data.to_vec() }))?;
    Ok(0)
}

/// `mux info`: one pane's full snapshot.
pub fn run_info(layout: &Layout, pane: &str, json: bool) -> anyhow::Result<i32> {
    let pane = Uid::from_str(pane).context("parsing pane uuid")?;
    let mut channel = ses::cli_channel(layout)?;
    let reply = channel.roundtrip(&CtlMessage::GetPaneInfo(PaneRef { pane }))?;
    let info = match reply {
        CtlMessage::PaneInfo(info) => info,
        other => return Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("pane {}", info.pane);
        println!("  state {}", info.state);
        println!("  pod_pid {} child_pid {}", info.pod_pid, info.child_pid);
        println!("  socket {}", info.socket);
        println!("  cwd {}", info.cwd);
        if let Some(fg) = &info.foreground {
            println!("  foreground {} ({})", fg.name, fg.pid);
        }
        if let Some(session) = info.session_id {
            println!("  session {}", session);
        }
    }
    Ok(0)
}

/// `mux focus`: ask the owning mux to move focus off a pane.
pub fn run_focus(layout: &Layout, pane: &str, dir: FocusDir) -> anyhow::Result<i32> {
    let pane = Uid::from_str(pane).context("parsing pane uuid")?;
    let mut channel = ses::cli_channel(layout)?;
    match channel.roundtrip(&CtlMessage::FocusMove(FocusMove { pane, dir })) {
        Ok(_) => Ok(0),
        Err(e) => {
            warn!("focus request failed: {:#}", e);
            Err(e)
        }
    }
}

fn parse_target(target: Option<&str>) -> anyhow::Result<Option<Uid>> {
    match target {
        None => Ok(None),
        Some(raw) => Ok(Some(Uid::from_str(raw).context("parsing target uuid")?)),
    }
}
