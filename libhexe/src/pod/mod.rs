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

//! Pod process management and the pod CLI verbs.

use std::{
    io::{self, Read as _, Write as _},
    os::unix::{io::AsRawFd, net::UnixStream},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Instant,
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    encode_frame_header, FrameKind, FrameReader, PodHandshake, Uid,
};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    poll::{poll, PollFd, PollFlags},
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde_derive::Deserialize;
use tracing::{info, warn};

use crate::{consts, discovery, paths::Layout, tty};

pub mod backlog;
mod pty;
pub mod sandbox;
mod server;

pub use server::{run as run_daemon, PodArgs};

pub struct SpawnOpts {
    pub uuid: Uid,
    pub name: Option<String>,
    pub shell: String,
    pub cwd: String,
    pub isolate: bool,
    pub labels: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct SpawnedPod {
    pub uuid: Uid,
    pub pod_pid: i32,
    pub child_pid: i32,
    pub socket: PathBuf,
}

#[derive(Deserialize)]
struct ReadyInfo {
    r#type: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    pid: i32,
    #[serde(default)]
    pod_pid: i32,
    #[serde(default)]
    socket: String,
}

/// Launch a pod daemon process and block until its readiness line
/// (bounded by `POD_READY_TIMEOUT`, failing closed).
pub fn spawn_pod(layout: &Layout, opts: &SpawnOpts) -> anyhow::Result<SpawnedPod> {
    layout.ensure_runtime_dir()?;
    let exe = std::env::current_exe().context("resolving own binary path")?;
    let log_file = layout.runtime_dir().join(format!("pod-{}.log", &opts.uuid.hex()[..8]));

    let mut cmd = process::Command::new(exe);
    if let Some(instance) = &layout.instance {
        cmd.arg("-I").arg(instance);
    }
    cmd.arg("--log-file").arg(&log_file);
    cmd.arg("pod").arg("daemon");
    cmd.arg("--uuid").arg(opts.uuid.hex());
    cmd.arg("--shell").arg(&opts.shell);
    if !opts.cwd.is_empty() {
        cmd.arg("--cwd").arg(&opts.cwd);
    }
    if let Some(name) = &opts.name {
        cmd.arg("--name").arg(name);
    }
    if opts.isolate {
        cmd.arg("--isolate");
    }
    for label in opts.labels.iter() {
        cmd.arg("--label").arg(label);
    }
    for (key, value) in opts.env.iter() {
        cmd.arg("--env").arg(format!("{key}={value}"));
    }
    cmd.stdin(process::Stdio::null())
        .stdout(process::Stdio::piped())
        .stderr(process::Stdio::null());

    let mut child = cmd.spawn().context("spawning pod daemon")?;
    let stdout = child.stdout.take().ok_or(anyhow!("pod stdout not captured"))?;

    match read_ready_line(&stdout) {
        Ok(ready) if ready.r#type == "pod_ready" => {
            info!("pod {} ready (child pid {})", ready.uuid, ready.pid);
            Ok(SpawnedPod {
                uuid: opts.uuid,
                pod_pid: if ready.pod_pid > 0 { ready.pod_pid } else { child.id() as i32 },
                child_pid: ready.pid,
                socket: if ready.socket.is_empty() {
                    layout.pod_sock(opts.uuid)
                } else {
                    PathBuf::from(ready.socket)
                },
            })
        }
        Ok(ready) => {
            let _ = child.kill();
            Err(anyhow!("unexpected pod handshake type '{}'", ready.r#type))
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e).context("waiting for pod readiness")
        }
    }
}

/// Read the single newline-terminated readiness JSON line within the
/// deadline.
fn read_ready_line(stdout: &process::ChildStdout) -> anyhow::Result<ReadyInfo> {
    let fd = stdout.as_raw_fd();
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).context("setting pipe non-blocking")?;

    let deadline = Instant::now() + consts::POD_READY_TIMEOUT;
    let mut line = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(anyhow!("pod did not become ready within the deadline"));
        }
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, left.as_millis() as i32) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling pod stdout"),
        }

        let mut buf = [0u8; 256];
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => return Err(anyhow!("pod exited before becoming ready")),
            Ok(n) => {
                line.extend_from_slice(&buf[..n]);
                if let Some(pos) = line.iter().position(|b| *b == b'\n') {
                    return serde_json::from_slice(&line[..pos])
                        .context("parsing pod ready line");
                }
                if line.len() > 4096 {
                    return Err(anyhow!("pod ready line never terminated"));
                }
            }
            Err(nix::errno::Errno::EAGAIN) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("reading pod stdout"),
        }
    }
}

/// Write bytes into a pod's pty via its aux input channel
/// (handshake 0x03): no backlog, no broadcast, just input.
pub fn send_input(socket: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut stream = UnixStream::connect(socket)
        .context(format!("connecting to pod at {socket:?}"))?;
    stream.write_all(&[PodHandshake::AuxInput as u8]).context("writing handshake")?;
    stream.write_all(&encode_frame_header(FrameKind::Input, data.len()))
        .context("writing input frame header")?;
    stream.write_all(data).context("writing input frame")?;
    stream.flush().context("flushing input frame")?;
    Ok(())
}

/// Resolve a CLI pod target: a uuid prefix or a pod name.
fn resolve_target(layout: &Layout, target: &str) -> anyhow::Result<discovery::PodRecord> {
    let pods = discovery::scan(layout, false, None)?;
    let matches: Vec<&discovery::DiscoveredPod> = pods
        .iter()
        .filter(|p| p.record.uuid.hex().starts_with(target) || p.record.name == target)
        .collect();
    match matches.len() {
        0 => Err(anyhow!("no pod matches '{}'", target)),
        1 => Ok(matches[0].record.clone()),
        n => Err(anyhow!("'{}' is ambiguous ({} pods match)", target, n)),
    }
}

//
// CLI verbs
//

pub struct NewArgs {
    pub name: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub isolate: bool,
    pub labels: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// `pod new`: spawn a standalone pod and print its identity.
pub fn run_new(layout: &Layout, args: NewArgs) -> anyhow::Result<()> {
    let shell = args
        .shell
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| String::from("/bin/sh"));
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let opts = SpawnOpts {
        uuid: Uid::generate(),
        name: args.name,
        shell,
        cwd,
        isolate: args.isolate,
        labels: args.labels,
        env: args.env,
    };
    let spawned = spawn_pod(layout, &opts)?;
    println!("{} pid={} child_pid={}", spawned.uuid, spawned.pod_pid, spawned.child_pid);
    Ok(())
}

/// `pod list`: the discovery scan, as text or JSON.
pub fn run_list(layout: &Layout, json: bool, label: Option<&str>) -> anyhow::Result<()> {
    let filter = label.map(|wanted| {
        let wanted = String::from(wanted);
        move |record: &discovery::PodRecord| record.labels.iter().any(|l| *l == wanted)
    });
    let filter_ref = filter.as_ref().map(|f| f as &dyn Fn(&discovery::PodRecord) -> bool);
    let pods = discovery::scan(layout, true, filter_ref)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pods)?);
        return Ok(());
    }
    println!("UUID\tNAME\tPID\tCHILD\tALIVE\tCWD");
    for pod in pods.iter() {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            &pod.record.uuid.hex()[..8],
            if pod.record.name.is_empty() { "-" } else { &pod.record.name },
            pod.record.pid,
            pod.record.child_pid,
            pod.alive.map(|a| if a { "yes" } else { "no" }).unwrap_or("?"),
            pod.record.cwd,
        );
    }
    Ok(())
}

/// `pod send`: one-shot aux input.
pub fn run_send(layout: &Layout, target: &str, data: &[u8]) -> anyhow::Result<()> {
    let record = resolve_target(layout, target)?;
    send_input(&layout.pod_sock(record.uuid), data)
}

/// `pod kill`: terminate the pod daemon; it tears the child down.
pub fn run_kill(layout: &Layout, target: &str) -> anyhow::Result<()> {
    let record = resolve_target(layout, target)?;
    kill(Pid::from_raw(record.pid), Signal::SIGTERM)
        .context(format!("signaling pod {}", record.pid))?;
    println!("killed {}", record.uuid);
    Ok(())
}

/// `pod gc`: scrub dead meta files and dangling aliases.
pub fn run_gc(layout: &Layout) -> anyhow::Result<()> {
    let removed = discovery::gc(layout)?;
    println!("removed {removed} stale entries");
    Ok(())
}

/// `pod attach`: interactive raw-mode bridge between the local tty
/// and a pod's VT channel. Returns the child's exit status when the
/// pod reports one.
pub fn run_attach(layout: &Layout, target: &str) -> anyhow::Result<i32> {
    let record = resolve_target(layout, target)?;
    let socket = layout.pod_sock(record.uuid);
    let mut stream = UnixStream::connect(&socket)
        .context(format!("connecting to pod at {socket:?}"))?;
    stream.write_all(&[PodHandshake::Vt as u8]).context("writing handshake")?;
    attach_stream(stream)
}

/// The bidirectional pump shared by `pod attach` and `mux new`: one
/// thread shuffling stdin into input frames, one decoding pod frames
/// onto stdout. Exits when the pod closes or reports the child exit.
pub fn attach_stream(stream: UnixStream) -> anyhow::Result<i32> {
    let tty_guard = tty::AttachFlagsGuard::acquire()?;

    // tell the pod how big our terminal is before any bytes flow
    if let Ok(size) = tty::Size::from_fd(0) {
        let mut sized = stream.try_clone().context("cloning stream for resize")?;
        let payload = size.to_frame_payload();
        let _ = sized.write_all(&encode_frame_header(FrameKind::Resize, payload.len()));
        let _ = sized.write_all(&payload);
    }

    let winch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(&winch))
        .context("registering SIGWINCH flag")?;

    let mut write_stream = stream.try_clone().context("cloning write stream")?;
    let mut read_stream = stream.try_clone().context("cloning read stream")?;

    // stdin -> pod. Detached on purpose: there is no portable way to
    // unblock a thread parked in a terminal read, and the process is
    // about to exit when the other direction finishes anyway.
    let winch_flag = Arc::clone(&winch);
    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = vec![0u8; consts::BUF_SIZE];
        loop {
            if winch_flag.swap(false, Ordering::Relaxed) {
                if let Ok(size) = tty::Size::from_fd(0) {
                    let payload = size.to_frame_payload();
                    let _ = write_stream
                        .write_all(&encode_frame_header(FrameKind::Resize, payload.len()));
                    let _ = write_stream.write_all(&payload);
                }
            }
            let n = match stdin.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            };
            if write_stream
                .write_all(&encode_frame_header(FrameKind::Input, n))
                .and_then(|_| write_stream.write_all(&buf[..n]))
                .is_err()
            {
                return;
            }
        }
    });

    // pod -> stdout, on this thread
    let mut exit_status = 0;
    let mut stdout = io::stdout().lock();
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; consts::BUF_SIZE];
    'pump: loop {
        let n = match read_stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        let mut saw_exit = None;
        reader.feed(&buf[..n], |frame| match frame.kind {
            FrameKind::Output => {
                let _ = stdout.write_all(frame.data);
            }
            FrameKind::BacklogEnd => {
                let _ = stdout.flush();
            }
            FrameKind::Control => {
                if let Ok(note) = serde_json::from_slice::<serde_json::Value>(frame.data) {
                    if note.get("type").and_then(|t| t.as_str()) == Some("exited") {
                        saw_exit =
                            Some(note.get("status").and_then(|s| s.as_i64()).unwrap_or(0) as i32);
                    }
                }
            }
            _ => {}
        });
        let _ = stdout.flush();
        if let Some(status) = saw_exit {
            exit_status = status;
            break 'pump;
        }
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);

    drop(tty_guard);
    if exit_status != 0 {
        warn!("pod child exited with {}", exit_status);
    }
    Ok(exit_status)
}
