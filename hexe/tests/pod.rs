use std::{
    io::{Read as _, Write as _},
    os::unix::net::UnixStream,
    path::PathBuf,
    process::Command,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use hexe_protocol::{FrameKind, FrameReader};
use ntest::timeout;
use tempfile::TempDir;

mod support;

use support::hexe_bin;

struct PodFixture {
    tmp_dir: TempDir,
    instance: String,
    counter: usize,
}

impl PodFixture {
    fn new(instance: &str) -> anyhow::Result<PodFixture> {
        Ok(PodFixture {
            tmp_dir: tempfile::Builder::new().prefix("hexe-pod-test").tempdir()?,
            instance: String::from(instance),
            counter: 0,
        })
    }

    fn cmd(&mut self) -> Command {
        let log_file = self.tmp_dir.path().join(format!("cli_{}.log", self.counter));
        self.counter += 1;
        let mut cmd = Command::new(hexe_bin());
        cmd.arg("-vv")
            .arg("--log-file")
            .arg(log_file)
            .arg("-I")
            .arg(&self.instance)
            .env("XDG_RUNTIME_DIR", self.tmp_dir.path().join("run"))
            .env("XDG_STATE_HOME", self.tmp_dir.path().join("state"))
            .env("SHELL", "/bin/sh")
            .env_remove("HEXE_INSTANCE");
        cmd
    }

    fn runtime_dir(&self) -> PathBuf {
        self.tmp_dir.path().join("run").join("hexe").join(&self.instance)
    }

    fn pod_sock(&self, uuid: &str) -> PathBuf {
        self.runtime_dir().join(format!("pod-{uuid}.sock"))
    }

    fn pod_meta(&self, uuid: &str) -> PathBuf {
        self.runtime_dir().join(format!("pod-{uuid}.meta"))
    }

    /// `pod new` and hand back the printed uuid.
    fn spawn_pod(&mut self, name: &str) -> anyhow::Result<String> {
        let out = self
            .cmd()
            .arg("pod")
            .arg("new")
            .arg("--name")
            .arg(name)
            .arg("--shell")
            .arg("/bin/sh")
            .arg("--cwd")
            .arg("/tmp")
            .output()
            .context("running pod new")?;
        if !out.status.success() {
            return Err(anyhow!("pod new failed: {}", String::from_utf8_lossy(&out.stderr)));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let uuid = stdout.split_whitespace().next().unwrap_or_default().to_string();
        if uuid.len() != 32 {
            return Err(anyhow!("pod new printed no uuid: {stdout}"));
        }
        Ok(uuid)
    }
}

/// Read frames off a VT connection until the predicate matches,
/// collecting output bytes along the way.
fn read_until<F>(
    stream: &mut UnixStream,
    mut stop: F,
    within: Duration,
) -> anyhow::Result<Vec<u8>>
where
    F: FnMut(FrameKind, &[u8]) -> bool,
{
    stream.set_read_timeout(Some(Duration::from_millis(200)))?;
    let deadline = Instant::now() + within;
    let mut reader = FrameReader::new();
    let mut output = vec![];
    let mut buf = [0u8; 16 * 1024];
    let mut done = false;
    while !done {
        if Instant::now() >= deadline {
            return Err(anyhow!("frames never arrived; got {} bytes so far", output.len()));
        }
        let n = match stream.read(&mut buf) {
            Ok(0) => return Err(anyhow!("pod closed the vt channel")),
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e).context("reading vt channel"),
        };
        reader.feed(&buf[..n], |frame| {
            if frame.kind == FrameKind::Output {
                output.extend_from_slice(frame.data);
            }
            if stop(frame.kind, frame.data) {
                done = true;
            }
        });
    }
    Ok(output)
}

fn send_input(fixture: &PodFixture, uuid: &str, bytes: &[u8]) -> anyhow::Result<()> {
    libhexe::pod::send_input(&fixture.pod_sock(uuid), bytes)
}

#[test]
#[timeout(60000)]
fn pod_lifecycle_new_list_exit_gc() -> anyhow::Result<()> {
    let mut fixture = PodFixture::new("podlife")?;
    let uuid = fixture.spawn_pod("build")?;

    // discovery sees it, alive
    let out = fixture.cmd().arg("pod").arg("list").arg("--json").output()?;
    assert!(out.status.success());
    let pods: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(pods[0]["uuid"], uuid);
    assert_eq!(pods[0]["name"], "build");
    assert_eq!(pods[0]["alive"], true);

    // the alias symlink points at the socket
    assert!(fixture.runtime_dir().join("pod@build.sock").exists());

    // ask the shell to exit; the pod scrubs its own metadata
    send_input(&fixture, &uuid, b"exit 0\n")?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while fixture.pod_meta(&uuid).exists() {
        if Instant::now() >= deadline {
            return Err(anyhow!("pod never cleaned up its meta file"));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!fixture.pod_sock(&uuid).exists());

    // nothing left for gc to do
    let out = fixture.cmd().arg("pod").arg("gc").output()?;
    assert!(out.status.success());
    let out = fixture.cmd().arg("pod").arg("list").arg("--json").output()?;
    let pods: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(pods.as_array().map(|p| p.len()), Some(0));
    Ok(())
}

#[test]
#[timeout(60000)]
fn backlog_replays_before_live_output() -> anyhow::Result<()> {
    let mut fixture = PodFixture::new("backlog")?;
    let uuid = fixture.spawn_pod("scroll")?;

    // generate output while nothing is attached
    send_input(&fixture, &uuid, b"echo backlog-marker-123\n")?;
    std::thread::sleep(Duration::from_millis(700));

    // first attach: everything already produced arrives before
    // backlog_end
    let mut vt = UnixStream::connect(fixture.pod_sock(&uuid))?;
    vt.write_all(&[0x01])?;
    let backlog = read_until(
        &mut vt,
        |kind, _| kind == FrameKind::BacklogEnd,
        Duration::from_secs(10),
    )?;
    let backlog_text = String::from_utf8_lossy(&backlog);
    assert!(
        backlog_text.contains("backlog-marker-123"),
        "backlog was: {backlog_text:?}"
    );

    // live output keeps flowing on the same channel after the marker
    send_input(&fixture, &uuid, b"echo live-marker-456\n")?;
    let live = read_until(
        &mut vt,
        |kind, data| {
            kind == FrameKind::Output
                && String::from_utf8_lossy(data).contains("live-marker-456")
        },
        Duration::from_secs(10),
    )?;
    assert!(String::from_utf8_lossy(&live).contains("live-marker-456"));

    // a second consumer gets both markers as backlog
    let mut vt2 = UnixStream::connect(fixture.pod_sock(&uuid))?;
    vt2.write_all(&[0x01])?;
    let backlog2 = read_until(
        &mut vt2,
        |kind, _| kind == FrameKind::BacklogEnd,
        Duration::from_secs(10),
    )?;
    let text2 = String::from_utf8_lossy(&backlog2);
    assert!(text2.contains("backlog-marker-123"));
    assert!(text2.contains("live-marker-456"));

    // wind the pod down and confirm the exit control frame
    send_input(&fixture, &uuid, b"exit 3\n")?;
    let mut saw_status = None;
    let _ = read_until(
        &mut vt,
        |kind, data| {
            if kind == FrameKind::Control {
                if let Ok(note) = serde_json::from_slice::<serde_json::Value>(data) {
                    if note["type"] == "exited" {
                        saw_status = note["status"].as_i64();
                        return true;
                    }
                }
            }
            false
        },
        Duration::from_secs(10),
    );
    assert_eq!(saw_status, Some(3));
    Ok(())
}

#[test]
#[timeout(60000)]
fn aux_input_is_not_echoed_back_to_the_writer() -> anyhow::Result<()> {
    let mut fixture = PodFixture::new("aux")?;
    let uuid = fixture.spawn_pod("quiet")?;

    // an aux channel never receives backlog or output frames
    let mut aux = UnixStream::connect(fixture.pod_sock(&uuid))?;
    aux.write_all(&[0x03])?;
    aux.set_read_timeout(Some(Duration::from_millis(500)))?;
    let mut probe = [0u8; 64];
    match aux.read(&mut probe) {
        Ok(0) => return Err(anyhow!("pod closed the aux channel")),
        Ok(n) => return Err(anyhow!("aux channel unexpectedly got {n} bytes")),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut => {}
        Err(e) => return Err(e).context("probing aux channel"),
    }

    // cleanup
    send_input(&fixture, &uuid, b"exit\n")?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while fixture.pod_meta(&uuid).exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}
