use std::{
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use libhexe::mux::MuxClient;
use tempfile::TempDir;

use super::hexe_bin;

/// A handle for a `hexe ses daemon` subprocess with its own hermetic
/// runtime/state dirs. Kills the daemon when dropped.
pub struct SesProc {
    pub proc: process::Child,
    pub instance: String,
    local_tmp_dir: Option<TempDir>,
    pub tmp_dir: PathBuf,
    subproc_counter: usize,
}

impl SesProc {
    pub fn new(instance: &str) -> anyhow::Result<SesProc> {
        let local_tmp_dir = tempfile::Builder::new()
            .prefix("hexe-test")
            .tempdir()
            .context("creating tmp dir")?;
        let tmp_dir = local_tmp_dir.path().to_path_buf();
        let proc = Self::spawn_daemon(&tmp_dir, instance, 0)?;

        let mut daemon = SesProc {
            proc,
            instance: String::from(instance),
            local_tmp_dir: Some(local_tmp_dir),
            tmp_dir,
            subproc_counter: 1,
        };
        daemon.await_socket()?;
        Ok(daemon)
    }

    fn spawn_daemon(
        tmp_dir: &PathBuf,
        instance: &str,
        counter: usize,
    ) -> anyhow::Result<process::Child> {
        let log_file = tmp_dir.join(format!("ses_{counter}.log"));
        eprintln!("spawning ses daemon with log {:?}", &log_file);

        let mut cmd = Command::new(hexe_bin());
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("-I")
            .arg(instance)
            .arg("ses")
            .arg("daemon")
            .env("XDG_RUNTIME_DIR", tmp_dir.join("run"))
            .env("XDG_STATE_HOME", tmp_dir.join("state"))
            .env("SHELL", "/bin/sh")
            .env_remove("HEXE_INSTANCE");
        cmd.spawn().context("spawning ses daemon process")
    }

    fn await_socket(&self) -> anyhow::Result<()> {
        // spin until we can dial the socket successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..13 {
            if UnixStream::connect(self.ses_sock()).is_ok() {
                return Ok(());
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
        Err(anyhow!("ses daemon never bound {:?}", self.ses_sock()))
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.tmp_dir.join("run").join("hexe").join(&self.instance)
    }

    pub fn ses_sock(&self) -> PathBuf {
        self.runtime_dir().join("ses.sock")
    }

    /// A hexe CLI invocation wired to this daemon's dirs and instance.
    pub fn cmd(&mut self) -> Command {
        let log_file = self.tmp_dir.join(format!("cli_{}.log", self.subproc_counter));
        self.subproc_counter += 1;

        let mut cmd = Command::new(hexe_bin());
        cmd.arg("-vv")
            .arg("--log-file")
            .arg(log_file)
            .arg("-I")
            .arg(&self.instance)
            .env("XDG_RUNTIME_DIR", self.tmp_dir.join("run"))
            .env("XDG_STATE_HOME", self.tmp_dir.join("state"))
            .env("SHELL", "/bin/sh")
            .env_remove("HEXE_INSTANCE");
        cmd
    }

    /// An in-process mux control client.
    pub fn mux_client(&self) -> anyhow::Result<MuxClient> {
        MuxClient::connect_to(self.ses_sock())
    }

    /// SIGTERM and wait, so state gets persisted on the way down.
    pub fn stop_gracefully(&mut self) -> anyhow::Result<()> {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(self.proc.id() as i32),
            nix::sys::signal::Signal::SIGTERM,
        )
        .context("signaling ses daemon")?;
        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        loop {
            if self.proc.try_wait().context("waiting for ses daemon")?.is_some() {
                return Ok(());
            }
            if time::Instant::now() >= deadline {
                return Err(anyhow!("ses daemon ignored SIGTERM"));
            }
            std::thread::sleep(time::Duration::from_millis(20));
        }
    }

    /// Start the daemon again over the same dirs (after
    /// `stop_gracefully`), as a crash-restart would.
    pub fn restart(&mut self) -> anyhow::Result<()> {
        self.proc = Self::spawn_daemon(&self.tmp_dir, &self.instance, self.subproc_counter)?;
        self.subproc_counter += 1;
        self.await_socket()
    }

    /// The full `ses status --full --json` tree, parsed.
    pub fn status_json(&mut self) -> anyhow::Result<serde_json::Value> {
        let out = self
            .cmd()
            .arg("ses")
            .arg("status")
            .arg("--full")
            .arg("--json")
            .output()
            .context("running ses status")?;
        if !out.status.success() {
            return Err(anyhow!(
                "ses status failed: {}",
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        serde_json::from_slice(&out.stdout).context("parsing status json")
    }

    /// Terminate every pod named in a status tree. Tests must clean
    /// up their pods; they outlive the daemon by design.
    pub fn kill_pods(status: &serde_json::Value) {
        for pane in status["panes"].as_array().into_iter().flatten() {
            if let Some(pid) = pane["pod_pid"].as_i64() {
                if pid > 0 {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
            }
        }
    }
}

impl std::ops::Drop for SesProc {
    fn drop(&mut self) {
        if let Ok(status) = self.status_json() {
            Self::kill_pods(&status);
        }
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing ses daemon proc: {:?}", e);
        }
        if std::env::var("HEXE_LEAVE_TEST_LOGS").unwrap_or(String::from("")) == "true" {
            self.local_tmp_dir.take().map(|d| d.into_path());
        }
    }
}
