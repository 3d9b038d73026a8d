use std::{collections::HashMap, process::Command, time::Duration};

use anyhow::Context;
use hexe_protocol::CreatePane;
use ntest::timeout;

mod support;

use support::{daemon::SesProc, hexe_bin};

fn wait_for_disconnect_notice() {
    // the daemon notices a closed control channel on its next poll
    // wakeup; give it a comfortable margin
    std::thread::sleep(Duration::from_millis(300));
}

fn child_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[test]
#[timeout(30000)]
fn list_without_daemon_reports_not_running() -> anyhow::Result<()> {
    let tmp_dir = tempfile::tempdir().context("creating tmp dir")?;
    let out = Command::new(hexe_bin())
        .arg("-I")
        .arg("dev")
        .arg("ses")
        .arg("list")
        .env("XDG_RUNTIME_DIR", tmp_dir.path().join("run"))
        .env("XDG_STATE_HOME", tmp_dir.path().join("state"))
        .env_remove("HEXE_INSTANCE")
        .output()
        .context("running ses list")?;

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("ses daemon is not running"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn instances_are_isolated() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("dev").context("starting daemon")?;

    // the same instance answers
    let out = daemon.cmd().arg("ses").arg("list").output()?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    // a different instance name sees nothing, even on the same dirs
    let out = Command::new(hexe_bin())
        .arg("-I")
        .arg("other")
        .arg("ses")
        .arg("list")
        .env("XDG_RUNTIME_DIR", daemon.tmp_dir.join("run"))
        .env("XDG_STATE_HOME", daemon.tmp_dir.join("state"))
        .env_remove("HEXE_INSTANCE")
        .output()?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("ses daemon is not running"));

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn invalid_handshake_byte_closes_the_connection() -> anyhow::Result<()> {
    use std::{
        io::{Read as _, Write as _},
        os::unix::net::UnixStream,
    };

    let mut daemon = SesProc::new("handshake").context("starting daemon")?;

    let mut stream = UnixStream::connect(daemon.ses_sock())?;
    stream.write_all(&[0x7f])?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 1];
    // the daemon hangs up without writing anything
    assert_eq!(stream.read(&mut buf)?, 0);

    // and keeps serving well-behaved channels
    let out = daemon.cmd().arg("ses").arg("list").output()?;
    assert!(out.status.success());

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn sticky_pane_survives_disconnect_and_adoption() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("sticky").context("starting daemon")?;

    // client A: one sticky pane, then an ungraceful disconnect
    let mut client_a = daemon.mux_client()?;
    client_a.register(None, true, "")?;
    let created = client_a.create_pane(CreatePane {
        shell: String::from("/bin/sh"),
        cwd: String::from("/tmp"),
        sticky_key: Some('1'),
        sticky_pwd: Some(String::from("/tmp")),
        isolate: false,
        env: vec![],
    })?;
    assert!(child_alive(created.child_pid), "shell child should be running");
    drop(client_a);
    wait_for_disconnect_notice();

    // the pane is now detached under the auto-assigned session
    let status = daemon.status_json()?;
    assert_eq!(status["panes"][0]["state"], "detached");
    assert_eq!(status["detached"].as_array().map(|d| d.len()), Some(1));

    // client B finds it by (pwd, key) and adopts it
    let mut client_b = daemon.mux_client()?;
    client_b.register(None, true, "")?;
    let found = client_b.find_sticky("/tmp", '1')?.expect("sticky pane to be found");
    assert_eq!(found.pane, created.pane);
    let adopted = client_b.adopt_pane(found.pane)?;
    assert_eq!(adopted.child_pid, created.child_pid);

    let info = client_b.pane_info(created.pane)?;
    assert_eq!(info.state, hexe_protocol::PaneState::Attached);
    assert!(child_alive(created.child_pid), "same shell child must survive the handoff");

    // teardown: the pod owns the shell; killing the pane ends both
    client_b.kill_pane(created.pane)?;
    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn detach_reattach_round_trip() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("rt").context("starting daemon")?;

    let mut client_a = daemon.mux_client()?;
    client_a.register(None, true, "roundtrip")?;
    let mut created = vec![];
    for _ in 0..2 {
        created.push(client_a.create_pane(CreatePane {
            shell: String::from("/bin/sh"),
            cwd: String::from("/tmp"),
            ..Default::default()
        })?);
    }
    let layout = "{\"tabs\":[{\"panes\":2}]}";
    client_a.sync_state(layout)?;
    drop(client_a);
    wait_for_disconnect_notice();

    let mut client_b = daemon.mux_client()?;
    client_b.register(None, true, "")?;
    let session = client_b.reattach("roundtrip")?;
    assert_eq!(session.layout, layout);
    assert_eq!(session.panes.len(), 2);
    for pane in session.panes.iter() {
        assert!(created.iter().any(|c| c.pane == *pane));
        client_b.adopt_pane(*pane)?;
    }

    let status = client_b.status(false)?;
    assert!(status.panes.iter().all(|p| p.state == hexe_protocol::PaneState::Attached));
    assert!(status.detached.is_empty(), "the snapshot must be consumed");

    for pane in session.panes.iter() {
        client_b.kill_pane(*pane)?;
    }
    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn state_survives_daemon_restart() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("persist").context("starting daemon")?;

    let mut client = daemon.mux_client()?;
    client.register(None, true, "keepme")?;
    for i in 0..3 {
        let sticky = i == 0;
        client.create_pane(CreatePane {
            shell: String::from("/bin/sh"),
            cwd: String::from("/tmp"),
            sticky_key: if sticky { Some('k') } else { None },
            sticky_pwd: if sticky { Some(String::from("/tmp")) } else { None },
            ..Default::default()
        })?;
    }
    client.sync_state("{\"tabs\":3}")?;
    drop(client);
    wait_for_disconnect_notice();

    let before = daemon.status_json()?;

    daemon.stop_gracefully()?;
    daemon.restart()?;

    let after = daemon.status_json()?;

    let index = |status: &serde_json::Value| -> HashMap<String, (String, i64, i64)> {
        status["panes"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|p| {
                (
                    p["pane"].as_str().unwrap_or_default().to_string(),
                    (
                        p["state"].as_str().unwrap_or_default().to_string(),
                        p["pod_pid"].as_i64().unwrap_or_default(),
                        p["child_pid"].as_i64().unwrap_or_default(),
                    ),
                )
            })
            .collect()
    };
    let before_panes = index(&before);
    let after_panes = index(&after);
    assert_eq!(before_panes.len(), 3);
    assert_eq!(before_panes, after_panes);

    // sticky metadata is preserved byte for byte
    let sticky_before: Vec<&serde_json::Value> = before["panes"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|p| !p["sticky_key"].is_null())
        .collect();
    let sticky_after: Vec<&serde_json::Value> = after["panes"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|p| !p["sticky_key"].is_null())
        .collect();
    assert_eq!(sticky_before.len(), 1);
    assert_eq!(sticky_before[0]["sticky_key"], sticky_after[0]["sticky_key"]);
    assert_eq!(sticky_before[0]["sticky_pwd"], sticky_after[0]["sticky_pwd"]);

    // the detached session came back too
    assert_eq!(after["detached"][0]["session_name"], "keepme");
    assert_eq!(after["detached"][0]["pane_count"], 3);

    SesProc::kill_pods(&after);
    daemon.stop_gracefully()?;
    Ok(())
}
