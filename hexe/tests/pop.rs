use std::{
    process::{Child, Stdio},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use hexe_protocol::{CtlMessage, FloatAck, PopOutcome, PopResponse, Uid};
use libhexe::mux::MuxClient;
use ntest::timeout;

mod support;

use support::daemon::SesProc;

/// Pull events until the predicate matches one, bounded by a deadline.
fn await_event<F>(client: &mut MuxClient, mut want: F) -> anyhow::Result<CtlMessage>
where
    F: FnMut(&CtlMessage) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(event) = client.poll_event(Duration::from_millis(100))? {
            if want(&event) {
                return Ok(event);
            }
        }
    }
    Err(anyhow!("no matching event before the deadline"))
}

fn wait_exit(mut child: Child, within: Duration) -> anyhow::Result<(i32, Vec<u8>)> {
    let deadline = Instant::now() + within;
    loop {
        if let Some(status) = child.try_wait().context("polling popup cli")? {
            let mut stdout = vec![];
            if let Some(mut pipe) = child.stdout.take() {
                use std::io::Read as _;
                let _ = pipe.read_to_end(&mut stdout);
            }
            return Ok((status.code().unwrap_or(-1), stdout));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            return Err(anyhow!("popup cli still running past the deadline"));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
#[timeout(30000)]
fn confirm_reaches_mux_and_returns_yes() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("pop-yes").context("starting daemon")?;
    let mut mux = daemon.mux_client()?;
    mux.register(None, true, "popper")?;
    let session = mux.session_id;

    let cli = daemon
        .cmd()
        .arg("pop")
        .arg("confirm")
        .arg("--uuid")
        .arg(session.hex())
        .arg("proceed?")
        .stdout(Stdio::piped())
        .spawn()?;

    let event = await_event(&mut mux, |e| matches!(e, CtlMessage::PopConfirmEvent(_)))?;
    let request_id = match event {
        CtlMessage::PopConfirmEvent(e) => {
            assert_eq!(e.message, "proceed?");
            e.request_id
        }
        _ => unreachable!(),
    };
    mux.send(&CtlMessage::PopResponse(PopResponse {
        request_id,
        outcome: PopOutcome::Confirmed(true),
    }))?;

    let (code, stdout) = wait_exit(cli, Duration::from_secs(5))?;
    assert_eq!(code, 0);
    assert!(stdout.is_empty());

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn confirm_cancelled_when_mux_disconnects() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("pop-drop").context("starting daemon")?;
    let mut mux = daemon.mux_client()?;
    mux.register(None, true, "")?;
    let session = mux.session_id;

    let cli = daemon
        .cmd()
        .arg("pop")
        .arg("confirm")
        .arg("--uuid")
        .arg(session.hex())
        .arg("ok?")
        .stdout(Stdio::piped())
        .spawn()?;

    await_event(&mut mux, |e| matches!(e, CtlMessage::PopConfirmEvent(_)))?;
    // the mux goes away before answering
    drop(mux);

    let (code, stdout) = wait_exit(cli, Duration::from_secs(2))?;
    assert_eq!(code, 1);
    assert!(stdout.is_empty(), "stdout must stay empty on cancellation");

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn confirm_times_out_against_a_silent_mux() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("pop-timeout").context("starting daemon")?;
    let mut mux = daemon.mux_client()?;
    mux.register(None, true, "")?;
    let session = mux.session_id;

    let cli = daemon
        .cmd()
        .arg("pop")
        .arg("confirm")
        .arg("--uuid")
        .arg(session.hex())
        .arg("--timeout-ms")
        .arg("200")
        .arg("waiting?")
        .stdout(Stdio::piped())
        .spawn()?;

    // the mux sees the popup but never replies
    await_event(&mut mux, |e| matches!(e, CtlMessage::PopConfirmEvent(_)))?;

    let (code, stdout) = wait_exit(cli, Duration::from_secs(3))?;
    assert_eq!(code, 1);
    assert!(stdout.is_empty());

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn choose_returns_the_picked_index() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("pop-choose").context("starting daemon")?;
    let mut mux = daemon.mux_client()?;
    mux.register(None, true, "")?;
    let session = mux.session_id;

    let cli = daemon
        .cmd()
        .arg("pop")
        .arg("choose")
        .arg("--uuid")
        .arg(session.hex())
        .arg("--title")
        .arg("pick one")
        .arg("red")
        .arg("green")
        .arg("blue")
        .stdout(Stdio::piped())
        .spawn()?;

    let event = await_event(&mut mux, |e| matches!(e, CtlMessage::PopChooseEvent(_)))?;
    let request_id = match event {
        CtlMessage::PopChooseEvent(e) => {
            assert_eq!(e.title, "pick one");
            assert_eq!(e.items, vec!["red", "green", "blue"]);
            e.request_id
        }
        _ => unreachable!(),
    };
    mux.send(&CtlMessage::PopResponse(PopResponse {
        request_id,
        outcome: PopOutcome::Chosen(2),
    }))?;

    let (code, stdout) = wait_exit(cli, Duration::from_secs(5))?;
    assert_eq!(code, 0);
    assert_eq!(String::from_utf8_lossy(&stdout).trim(), "2");

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn notify_is_routed_to_the_target_mux() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("pop-notify").context("starting daemon")?;
    let mut mux = daemon.mux_client()?;
    mux.register(None, true, "")?;
    let session = mux.session_id;

    let out = daemon
        .cmd()
        .arg("pop")
        .arg("notify")
        .arg("--uuid")
        .arg(session.hex())
        .arg("build done")
        .output()?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let event = await_event(&mut mux, |e| matches!(e, CtlMessage::NotifyEvent(_)))?;
    match event {
        CtlMessage::NotifyEvent(n) => assert_eq!(n.msg, "build done"),
        _ => unreachable!(),
    }

    // an unknown target is an error, not a hang
    let out = daemon
        .cmd()
        .arg("pop")
        .arg("notify")
        .arg("--uuid")
        .arg(Uid::generate().hex())
        .arg("nobody home")
        .output()?;
    assert!(!out.status.success());

    daemon.stop_gracefully()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn float_round_trips_through_the_mux() -> anyhow::Result<()> {
    let mut daemon = SesProc::new("pop-float").context("starting daemon")?;
    let mut mux = daemon.mux_client()?;
    mux.register(None, true, "floaty")?;

    let cli = daemon
        .cmd()
        .arg("mux")
        .arg("float")
        .arg("--title")
        .arg("scratch")
        .arg("htop")
        .stdout(Stdio::piped())
        .spawn()?;

    let event = await_event(&mut mux, |e| matches!(e, CtlMessage::FloatOpenEvent(_)))?;
    let request_id = match event {
        CtlMessage::FloatOpenEvent(e) => {
            assert_eq!(e.cmd, "htop");
            assert_eq!(e.title, "scratch");
            e.request_id
        }
        _ => unreachable!(),
    };
    // a real mux would create the pane; the ack is all ses needs
    let pane = Uid::generate();
    mux.send(&CtlMessage::FloatAck(FloatAck { request_id, pane }))?;

    let (code, stdout) = wait_exit(cli, Duration::from_secs(5))?;
    assert_eq!(code, 0);
    assert_eq!(String::from_utf8_lossy(&stdout).trim(), pane.hex());

    daemon.stop_gracefully()?;
    Ok(())
}
