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

//! The ses registry daemon and its CLI verbs.

use std::env;

use anyhow::{anyhow, Context};
use chrono::{TimeZone, Utc};
use hexe_protocol::{CtlMessage, SesHandshake, StatusReply, StatusRequest};
use tracing::info;

use crate::{consts, paths::Layout, protocol::Channel};

pub mod persist;
pub mod registry;
mod server;

pub fn run_daemon(layout: Layout) -> anyhow::Result<()> {
    if let Ok(daemonize) = env::var(consts::AUTODAEMONIZE_VAR) {
        if daemonize == "true" {
            env::remove_var(consts::AUTODAEMONIZE_VAR); // avoid looping

            layout.ensure_runtime_dir()?;
            let pid_file = layout.runtime_dir().join("ses.pid");
            info!("daemonizing with pid_file={:?}", pid_file);
            daemonize::Daemonize::new().pid_file(pid_file).start().context("daemonizing")?;
        }
    }

    info!("\n\n======================== STARTING SES DAEMON ============================\n\n");
    server::run(layout)
}

/// Open a one-shot CLI channel, or explain that nothing is listening.
pub fn cli_channel(layout: &Layout) -> anyhow::Result<Channel> {
    Channel::connect(layout.ses_sock(), SesHandshake::Cli as u8).map_err(|_| {
        anyhow!("ses daemon is not running")
    })
}

pub fn run_status(layout: &Layout, full: bool, json: bool) -> anyhow::Result<()> {
    let mut channel = cli_channel(layout)?;
    let reply = channel.roundtrip(&CtlMessage::Status(StatusRequest { full }))?;
    let status = match reply {
        CtlMessage::StatusReply(s) => s,
        other => return Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    print_status(&status, full);
    Ok(())
}

fn print_status(status: &StatusReply, full: bool) {
    println!("clients:");
    for client in status.clients.iter() {
        println!(
            "  [{}] {} ({}) keepalive={} panes={}",
            client.client_id,
            client.session_name,
            &client.session_id.hex()[..8],
            client.keepalive,
            client.panes.len(),
        );
        if let (true, Some(layout)) = (full, &client.layout) {
            if !layout.is_empty() {
                println!("    layout: {layout}");
            }
        }
    }

    println!("detached sessions:");
    for session in status.detached.iter() {
        println!(
            "  {} ({}) panes={} detached_at={}",
            session.session_name,
            &session.session_id.hex()[..8],
            session.pane_count,
            format_unix(session.detached_at_unix),
        );
    }

    println!("panes:");
    for pane in status.panes.iter() {
        let mut extra = String::new();
        if let Some(key) = pane.sticky_key {
            extra.push_str(&format!(" sticky_key={key}"));
        }
        if let Some(pwd) = &pane.sticky_pwd {
            extra.push_str(&format!(" sticky_pwd={pwd}"));
        }
        println!(
            "  {} {} pod={} child={} cwd={}{}",
            &pane.pane.hex()[..8],
            pane.state,
            pane.pod_pid,
            pane.child_pid,
            pane.cwd,
            extra,
        );
    }
}

pub fn run_list(layout: &Layout) -> anyhow::Result<()> {
    let mut channel = cli_channel(layout)?;
    let reply = channel.roundtrip(&CtlMessage::ListSessions)?;
    let sessions = match reply {
        CtlMessage::SessionsList(s) => s.sessions,
        other => return Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    };

    println!("NAME\tSESSION\tPANES\tDETACHED_AT");
    for session in sessions.iter() {
        println!(
            "{}\t{}\t{}\t{}",
            session.session_name,
            &session.session_id.hex()[..8],
            session.pane_count,
            format_unix(session.detached_at_unix),
        );
    }
    Ok(())
}

fn format_unix(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(t) => t.to_rfc3339(),
        None => String::from("-"),
    }
}
