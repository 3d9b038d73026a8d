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

//! Popup CLI verbs. Each dials ses one-shot; ses relays to the mux
//! that owns the target and relays the answer (or a cancellation)
//! back. Exit codes are the contract: confirm 0=yes 1=no/cancelled,
//! choose 0 with the index on stdout, 1 on cancel.

use std::str::FromStr;

use anyhow::{anyhow, Context};
use hexe_protocol::{CtlMessage, Notify, PopChoose, PopConfirm, PopOutcome, Uid};

use crate::{paths::Layout, ses};

pub fn run_notify(layout: &Layout, target: Option<&str>, msg: &str) -> anyhow::Result<i32> {
    let target = match target {
        Some(raw) => Some(Uid::from_str(raw).context("parsing target uuid")?),
        None => None,
    };
    let mut channel = ses::cli_channel(layout)?;
    channel.roundtrip(&CtlMessage::Notify(Notify {
        target,
        msg: String::from(msg),
        timeout_ms: None,
    }))?;
    Ok(0)
}

pub fn run_confirm(
    layout: &Layout,
    target: &str,
    timeout_ms: Option<u64>,
    message: &str,
) -> anyhow::Result<i32> {
    let target = Uid::from_str(target).context("parsing target uuid")?;
    let mut channel = ses::cli_channel(layout)?;
    let reply = channel.roundtrip(&CtlMessage::PopConfirm(PopConfirm {
        target,
        timeout_ms,
        message: String::from(message),
    }))?;
    match reply {
        CtlMessage::PopReply(r) => match r.outcome {
            PopOutcome::Confirmed(true) => Ok(0),
            PopOutcome::Confirmed(false) | PopOutcome::Cancelled => Ok(1),
            PopOutcome::Chosen(_) => Err(anyhow!("choose outcome for a confirm popup")),
        },
        other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    }
}

pub fn run_choose(
    layout: &Layout,
    target: &str,
    timeout_ms: Option<u64>,
    title: &str,
    items: Vec<String>,
) -> anyhow::Result<i32> {
    if items.is_empty() {
        return Err(anyhow!("nothing to choose from"));
    }
    let target = Uid::from_str(target).context("parsing target uuid")?;
    let mut channel = ses::cli_channel(layout)?;
    let reply = channel.roundtrip(&CtlMessage::PopChoose(PopChoose {
        target,
        timeout_ms,
        title: String::from(title),
        items,
    }))?;
    match reply {
        CtlMessage::PopReply(r) => match r.outcome {
            PopOutcome::Chosen(index) => {
                println!("{index}");
                Ok(0)
            }
            PopOutcome::Cancelled => Ok(1),
            PopOutcome::Confirmed(_) => Err(anyhow!("confirm outcome for a choose popup")),
        },
        other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    }
}
