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

//! Shell prompt integration. These verbs run inside the user's shell
//! (wired up by `shp init`) and talk to the pod over its shell control
//! channel, or to ses for exit intents. The pod forwards; nothing here
//! interprets shell semantics.

use std::{env, io::Write as _, os::unix::net::UnixStream, str::FromStr};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    encode_frame_header, CtlMessage, FrameKind, PaneRef, PodHandshake, ShellUpdate, Uid,
};

use crate::{consts, paths::Layout, ses};

const SPINNER_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// `shp init`: print the rc snippet that wires a shell up to hexe.
pub fn run_init(shell: &str) -> anyhow::Result<i32> {
    let snippet = match shell {
        "bash" => BASH_SNIPPET,
        "zsh" => ZSH_SNIPPET,
        other => return Err(anyhow!("no shell integration for '{}'", other)),
    };
    print!("{snippet}");
    Ok(0)
}

/// `shp prompt`: the prompt prefix, empty outside a hexe pane.
pub fn run_prompt() -> anyhow::Result<i32> {
    if let Ok(uuid) = env::var(consts::ENV_PANE_UUID) {
        let short = if uuid.len() >= 8 { &uuid[..8] } else { uuid.as_str() };
        print!("hexe:{short} ");
    }
    Ok(0)
}

pub struct ShellEventArgs {
    pub begin: bool,
    pub cmd: String,
    pub status: Option<i32>,
    pub duration_ms: Option<u64>,
    pub jobs: u32,
    pub cwd: Option<String>,
    pub started_at_unix: Option<i64>,
}

/// `shp shell-event`: one prompt lifecycle report, as a JSON control
/// frame on the pod's shell control channel.
pub fn run_shell_event(args: ShellEventArgs) -> anyhow::Result<i32> {
    let socket = env::var(consts::ENV_POD_SOCKET)
        .context("HEXE_POD_SOCKET is unset; not inside a hexe pane")?;
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => env::current_dir()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let update = ShellUpdate {
        running: args.begin,
        cmd: args.cmd,
        status: args.status,
        duration_ms: args.duration_ms,
        jobs: args.jobs,
        cwd,
        started_at_unix: args.started_at_unix,
    };
    let body = serde_json::to_vec(&update).context("encoding shell event")?;

    let mut stream =
        UnixStream::connect(&socket).context(format!("connecting to pod at {socket}"))?;
    stream.write_all(&[PodHandshake::ShellCtl as u8]).context("writing handshake")?;
    stream
        .write_all(&encode_frame_header(FrameKind::Control, body.len()))
        .context("writing control frame header")?;
    stream.write_all(&body).context("writing control frame")?;
    stream.flush().context("flushing control frame")?;
    Ok(0)
}

/// `shp exit-intent`: ask the owning mux whether the shell may exit.
/// Exit code 0 allows, 1 denies.
pub fn run_exit_intent(layout: &Layout) -> anyhow::Result<i32> {
    let uuid = env::var(consts::ENV_PANE_UUID)
        .context("HEXE_PANE_UUID is unset; not inside a hexe pane")?;
    let pane = Uid::from_str(&uuid).context("parsing HEXE_PANE_UUID")?;

    let mut channel = ses::cli_channel(layout)?;
    let reply = channel.roundtrip(&CtlMessage::ExitIntent(PaneRef { pane }))?;
    match reply {
        CtlMessage::ExitIntentReply(r) if r.allow => Ok(0),
        CtlMessage::ExitIntentReply(_) => Ok(1),
        other => Err(anyhow!("unexpected reply {:?}", other.msg_type())),
    }
}

/// `shp spinner`: one frame of the prompt spinner.
pub fn run_spinner(tick: u64) -> anyhow::Result<i32> {
    print!("{}", SPINNER_FRAMES[(tick as usize) % SPINNER_FRAMES.len()]);
    Ok(0)
}

const BASH_SNIPPET: &str = r#"# hexe shell integration (bash)
if [ -n "$HEXE_POD_SOCKET" ]; then
  __hexe_preexec() {
    HEXE_CMD_START=$SECONDS
    hexe shp shell-event --begin --cmd "$BASH_COMMAND" 2>/dev/null
  }
  __hexe_precmd() {
    local status=$?
    local duration=$(( (SECONDS - ${HEXE_CMD_START:-$SECONDS}) * 1000 ))
    hexe shp shell-event --status "$status" --duration-ms "$duration" \
      --jobs "$(jobs -p | wc -l)" 2>/dev/null
  }
  trap '__hexe_preexec' DEBUG
  PROMPT_COMMAND="__hexe_precmd${PROMPT_COMMAND:+;$PROMPT_COMMAND}"
  PS1="$(hexe shp prompt)$PS1"
fi
"#;

const ZSH_SNIPPET: &str = r#"# hexe shell integration (zsh)
if [[ -n "$HEXE_POD_SOCKET" ]]; then
  __hexe_preexec() {
    HEXE_CMD_START=$EPOCHSECONDS
    hexe shp shell-event --begin --cmd "$1" 2>/dev/null
  }
  __hexe_precmd() {
    local status=$?
    local duration=$(( (EPOCHSECONDS - ${HEXE_CMD_START:-$EPOCHSECONDS}) * 1000 ))
    hexe shp shell-event --status "$status" --duration-ms "$duration" \
      --jobs "${#jobstates}" 2>/dev/null
  }
  autoload -Uz add-zsh-hook
  add-zsh-hook preexec __hexe_preexec
  add-zsh-hook precmd __hexe_precmd
  PROMPT="$(hexe shp prompt)$PROMPT"
fi
"#;
