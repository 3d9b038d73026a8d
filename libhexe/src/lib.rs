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

//! libhexe is the implementation of the hexe terminal multiplexer
//! control plane: the `ses` registry daemon, the per-pane `pod`
//! daemons, and the `mux`/`shp`/`pop` client verbs.

use std::{fs, io, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use hexe_protocol::{FocusDir, Uid};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod consts;
mod discovery;
pub mod mux;
mod names;
pub mod paths;
mod pop;
pub mod pod;
pub mod protocol;
pub mod ses;
mod shp;
mod signals;
mod tty;

use paths::Layout;

/// The command line arguments that hexe expects. These can be directly
/// parsed with clap or manually constructed in order to present some
/// other user interface.
///
/// NOTE: You must check `version()` and handle it yourself if it is
/// set. Clap won't do a good job with its automatic version support
/// for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        global = true,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if a daemon runs in
the foreground, logs go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short = 'I',
        long,
        action,
        global = true,
        help = "Namespace all sockets and state under this instance name"
    )]
    pub instance: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(subcommand, about = "The per-instance registry daemon")]
    Ses(SesCommand),

    #[clap(subcommand, about = "Per-pane pty daemons")]
    Pod(PodCommand),

    #[clap(subcommand, about = "Mux-side control plane verbs")]
    Mux(MuxCommand),

    #[clap(subcommand, about = "Shell prompt integration")]
    Shp(ShpCommand),

    #[clap(subcommand, about = "Popups routed through a running mux")]
    Pop(PopCommand),
}

#[derive(Subcommand, Debug)]
pub enum SesCommand {
    #[clap(about = "Run the registry daemon for this instance")]
    Daemon,

    #[clap(about = "Show clients, detached sessions, and panes")]
    Status {
        #[clap(long, help = "Include layout blobs and full pane snapshots")]
        full: bool,
        #[clap(long, help = "Emit JSON instead of text")]
        json: bool,
    },

    #[clap(about = "List detached sessions available for reattach")]
    List,
}

#[derive(Subcommand, Debug)]
pub enum PodCommand {
    #[clap(about = "Run one pod daemon in the foreground (internal)")]
    Daemon {
        #[clap(long, help = "The pane uuid, 32 hex chars; generated if absent")]
        uuid: Option<String>,
        #[clap(long, help = "Optional friendly name, published as an alias symlink")]
        name: Option<String>,
        #[clap(long, help = "The shell or command to run")]
        shell: Option<String>,
        #[clap(long, help = "Working directory for the child")]
        cwd: Option<String>,
        #[clap(long, help = "Sandbox the child (Landlock + cgroup)")]
        isolate: bool,
        #[clap(long = "label", help = "Discovery labels, repeatable")]
        labels: Vec<String>,
        #[clap(long = "env", help = "KEY=VALUE for the child env, repeatable")]
        env: Vec<String>,
    },

    #[clap(about = "Spawn a standalone pod and print its identity")]
    New {
        #[clap(long)]
        name: Option<String>,
        #[clap(long)]
        shell: Option<String>,
        #[clap(long)]
        cwd: Option<String>,
        #[clap(long)]
        isolate: bool,
        #[clap(long = "label")]
        labels: Vec<String>,
        #[clap(long = "env")]
        env: Vec<String>,
    },

    #[clap(about = "Scan for pods via their discovery metadata")]
    List {
        #[clap(long, help = "Emit JSON instead of text")]
        json: bool,
        #[clap(long, help = "Keep only pods carrying this label")]
        label: Option<String>,
    },

    #[clap(about = "Write bytes into a pod's pty")]
    Send {
        #[clap(help = "A pod uuid prefix or name")]
        target: String,
        #[clap(help = "Text to send; joined with spaces")]
        text: Vec<String>,
    },

    #[clap(about = "Attach the current terminal to a pod")]
    Attach {
        #[clap(help = "A pod uuid prefix or name")]
        target: String,
    },

    #[clap(about = "Terminate a pod (and with it, its shell)")]
    Kill {
        #[clap(help = "A pod uuid prefix or name")]
        target: String,
    },

    #[clap(about = "Remove metadata for pods that no longer answer")]
    Gc,
}

#[derive(Subcommand, Debug)]
pub enum MuxCommand {
    #[clap(about = "Create a session with one pane and attach to it")]
    New {
        #[clap(long, help = "Session name; a random one is picked if absent")]
        name: Option<String>,
        #[clap(long, help = "Shell override for the pane")]
        shell: Option<String>,
        #[clap(long, help = "Kill the pane on disconnect instead of detaching")]
        no_keepalive: bool,
        #[clap(long, help = "Sticky key: makes the pane re-adoptable at this cwd")]
        sticky_key: Option<char>,
        #[clap(long, help = "Sandbox the pane")]
        isolate: bool,
        #[clap(
            short = 'T',
            long,
            help = "Test isolation: always use a generated instance name"
        )]
        test_only: bool,
    },

    #[clap(about = "Reattach a detached session")]
    Attach {
        #[clap(help = "A session id prefix or session name")]
        session: String,
    },

    #[clap(about = "Open a transient float pane on a running mux")]
    Float {
        #[clap(long, help = "Block until the float exits, then print its output")]
        wait: bool,
        #[clap(long, help = "Float window title")]
        title: Option<String>,
        #[clap(long, help = "Working directory for the float command")]
        cwd: Option<String>,
        #[clap(long, help = "File the float writes its result into")]
        result_path: Option<String>,
        #[clap(long, help = "Target session uuid; any mux if absent")]
        uuid: Option<String>,
        #[clap(long = "env", help = "KEY=VALUE for the float env, repeatable")]
        env: Vec<String>,
        #[clap(help = "The command to run")]
        cmd: String,
    },

    #[clap(about = "Send a notification to one target or every mux")]
    Notify {
        #[clap(long, help = "A pane or session uuid; broadcast if absent")]
        uuid: Option<String>,
        #[clap(help = "The notification text")]
        msg: String,
    },

    #[clap(about = "Send keys to a pane (or broadcast to all panes)")]
    Send {
        #[clap(long, help = "The pane uuid; broadcast if absent")]
        uuid: Option<String>,
        #[clap(help = "Text to send; joined with spaces")]
        text: Vec<String>,
    },

    #[clap(about = "Show everything ses knows about a pane")]
    Info {
        #[clap(long, help = "The pane uuid")]
        uuid: String,
        #[clap(long, help = "Emit JSON instead of text")]
        json: bool,
    },

    #[clap(about = "Ask the owning mux to move focus")]
    Focus {
        #[clap(long, help = "The pane uuid")]
        uuid: String,
        #[clap(long, help = "left, right, up, or down")]
        dir: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ShpCommand {
    #[clap(about = "Print the shell rc snippet for prompt integration")]
    Init {
        #[clap(long, default_value = "bash", help = "bash or zsh")]
        shell: String,
    },

    #[clap(about = "Print the prompt prefix for the current pane")]
    Prompt,

    #[clap(about = "Ask whether the shell may exit (0 allow, 1 deny)")]
    ExitIntent,

    #[clap(about = "Report one command lifecycle event to the pod")]
    ShellEvent {
        #[clap(long, help = "This is a command start, not an end")]
        begin: bool,
        #[clap(long, default_value = "", help = "The command line")]
        cmd: String,
        #[clap(long, help = "Exit status, for command ends")]
        status: Option<i32>,
        #[clap(long, help = "Wall time in milliseconds, for command ends")]
        duration_ms: Option<u64>,
        #[clap(long, default_value_t = 0, help = "Background job count")]
        jobs: u32,
        #[clap(long, help = "Shell working directory")]
        cwd: Option<String>,
        #[clap(long, help = "Wallclock start, unix seconds")]
        started_at_unix: Option<i64>,
    },

    #[clap(about = "Print one spinner frame")]
    Spinner {
        #[clap(long, default_value_t = 0)]
        tick: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum PopCommand {
    #[clap(about = "Send a notification through the popup surface")]
    Notify {
        #[clap(long, help = "A pane or session uuid; broadcast if absent")]
        uuid: Option<String>,
        #[clap(help = "The notification text")]
        msg: String,
    },

    #[clap(about = "Yes/no popup: exit 0 on yes, 1 on no/cancel/timeout")]
    Confirm {
        #[clap(long, help = "The target pane or session uuid")]
        uuid: String,
        #[clap(long, help = "Cancel automatically after this many milliseconds")]
        timeout_ms: Option<u64>,
        #[clap(help = "The question to show")]
        message: String,
    },

    #[clap(about = "Pick-one popup: prints the index, exit 1 on cancel")]
    Choose {
        #[clap(long, help = "The target pane or session uuid")]
        uuid: String,
        #[clap(long, help = "Cancel automatically after this many milliseconds")]
        timeout_ms: Option<u64>,
        #[clap(long, default_value = "", help = "The popup title")]
        title: String,
        #[clap(help = "The items to choose between")]
        items: Vec<String>,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

fn is_daemon(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Ses(SesCommand::Daemon) | Commands::Pod(PodCommand::Daemon { .. })
    )
}

fn parse_env_pairs(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (String::from(k), String::from(v)))
                .ok_or(anyhow!("'{}' is not KEY=VALUE", entry))
        })
        .collect()
}

fn parse_dir(raw: &str) -> anyhow::Result<FocusDir> {
    match raw {
        "left" => Ok(FocusDir::Left),
        "right" => Ok(FocusDir::Right),
        "up" => Ok(FocusDir::Up),
        "down" => Ok(FocusDir::Down),
        other => Err(anyhow!("'{}' is not a direction (left|right|up|down)", other)),
    }
}

/// Run the hexe tool with the given arguments, returning the process
/// exit code.
pub fn run(args: Args) -> anyhow::Result<i32> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if is_daemon(&args.command) {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let test_only_env =
        std::env::var(consts::ENV_TEST_ONLY).map(|v| v == "1").unwrap_or(false);
    let layout = match &args.command {
        Commands::Mux(MuxCommand::New { test_only, .. }) if *test_only || test_only_env => {
            Layout::resolve_test_only(args.instance.as_deref())?
        }
        _ => Layout::resolve(args.instance.as_deref())?,
    };

    let res: anyhow::Result<i32> = match args.command {
        Commands::Version => Err(anyhow!("wrapper binary must handle version")),

        Commands::Ses(SesCommand::Daemon) => ses::run_daemon(layout).map(|_| 0),
        Commands::Ses(SesCommand::Status { full, json }) => {
            ses::run_status(&layout, full, json).map(|_| 0)
        }
        Commands::Ses(SesCommand::List) => ses::run_list(&layout).map(|_| 0),

        Commands::Pod(PodCommand::Daemon { uuid, name, shell, cwd, isolate, labels, env }) => {
            let uuid = match uuid {
                Some(raw) => raw.parse::<Uid>().context("parsing --uuid")?,
                None => Uid::generate(),
            };
            let shell = shell
                .or_else(|| std::env::var("SHELL").ok())
                .unwrap_or_else(|| String::from("/bin/sh"));
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            pod::run_daemon(
                layout,
                pod::PodArgs {
                    uuid,
                    name,
                    shell,
                    cwd,
                    isolate,
                    labels,
                    env: parse_env_pairs(&env)?,
                },
            )
            .map(|_| 0)
        }
        Commands::Pod(PodCommand::New { name, shell, cwd, isolate, labels, env }) => pod::run_new(
            &layout,
            pod::NewArgs { name, shell, cwd, isolate, labels, env: parse_env_pairs(&env)? },
        )
        .map(|_| 0),
        Commands::Pod(PodCommand::List { json, label }) => {
            pod::run_list(&layout, json, label.as_deref()).map(|_| 0)
        }
        Commands::Pod(PodCommand::Send { target, text }) => {
            pod::run_send(&layout, &target, text.join(" ").as_bytes()).map(|_| 0)
        }
        Commands::Pod(PodCommand::Attach { target }) => pod::run_attach(&layout, &target),
        Commands::Pod(PodCommand::Kill { target }) => pod::run_kill(&layout, &target).map(|_| 0),
        Commands::Pod(PodCommand::Gc) => pod::run_gc(&layout).map(|_| 0),

        Commands::Mux(MuxCommand::New {
            name,
            shell,
            no_keepalive,
            sticky_key,
            isolate,
            test_only: _,
        }) => mux::run_new(
            &layout,
            mux::NewArgs { name, shell, keepalive: !no_keepalive, sticky_key, isolate },
        ),
        Commands::Mux(MuxCommand::Attach { session }) => mux::run_attach(&layout, &session),
        Commands::Mux(MuxCommand::Float { wait, title, cwd, result_path, uuid, env, cmd }) => {
            let target = match uuid {
                Some(raw) => Some(raw.parse::<Uid>().context("parsing --uuid")?),
                None => None,
            };
            mux::run_float(
                &layout,
                mux::FloatArgs {
                    cmd,
                    title: title.unwrap_or_default(),
                    cwd: cwd.unwrap_or_default(),
                    result_path: result_path.unwrap_or_default(),
                    wait,
                    target,
                    env: parse_env_pairs(&env)?,
                },
            )
        }
        Commands::Mux(MuxCommand::Notify { uuid, msg }) => {
            mux::run_notify(&layout, uuid.as_deref(), &msg)
        }
        Commands::Mux(MuxCommand::Send { uuid, text }) => {
            mux::run_send(&layout, uuid.as_deref(), text.join(" ").as_bytes())
        }
        Commands::Mux(MuxCommand::Info { uuid, json }) => mux::run_info(&layout, &uuid, json),
        Commands::Mux(MuxCommand::Focus { uuid, dir }) => {
            mux::run_focus(&layout, &uuid, parse_dir(&dir)?)
        }

        Commands::Shp(ShpCommand::Init { shell }) => shp::run_init(&shell),
        Commands::Shp(ShpCommand::Prompt) => shp::run_prompt(),
        Commands::Shp(ShpCommand::ExitIntent) => shp::run_exit_intent(&layout),
        Commands::Shp(ShpCommand::ShellEvent {
            begin,
            cmd,
            status,
            duration_ms,
            jobs,
            cwd,
            started_at_unix,
        }) => shp::run_shell_event(shp::ShellEventArgs {
            begin,
            cmd,
            status,
            duration_ms,
            jobs,
            cwd,
            started_at_unix,
        }),
        Commands::Shp(ShpCommand::Spinner { tick }) => shp::run_spinner(tick),

        Commands::Pop(PopCommand::Notify { uuid, msg }) => {
            pop::run_notify(&layout, uuid.as_deref(), &msg)
        }
        Commands::Pop(PopCommand::Confirm { uuid, timeout_ms, message }) => {
            pop::run_confirm(&layout, &uuid, timeout_ms, &message)
        }
        Commands::Pop(PopCommand::Choose { uuid, timeout_ms, title, items }) => {
            pop::run_choose(&layout, &uuid, timeout_ms, &title, items)
        }
    };

    match res {
        Ok(code) => Ok(code),
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{err:#}");
            Ok(1)
        }
    }
}
