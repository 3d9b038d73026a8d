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

//! Pty allocation and the fork/exec dance. The child-side order is
//! load-bearing: setsid, steal the controlling tty, wire up stdio,
//! chdir, sandbox, build the environment, exec.

use std::{env, ffi::CString, os::unix::io::RawFd, path::Path};

use anyhow::{anyhow, Context};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    pty::{openpty, OpenptyResult, Winsize},
    unistd::{self, ForkResult, Pid},
};
use tracing::info;

use crate::{pod::sandbox, tty::Size};

nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

pub struct PtyChild {
    /// The master side. This process is its only owner, ever.
    pub master: RawFd,
    pub pid: Pid,
}

pub struct SpawnArgs {
    pub shell: String,
    pub cwd: String,
    /// Appended last, in order, overriding anything inherited.
    pub extra_env: Vec<(String, String)>,
    pub isolate: bool,
    pub size: Size,
}

/// Fork the pty child. The parent gets the master fd (set
/// non-blocking) and the child pid; the child never returns.
pub fn spawn(args: &SpawnArgs) -> anyhow::Result<PtyChild> {
    let ws = Winsize {
        ws_row: args.size.rows,
        ws_col: args.size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(Some(&ws), None).context("opening pty pair")?;

    // Everything the child needs, allocated before the fork.
    let (shell_c, argv) = build_argv(&args.shell)?;
    let envp = build_env(&args.extra_env);
    let isolate_userns = args.isolate
        && env::var(crate::consts::ENV_ISOLATE_USERNS).map(|v| v == "1").unwrap_or(false);

    // Safety: we exec or exit on the child side without touching
    // parent state beyond the prepared CStrings.
    match unsafe { unistd::fork() }.context("forking pty child")? {
        ForkResult::Child => {
            let _ = unistd::setsid();
            // Safety: slave is our own freshly opened tty fd. Arg 0
            // steals the controlling terminal if something else holds
            // it.
            unsafe {
                let _ = tiocsctty(slave, 0);
            }
            let _ = unistd::dup2(slave, 0);
            let _ = unistd::dup2(slave, 1);
            let _ = unistd::dup2(slave, 2);
            if slave > 2 {
                let _ = unistd::close(slave);
            }
            let _ = unistd::close(master);

            if !args.cwd.is_empty() {
                let _ = unistd::chdir(Path::new(&args.cwd));
            }

            if args.isolate {
                if isolate_userns {
                    sandbox::enter_userns();
                }
                sandbox::apply_landlock(&args.cwd);
            }

            let _ = unistd::execvpe(&shell_c, &argv, &envp);
            // exec only comes back on failure
            eprintln!("shell exec err: {}", std::io::Error::last_os_error());
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            let _ = unistd::close(slave);
            fcntl(master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .context("setting master non-blocking")?;
            info!("spawned {} as pid {}", args.shell, child);
            Ok(PtyChild { master, pid: child })
        }
    }
}

/// A bare shell path is spawned as a login shell by making arg0 the
/// basename prefixed with a dash, the same trick sshd uses. A command
/// line with arguments is split shell-words style and exec'd as is.
fn build_argv(shell: &str) -> anyhow::Result<(CString, Vec<CString>)> {
    let parts = shell_words::split(shell).context("parsing shell command")?;
    if parts.len() > 1 {
        let file = CString::new(parts[0].as_str()).context("command contains NUL")?;
        let argv = parts
            .iter()
            .map(|p| CString::new(p.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("command contains NUL")?;
        return Ok((file, argv));
    }

    let basename = Path::new(shell)
        .file_name()
        .ok_or(anyhow!("shell path has no basename"))?
        .to_str()
        .ok_or(anyhow!("shell path is not utf8"))?;
    let file = CString::new(shell).context("shell path contains NUL")?;
    let argv = vec![CString::new(format!("-{basename}")).context("shell basename contains NUL")?];
    Ok((file, argv))
}

/// The child environment: everything inherited except keys we
/// override, then `BOX=1` and `TERM=xterm-256color`, then the caller's
/// extras in order.
fn build_env(extra: &[(String, String)]) -> Vec<CString> {
    let mut overridden: Vec<&str> = vec!["BOX", "TERM"];
    for (key, _) in extra.iter() {
        overridden.push(key.as_str());
    }

    let mut entries: Vec<String> = env::vars()
        .filter(|(key, _)| !overridden.contains(&key.as_str()))
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    entries.push(String::from("BOX=1"));
    entries.push(String::from("TERM=xterm-256color"));
    for (key, value) in extra.iter() {
        entries.push(format!("{key}={value}"));
    }

    entries.into_iter().filter_map(|entry| CString::new(entry).ok()).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_shell_becomes_a_login_shell() {
        let (file, argv) = build_argv("/bin/zsh").expect("argv");
        assert_eq!(file, CString::new("/bin/zsh").unwrap());
        assert_eq!(argv, vec![CString::new("-zsh").unwrap()]);
        assert!(build_argv("/").is_err());
    }

    #[test]
    fn command_lines_are_split() {
        let (file, argv) = build_argv("python3 -m http.server 8080").expect("argv");
        assert_eq!(file, CString::new("python3").unwrap());
        assert_eq!(
            argv,
            vec![
                CString::new("python3").unwrap(),
                CString::new("-m").unwrap(),
                CString::new("http.server").unwrap(),
                CString::new("8080").unwrap(),
            ]
        );
    }

    #[test]
    fn env_overrides_and_appends() {
        std::env::set_var("HEXE_PTY_TEST_KEEP", "yes");
        std::env::set_var("HEXE_PTY_TEST_CLOBBER", "old");
        let envp = build_env(&[
            (String::from("HEXE_PTY_TEST_CLOBBER"), String::from("new")),
        ]);
        let entries: Vec<String> =
            envp.iter().map(|e| e.to_str().unwrap().to_string()).collect();

        assert!(entries.contains(&String::from("BOX=1")));
        assert!(entries.contains(&String::from("TERM=xterm-256color")));
        assert!(entries.contains(&String::from("HEXE_PTY_TEST_KEEP=yes")));
        assert!(entries.contains(&String::from("HEXE_PTY_TEST_CLOBBER=new")));
        assert!(!entries.contains(&String::from("HEXE_PTY_TEST_CLOBBER=old")));
        // extras land after the BOX/TERM defaults
        let box_at = entries.iter().position(|e| e == "BOX=1").unwrap();
        let clobber_at =
            entries.iter().position(|e| e == "HEXE_PTY_TEST_CLOBBER=new").unwrap();
        assert!(clobber_at > box_at);
    }
}
