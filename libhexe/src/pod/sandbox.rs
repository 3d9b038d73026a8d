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

//! Best-effort sandboxing for pty children: a Landlock ruleset (and
//! optionally a user+mount namespace) installed between fork and exec,
//! plus cgroup v2 limits applied by the parent.
//!
//! Every failure here degrades to a log line. A kernel without
//! Landlock still gets a working shell.

use std::{ffi::CString, fs, path::Path};

use tracing::{debug, warn};

use crate::consts;

// include/uapi/linux/landlock.h
const LANDLOCK_CREATE_RULESET_VERSION: u32 = 1 << 0;
const LANDLOCK_RULE_PATH_BENEATH: u32 = 1;

const ACCESS_FS_EXECUTE: u64 = 1 << 0;
const ACCESS_FS_WRITE_FILE: u64 = 1 << 1;
const ACCESS_FS_READ_FILE: u64 = 1 << 2;
const ACCESS_FS_READ_DIR: u64 = 1 << 3;
const ACCESS_FS_REMOVE_DIR: u64 = 1 << 4;
const ACCESS_FS_REMOVE_FILE: u64 = 1 << 5;
const ACCESS_FS_MAKE_CHAR: u64 = 1 << 6;
const ACCESS_FS_MAKE_DIR: u64 = 1 << 7;
const ACCESS_FS_MAKE_REG: u64 = 1 << 8;
const ACCESS_FS_MAKE_SOCK: u64 = 1 << 9;
const ACCESS_FS_MAKE_FIFO: u64 = 1 << 10;
const ACCESS_FS_MAKE_BLOCK: u64 = 1 << 11;
const ACCESS_FS_MAKE_SYM: u64 = 1 << 12;
const ACCESS_FS_REFER: u64 = 1 << 13;
const ACCESS_FS_TRUNCATE: u64 = 1 << 14;

const ACCESS_ABI_1: u64 = ACCESS_FS_EXECUTE
    | ACCESS_FS_WRITE_FILE
    | ACCESS_FS_READ_FILE
    | ACCESS_FS_READ_DIR
    | ACCESS_FS_REMOVE_DIR
    | ACCESS_FS_REMOVE_FILE
    | ACCESS_FS_MAKE_CHAR
    | ACCESS_FS_MAKE_DIR
    | ACCESS_FS_MAKE_REG
    | ACCESS_FS_MAKE_SOCK
    | ACCESS_FS_MAKE_FIFO
    | ACCESS_FS_MAKE_BLOCK
    | ACCESS_FS_MAKE_SYM;

const ACCESS_READ_ONLY: u64 = ACCESS_FS_EXECUTE | ACCESS_FS_READ_FILE | ACCESS_FS_READ_DIR;
const ACCESS_TRAVERSE: u64 = ACCESS_FS_READ_DIR;
const ACCESS_DEV_RW: u64 = ACCESS_FS_READ_FILE | ACCESS_FS_WRITE_FILE;

/// Read-only roots: binaries, libraries, system config.
const RO_PATHS: &[&str] = &["/bin", "/usr", "/lib", "/lib64", "/etc", "/proc", "/run"];
/// Traversal-only roots, so absolute paths keep resolving.
const DIR_PATHS: &[&str] = &["/", "/home", "/var"];
/// Fully writable trees beyond $HOME and the cwd.
const RW_PATHS: &[&str] = &["/tmp", "/var/tmp"];
/// Writable device nodes.
const DEV_PATHS: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
    "/dev/ptmx",
    "/dev/pts",
];

#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
}

#[repr(C, packed)]
struct PathBeneathAttr {
    allowed_access: u64,
    parent_fd: libc::c_int,
}

/// Probe the kernel; returns the Landlock ABI version if available.
fn landlock_abi() -> Option<libc::c_long> {
    // Safety: a null attr with the VERSION flag is the documented
    // probe form of this syscall.
    let abi = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            std::ptr::null::<RulesetAttr>(),
            0usize,
            LANDLOCK_CREATE_RULESET_VERSION,
        )
    };
    if abi < 1 {
        None
    } else {
        Some(abi)
    }
}

fn add_rule(ruleset_fd: libc::c_int, path: &str, access: u64, handled: u64) {
    let access = access & handled;
    if access == 0 {
        return;
    }
    let c_path = match CString::new(path) {
        Ok(p) => p,
        Err(_) => return,
    };
    // Safety: c_path outlives the call, O_PATH opens never block.
    let parent_fd = unsafe { libc::open(c_path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
    if parent_fd < 0 {
        // missing paths (no /lib64 on some distros) are fine
        return;
    }
    let attr = PathBeneathAttr { allowed_access: access, parent_fd };
    // Safety: attr is stack allocated and live for the whole call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_landlock_add_rule,
            ruleset_fd,
            LANDLOCK_RULE_PATH_BENEATH,
            &attr as *const PathBeneathAttr,
            0u32,
        )
    };
    if rc != 0 {
        debug!("landlock_add_rule({}) failed", path);
    }
    // Safety: parent_fd came from open above.
    unsafe {
        libc::close(parent_fd);
    }
}

/// Install the Landlock policy on the calling process. Runs in the
/// pty child between fork and exec.
pub fn apply_landlock(cwd: &str) {
    let abi = match landlock_abi() {
        Some(abi) => abi,
        None => {
            warn!("landlock unavailable, child runs unsandboxed");
            return;
        }
    };

    let mut handled = ACCESS_ABI_1;
    if abi >= 2 {
        handled |= ACCESS_FS_REFER;
    }
    if abi >= 3 {
        handled |= ACCESS_FS_TRUNCATE;
    }

    // Safety: basic prctl ffi; required before restrict_self without
    // CAP_SYS_ADMIN.
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            warn!("PR_SET_NO_NEW_PRIVS failed, skipping landlock");
            return;
        }
    }

    let attr = RulesetAttr { handled_access_fs: handled };
    // Safety: attr is stack allocated and live for the whole call.
    let ruleset_fd = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            &attr as *const RulesetAttr,
            std::mem::size_of::<RulesetAttr>(),
            0u32,
        )
    } as libc::c_int;
    if ruleset_fd < 0 {
        warn!("landlock_create_ruleset failed, child runs unsandboxed");
        return;
    }

    for path in RO_PATHS {
        add_rule(ruleset_fd, path, ACCESS_READ_ONLY, handled);
    }
    for path in DIR_PATHS {
        add_rule(ruleset_fd, path, ACCESS_TRAVERSE, handled);
    }
    for path in RW_PATHS {
        add_rule(ruleset_fd, path, handled, handled);
    }
    if let Ok(home) = std::env::var("HOME") {
        add_rule(ruleset_fd, &home, handled, handled);
    }
    if !cwd.is_empty() {
        add_rule(ruleset_fd, cwd, handled, handled);
    }
    for path in DEV_PATHS {
        add_rule(ruleset_fd, path, ACCESS_DEV_RW, handled);
    }

    // Safety: ruleset_fd came from landlock_create_ruleset above.
    let rc = unsafe { libc::syscall(libc::SYS_landlock_restrict_self, ruleset_fd, 0u32) };
    if rc != 0 {
        warn!("landlock_restrict_self failed, child runs unsandboxed");
    }
    // Safety: closing our own fd.
    unsafe {
        libc::close(ruleset_fd);
    }
}

/// Advisory user+mount namespace, only when
/// `HEXE_POD_ISOLATE_USERNS=1`. Maps the caller to root inside the
/// namespace so the shell still owns its files.
pub fn enter_userns() {
    // Safety: getuid/getgid are always safe.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    // Safety: basic unshare ffi; on failure we just stay in the
    // parent namespaces.
    let rc = unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) };
    if rc != 0 {
        warn!("unshare(CLONE_NEWUSER|CLONE_NEWNS) failed, continuing without");
        return;
    }
    let _ = fs::write("/proc/self/setgroups", "deny");
    let _ = fs::write("/proc/self/uid_map", format!("0 {uid} 1"));
    let _ = fs::write("/proc/self/gid_map", format!("0 {gid} 1"));
}

fn cgroup_v2_root() -> Option<String> {
    if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        return None;
    }
    let contents = fs::read_to_string("/proc/self/cgroup").ok()?;
    // a v2-only line looks like `0::/user.slice/...`
    let rel = contents.lines().find_map(|line| line.strip_prefix("0::"))?;
    Some(format!("/sys/fs/cgroup{}", rel.trim_end()))
}

/// Put the freshly forked child into its own cgroup with a pid cap
/// (and optional memory/cpu caps from the environment). Runs in the
/// parent; everything here is silent best-effort.
pub fn apply_cgroup(uuid8: &str, child_pid: libc::pid_t) {
    let root = match cgroup_v2_root() {
        Some(root) => root,
        None => {
            debug!("no cgroup v2, skipping resource limits");
            return;
        }
    };
    let dir = format!("{root}/hexe/pod-{uuid8}");
    if let Err(e) = fs::create_dir_all(&dir) {
        debug!("creating cgroup {}: {}", dir, e);
        return;
    }

    let pids_max = std::env::var(consts::ENV_CGROUP_PIDS_MAX)
        .unwrap_or_else(|_| String::from("512"));
    let _ = fs::write(format!("{dir}/pids.max"), &pids_max);
    if let Ok(mem) = std::env::var(consts::ENV_CGROUP_MEM_MAX) {
        let _ = fs::write(format!("{dir}/memory.max"), mem);
    }
    if let Ok(cpu) = std::env::var(consts::ENV_CGROUP_CPU_MAX) {
        let _ = fs::write(format!("{dir}/cpu.max"), cpu);
    }

    if let Err(e) = fs::write(format!("{dir}/cgroup.procs"), format!("{child_pid}")) {
        debug!("moving child into cgroup: {}", e);
    }
}

/// Remove the pod's cgroup directory on the way out.
pub fn cleanup_cgroup(uuid8: &str) {
    if let Some(root) = cgroup_v2_root() {
        let _ = fs::remove_dir(format!("{root}/hexe/pod-{uuid8}"));
    }
}
