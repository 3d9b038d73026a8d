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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

/// How long a caller waits for a freshly spawned pod to print its
/// ready line before failing closed.
pub const POD_READY_TIMEOUT: time::Duration = time::Duration::from_millis(2500);

/// Pty output retained for replay on attach.
pub const BACKLOG_BYTES: usize = 4 * 1024 * 1024;

/// Backlog replay is chunked into output frames of at most this size.
pub const REPLAY_CHUNK: usize = 64 * 1024;

/// Frames a slow VT consumer may have queued before the pod drops it
/// and relies on backlog replay to catch it up on reattach.
pub const CONSUMER_QUEUE_MAX: usize = 64;

/// The poll loop tick in both daemons; drives dirty-state saves,
/// orphan GC, popup deadlines and /proc sampling.
pub const TICK_MS: i32 = 1000;

/// Grace period between SIGHUP and SIGKILL when a pod tears down
/// its child.
pub const CHILD_KILL_TIMEOUT: time::Duration = time::Duration::from_millis(500);

/// Hours an orphaned or sticky pane survives with no adoption.
pub const DEFAULT_ORPHAN_TIMEOUT_HOURS: f64 = 24.0;

pub const ENV_INSTANCE: &str = "HEXE_INSTANCE";
pub const ENV_TEST_ONLY: &str = "HEXE_TEST_ONLY";
pub const ENV_ISOLATE: &str = "HEXE_POD_ISOLATE";
pub const ENV_ISOLATE_USERNS: &str = "HEXE_POD_ISOLATE_USERNS";
pub const ENV_CGROUP_PIDS_MAX: &str = "HEXE_CGROUP_PIDS_MAX";
pub const ENV_CGROUP_MEM_MAX: &str = "HEXE_CGROUP_MEM_MAX";
pub const ENV_CGROUP_CPU_MAX: &str = "HEXE_CGROUP_CPU_MAX";
pub const ENV_ORPHAN_TIMEOUT_HOURS: &str = "HEXE_ORPHAN_TIMEOUT_HOURS";
pub const ENV_PANE_UUID: &str = "HEXE_PANE_UUID";
pub const ENV_MUX_SOCKET: &str = "HEXE_MUX_SOCKET";
pub const ENV_POD_SOCKET: &str = "HEXE_POD_SOCKET";

// If set to "true", `ses daemon` will autodaemonize after launch.
pub const AUTODAEMONIZE_VAR: &str = "HEXE__INTERNAL__AUTODAEMONIZE";
