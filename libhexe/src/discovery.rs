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

//! Pod discovery. Every pod drops a one-line `pod-<uuid>.meta` file in
//! the runtime dir; liveness is whether the sibling socket still
//! accepts connections. No registry involved, so `pod list` works even
//! when ses is down.

use std::{
    fs,
    io::Write as _,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context};
use hexe_protocol::Uid;
use serde_derive::Serialize;
use tracing::{debug, info, warn};

use crate::paths::Layout;

const META_MAGIC: &str = "HEXE_POD";

/// The parsed contents of one pod meta line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PodRecord {
    pub uuid: Uid,
    pub name: String,
    pub pid: i32,
    pub child_pid: i32,
    pub cwd: String,
    pub shell: String,
    pub isolated: bool,
    pub labels: Vec<String>,
    pub created_at: i64,
}

impl PodRecord {
    /// Render the single meta line, trailing newline included.
    pub fn to_line(&self) -> String {
        format!(
            "{} uuid={} name={} pid={} child_pid={} cwd={} shell={} isolated={} labels={} created_at={}\n",
            META_MAGIC,
            self.uuid,
            self.name,
            self.pid,
            self.child_pid,
            self.cwd,
            self.shell,
            if self.isolated { 1 } else { 0 },
            self.labels.join(","),
            self.created_at,
        )
    }

    /// Parse a meta line. Unknown keys are ignored, absent values
    /// default.
    pub fn parse(line: &str) -> anyhow::Result<PodRecord> {
        let line = line.trim_end();
        let mut parts = line.split(' ');
        if parts.next() != Some(META_MAGIC) {
            return Err(anyhow!("missing {} magic", META_MAGIC));
        }

        let mut record = PodRecord::default();
        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match key {
                "uuid" => record.uuid = Uid::from_str(value).context("parsing uuid")?,
                "name" => record.name = String::from(value),
                "pid" => record.pid = value.parse().unwrap_or(0),
                "child_pid" => record.child_pid = value.parse().unwrap_or(0),
                "cwd" => record.cwd = String::from(value),
                "shell" => record.shell = String::from(value),
                "isolated" => record.isolated = value == "1",
                "labels" => {
                    record.labels = value
                        .split(',')
                        .filter(|l| !l.is_empty())
                        .map(String::from)
                        .collect()
                }
                "created_at" => record.created_at = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if record.uuid.is_nil() {
            return Err(anyhow!("meta line carries no uuid"));
        }
        Ok(record)
    }

    /// Atomically write the meta file next to the pod socket.
    pub fn write(&self, layout: &Layout) -> anyhow::Result<()> {
        let path = layout.pod_meta(self.uuid);
        let dir = path.parent().ok_or(anyhow!("meta path has no parent"))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating tmp meta file")?;
        tmp.write_all(self.to_line().as_bytes()).context("writing meta line")?;
        tmp.persist(&path).context("renaming meta file into place")?;
        debug!("wrote meta file {:?}", path);
        Ok(())
    }
}

/// One scan result: the record plus whether its socket still answers.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPod {
    #[serde(flatten)]
    pub record: PodRecord,
    pub socket: PathBuf,
    /// None when the caller skipped the liveness probe.
    pub alive: Option<bool>,
}

fn connectable(sock: &Path) -> bool {
    UnixStream::connect(sock).is_ok()
}

/// Scan the runtime dir for pod meta files.
///
/// `probe` dials each sibling socket to determine liveness, and
/// `filter` (when given) keeps only records it returns true for.
pub fn scan(
    layout: &Layout,
    probe: bool,
    filter: Option<&dyn Fn(&PodRecord) -> bool>,
) -> anyhow::Result<Vec<DiscoveredPod>> {
    let mut found = vec![];
    let entries = match fs::read_dir(layout.runtime_dir()) {
        Ok(entries) => entries,
        // no runtime dir simply means nothing is running
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e).context("reading runtime dir"),
    };

    for entry in entries {
        let entry = entry.context("reading runtime dir entry")?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if !name.starts_with("pod-") || !name.ends_with(".meta") {
            continue;
        }

        let contents = match fs::read_to_string(entry.path()) {
            Ok(c) => c,
            Err(e) => {
                warn!("unreadable meta file {:?}: {}", entry.path(), e);
                continue;
            }
        };
        let record = match PodRecord::parse(&contents) {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping mangled meta file {:?}: {}", entry.path(), e);
                continue;
            }
        };

        if let Some(filter) = filter {
            if !filter(&record) {
                continue;
            }
        }

        let socket = layout.pod_sock(record.uuid);
        let alive = if probe { Some(connectable(&socket)) } else { None };
        found.push(DiscoveredPod { record, socket, alive });
    }

    found.sort_by_key(|p| p.record.created_at);
    Ok(found)
}

/// Delete meta files whose socket no longer answers, and alias
/// symlinks whose target no longer answers. Returns how many entries
/// were removed.
pub fn gc(layout: &Layout) -> anyhow::Result<usize> {
    let mut removed = 0;

    for pod in scan(layout, true, None)? {
        if pod.alive == Some(false) {
            info!("gc: removing dead pod {}", pod.record.uuid);
            let _ = fs::remove_file(layout.pod_meta(pod.record.uuid));
            let _ = fs::remove_file(&pod.socket);
            removed += 1;
        }
    }

    let entries = match fs::read_dir(layout.runtime_dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e).context("reading runtime dir"),
    };
    for entry in entries {
        let entry = entry.context("reading runtime dir entry")?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if !name.starts_with("pod@") || !name.ends_with(".sock") {
            continue;
        }
        let target = match fs::read_link(entry.path()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let target = if target.is_absolute() {
            target
        } else {
            layout.runtime_dir().join(target)
        };
        if !connectable(&target) {
            info!("gc: removing dangling alias {:?}", entry.path());
            let _ = fs::remove_file(entry.path());
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> PodRecord {
        PodRecord {
            uuid: Uid::from_str("00112233445566778899aabbccddeeff").unwrap(),
            name: String::from("build"),
            pid: 4242,
            child_pid: 4243,
            cwd: String::from("/home/user/src"),
            shell: String::from("/bin/zsh"),
            isolated: true,
            labels: vec![String::from("ci"), String::from("scratch")],
            created_at: 1700000000,
        }
    }

    #[test]
    fn meta_line_round_trip() {
        let record = sample();
        let line = record.to_line();
        assert!(line.starts_with("HEXE_POD uuid="));
        assert!(line.ends_with('\n'));
        assert_eq!(PodRecord::parse(&line).expect("parse to succeed"), record);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let line = "HEXE_POD uuid=00112233445566778899aabbccddeeff pid=7 flavor=mint\n";
        let record = PodRecord::parse(line).expect("parse to succeed");
        assert_eq!(record.pid, 7);
        assert_eq!(record.name, "");
        assert_eq!(record.labels, Vec::<String>::new());
    }

    #[test]
    fn missing_magic_is_rejected() {
        assert!(PodRecord::parse("SOMETHING_ELSE uuid=00112233445566778899aabbccddeeff").is_err());
        assert!(PodRecord::parse("").is_err());
    }

    #[test]
    fn missing_uuid_is_rejected() {
        assert!(PodRecord::parse("HEXE_POD pid=12").is_err());
    }

    #[test]
    fn empty_labels_parse_empty() {
        let line = "HEXE_POD uuid=00112233445566778899aabbccddeeff labels=\n";
        let record = PodRecord::parse(line).expect("parse to succeed");
        assert!(record.labels.is_empty());
    }
}
