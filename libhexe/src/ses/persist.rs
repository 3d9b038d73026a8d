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

//! ses state persistence: `ses_state.json`, written tmp-then-rename so
//! a crash mid-save can never leave a torn file. Loading tolerates a
//! missing file, unknown keys, and (logging loudly) a corrupt file.

use std::{fs, io::Write as _, path::PathBuf};

use anyhow::{anyhow, Context};
use hexe_protocol::{PaneState, Uid};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    paths::Layout,
    ses::registry::{DetachedSession, Pane, Registry},
};

#[derive(Serialize, Deserialize, Debug, Default)]
struct PaneFile {
    uuid: Uid,
    #[serde(default)]
    pod_pid: i32,
    #[serde(default)]
    child_pid: i32,
    #[serde(default)]
    socket: String,
    #[serde(default)]
    state: PaneState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sticky_pwd: Option<String>,
    /// The sticky key as its unicode scalar value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sticky_key: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<Uid>,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    orphaned_at: Option<i64>,
    #[serde(default)]
    seq: u16,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct DetachedSessionFile {
    session_id: Uid,
    #[serde(default)]
    session_name: String,
    #[serde(default)]
    detached_at: i64,
    /// The opaque mux layout blob.
    #[serde(default)]
    mux_state: String,
    #[serde(default)]
    panes: Vec<Uid>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StateFile {
    #[serde(default)]
    panes: Vec<PaneFile>,
    #[serde(default)]
    detached_sessions: Vec<DetachedSessionFile>,
}

fn to_file(registry: &Registry) -> StateFile {
    let mut panes: Vec<PaneFile> = registry
        .panes
        .values()
        .map(|p| PaneFile {
            uuid: p.id,
            pod_pid: p.pod_pid,
            child_pid: p.child_pid,
            socket: p.socket.to_string_lossy().into_owned(),
            state: p.state,
            name: p.name.clone(),
            sticky_pwd: p.sticky_pwd.clone(),
            sticky_key: p.sticky_key.map(|c| c as u32),
            session_id: p.session_id,
            cwd: p.cwd.clone(),
            created_at: p.created_at,
            orphaned_at: p.orphaned_at,
            seq: p.seq,
        })
        .collect();
    // deterministic output: saving twice with no mutation must write
    // identical bytes
    panes.sort_by_key(|p| p.uuid.hex());

    let mut detached_sessions: Vec<DetachedSessionFile> = registry
        .detached
        .values()
        .map(|d| DetachedSessionFile {
            session_id: d.session_id,
            session_name: d.session_name.clone(),
            detached_at: d.detached_at,
            mux_state: d.layout.clone(),
            panes: d.panes.clone(),
        })
        .collect();
    detached_sessions.sort_by_key(|d| d.session_id.hex());

    StateFile { panes, detached_sessions }
}

/// Serialize the registry and rename it into place.
pub fn save(layout: &Layout, registry: &Registry) -> anyhow::Result<()> {
    layout.ensure_state_dir()?;
    let path = layout.state_file();
    let dir = path.parent().ok_or(anyhow!("state file has no parent dir"))?;

    let state = to_file(registry);
    let bytes = serde_json::to_vec_pretty(&state).context("serializing state")?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating tmp state file")?;
    tmp.write_all(&bytes).context("writing state")?;
    tmp.persist(&path).context("renaming state file into place")?;
    info!(
        "saved {} panes, {} detached sessions to {:?}",
        state.panes.len(),
        state.detached_sessions.len(),
        path
    );
    Ok(())
}

/// Load persisted state into the registry. A missing file is a clean
/// first start; a corrupt file is logged and skipped, never fatal.
pub fn load(layout: &Layout, registry: &mut Registry) {
    let path = layout.state_file();
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("could not read state file {:?}: {}", path, e);
            return;
        }
    };
    let state: StateFile = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!("state file {:?} is corrupt, starting empty: {}", path, e);
            return;
        }
    };

    let panes = state
        .panes
        .into_iter()
        .map(|p| Pane {
            id: p.uuid,
            pod_pid: p.pod_pid,
            child_pid: p.child_pid,
            socket: PathBuf::from(p.socket),
            state: p.state,
            name: p.name,
            kind: Default::default(),
            is_focused: false,
            created_from: Uid::nil(),
            focused_from: Uid::nil(),
            cwd: p.cwd,
            foreground: None,
            cursor: Default::default(),
            alt_screen: false,
            last_shell: None,
            sticky_key: p.sticky_key.and_then(char::from_u32),
            sticky_pwd: p.sticky_pwd,
            attached_to: None,
            session_id: p.session_id,
            seq: p.seq,
            created_at: p.created_at,
            orphaned_at: p.orphaned_at,
        })
        .collect();
    let detached = state
        .detached_sessions
        .into_iter()
        .map(|d| DetachedSession {
            session_id: d.session_id,
            session_name: d.session_name,
            layout: d.mux_state,
            panes: d.panes,
            detached_at: d.detached_at,
        })
        .collect();

    registry.restore(panes, detached);
    info!(
        "loaded {} panes, {} detached sessions from {:?}",
        registry.panes.len(),
        registry.detached.len(),
        path
    );
}

#[cfg(test)]
mod test {
    use hexe_protocol::Register;

    use super::*;
    use crate::ses::registry::NewPane;

    fn test_layout(dir: &tempfile::TempDir, instance: &str) -> Layout {
        std::env::set_var("XDG_RUNTIME_DIR", dir.path().join("run"));
        std::env::set_var("XDG_STATE_HOME", dir.path().join("state"));
        Layout::resolve(Some(instance)).expect("layout")
    }

    fn seeded_registry() -> Registry {
        let mut registry = Registry::new();
        let reg = registry.register(&Register {
            session_id: Uid::nil(),
            keepalive: true,
            name: String::from("seed"),
        });
        for i in 0..3 {
            let id = Uid::generate();
            registry
                .add_pane(
                    reg.client_id,
                    NewPane {
                        id,
                        pod_pid: 0,
                        child_pid: 0,
                        socket: PathBuf::from(format!("/tmp/pod-{i}.sock")),
                        cwd: String::from("/tmp"),
                        sticky_key: if i == 0 { Some('a') } else { None },
                        sticky_pwd: if i == 0 { Some(String::from("/tmp")) } else { None },
                    },
                )
                .expect("add_pane");
        }
        // one pane orphaned, plus the whole session detached on
        // disconnect
        let sticky = registry.clients.values().next().unwrap().panes[0];
        registry.orphan_pane(sticky).unwrap();
        registry.sync_state(1, String::from("{\"tabs\":[]}")).unwrap();
        registry.client_disconnected(1);
        registry
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = test_layout(&dir, "persist-rt");
        let registry = seeded_registry();

        save(&layout, &registry).expect("save to succeed");

        let mut loaded = Registry::new();
        load(&layout, &mut loaded);

        assert_eq!(loaded.panes.len(), registry.panes.len());
        assert_eq!(loaded.detached.len(), registry.detached.len());
        for (id, pane) in registry.panes.iter() {
            let restored = loaded.pane(*id).expect("pane to be restored");
            assert_eq!(restored.state, pane.state);
            assert_eq!(restored.sticky_key, pane.sticky_key);
            assert_eq!(restored.sticky_pwd, pane.sticky_pwd);
            assert_eq!(restored.session_id, pane.session_id);
        }
        for (id, session) in registry.detached.iter() {
            let restored = loaded.detached.get(id).expect("session to be restored");
            assert_eq!(restored.layout, session.layout);
            assert_eq!(restored.panes, session.panes);
        }
    }

    #[test]
    fn save_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = test_layout(&dir, "persist-idem");
        let registry = seeded_registry();

        save(&layout, &registry).expect("first save");
        let first = fs::read(layout.state_file()).expect("read state");
        save(&layout, &registry).expect("second save");
        let second = fs::read(layout.state_file()).expect("read state");
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = test_layout(&dir, "persist-missing");
        let mut registry = Registry::new();
        load(&layout, &mut registry);
        assert!(registry.panes.is_empty());
        assert!(registry.detached.is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = test_layout(&dir, "persist-corrupt");
        layout.ensure_state_dir().unwrap();
        fs::write(layout.state_file(), b"{ not json").unwrap();

        let mut registry = Registry::new();
        load(&layout, &mut registry);
        assert!(registry.panes.is_empty());
    }

    #[test]
    fn unknown_and_missing_keys_are_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = test_layout(&dir, "persist-tolerant");
        layout.ensure_state_dir().unwrap();
        fs::write(
            layout.state_file(),
            br#"{
              "panes": [
                {"uuid": "00112233445566778899aabbccddeeff",
                 "state": "orphaned",
                 "surprise_key": [1, 2, 3]}
              ],
              "some_future_section": {}
            }"#,
        )
        .unwrap();

        let mut registry = Registry::new();
        load(&layout, &mut registry);
        assert_eq!(registry.panes.len(), 1);
        let pane = registry
            .pane("00112233445566778899aabbccddeeff".parse().unwrap())
            .expect("pane restored");
        assert_eq!(pane.state, PaneState::Orphaned);
        assert_eq!(pane.pod_pid, 0);
    }
}
