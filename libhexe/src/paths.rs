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

//! Where everything lives on disk. All sockets and state files are
//! namespaced under an optional instance name so that independent hexe
//! instances never see each other.

use std::{env, fs, path::PathBuf};

use anyhow::{anyhow, Context};
use hexe_protocol::Uid;

use crate::consts;

const INSTANCE_NAME_MAX: usize = 24;

/// The resolved path layout for one instance.
#[derive(Debug, Clone)]
pub struct Layout {
    /// None is the default namespace.
    pub instance: Option<String>,
    runtime_dir: PathBuf,
    state_dir: PathBuf,
}

impl Layout {
    /// Resolve the layout from an explicit `-I` flag, falling back to
    /// `HEXE_INSTANCE`, falling back to the default namespace.
    pub fn resolve(flag: Option<&str>) -> anyhow::Result<Layout> {
        let instance = match flag {
            Some(name) => Some(String::from(name)),
            None => env::var(consts::ENV_INSTANCE).ok(),
        };
        let instance = instance.map(|name| sanitise_instance(&name)).filter(|name| !name.is_empty());

        let mut runtime_dir = match env::var("XDG_RUNTIME_DIR") {
            Ok(dir) => PathBuf::from(dir),
            // world-writable /tmp, so qualify with the uid
            Err(_) => PathBuf::from(format!("/tmp/hexe-{}", nix::unistd::getuid())),
        };
        runtime_dir.push("hexe");

        let mut state_dir = match env::var("XDG_STATE_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => PathBuf::from(env::var("HOME").context("no XDG_STATE_HOME or HOME")?)
                .join(".local")
                .join("state"),
        };
        state_dir.push("hexe");

        if let Some(name) = &instance {
            runtime_dir.push(name);
            state_dir.push(name);
        }

        Ok(Layout { instance, runtime_dir, state_dir })
    }

    /// Like `resolve`, but forces a generated test instance so that
    /// test panes can never leak into a real session. Honors an
    /// explicit `-I` name, ignores `HEXE_INSTANCE`.
    pub fn resolve_test_only(flag: Option<&str>) -> anyhow::Result<Layout> {
        let name = match flag {
            Some(name) => String::from(name),
            None => gen_test_instance(),
        };
        let name = sanitise_instance(&name);
        if name.is_empty() {
            return Err(anyhow!("test isolation requires a non-empty instance name"));
        }
        Layout::resolve(Some(&name))
    }

    pub fn runtime_dir(&self) -> &PathBuf {
        &self.runtime_dir
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    pub fn ensure_runtime_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.runtime_dir)
            .context(format!("creating runtime dir {:?}", self.runtime_dir))
    }

    pub fn ensure_state_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir)
            .context(format!("creating state dir {:?}", self.state_dir))
    }

    pub fn ses_sock(&self) -> PathBuf {
        self.runtime_dir.join("ses.sock")
    }

    pub fn mux_sock(&self, id: Uid) -> PathBuf {
        self.runtime_dir.join(format!("mux-{id}.sock"))
    }

    pub fn pod_sock(&self, id: Uid) -> PathBuf {
        self.runtime_dir.join(format!("pod-{id}.sock"))
    }

    pub fn pod_meta(&self, id: Uid) -> PathBuf {
        self.runtime_dir.join(format!("pod-{id}.meta"))
    }

    pub fn pod_alias(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("pod@{}.sock", sanitise_instance(name)))
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("ses_state.json")
    }
}

/// Instance names end up in socket paths, so only `[A-Za-z0-9_.-]`
/// survives, truncated to 24 bytes.
pub fn sanitise_instance(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .take(INSTANCE_NAME_MAX)
        .collect()
}

/// A throwaway instance name of the form `test-<8hex>`.
pub fn gen_test_instance() -> String {
    let id = Uid::generate();
    format!("test-{}", &id.hex()[..8])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitise_passthrough() {
        assert_eq!(sanitise_instance("dev"), "dev");
        assert_eq!(sanitise_instance("a_b.c-d"), "a_b.c-d");
    }

    #[test]
    fn sanitise_strips_and_truncates() {
        assert_eq!(sanitise_instance("a/b:c d!"), "abcd");
        assert_eq!(sanitise_instance("../../etc/passwd"), "....etcpasswd");
        let long: String = std::iter::repeat('x').take(100).collect();
        assert_eq!(sanitise_instance(&long).len(), 24);
    }

    #[test]
    fn test_instance_shape() {
        let name = gen_test_instance();
        assert!(name.starts_with("test-"));
        assert_eq!(name.len(), "test-".len() + 8);
    }

    #[test]
    fn instances_do_not_share_paths() {
        std::env::remove_var("HEXE_INSTANCE");
        let a = Layout::resolve(Some("alpha")).expect("layout");
        let b = Layout::resolve(Some("beta")).expect("layout");
        let default = Layout::resolve(None).expect("layout");

        assert_ne!(a.ses_sock(), b.ses_sock());
        assert_ne!(a.state_file(), b.state_file());
        assert_ne!(a.ses_sock(), default.ses_sock());
        assert!(a.ses_sock().to_string_lossy().contains("alpha"));
    }

    #[test]
    fn empty_instance_is_default() {
        std::env::remove_var("HEXE_INSTANCE");
        let explicit = Layout::resolve(Some("!!!")).expect("layout");
        assert!(explicit.instance.is_none());
        let default = Layout::resolve(None).expect("layout");
        assert_eq!(explicit.ses_sock(), default.ses_sock());
    }
}
