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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use signal_hook::{consts, flag};

/// Writers handle EPIPE as an error return instead of dying to the
/// default SIGPIPE disposition. Called once at process entry.
pub fn ignore_sigpipe() {
    // Safety: basic ffi, SIG_IGN is a valid disposition for SIGPIPE.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// A flag flipped by SIGTERM/SIGINT so poll loops can exit cleanly. A
/// second termination signal exits immediately with status 1, so a
/// mashed ^C never gets stuck behind a graceful shutdown.
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn register() -> anyhow::Result<Shutdown> {
        let flag = Arc::new(AtomicBool::new(false));
        for sig in consts::TERM_SIGNALS {
            // On the second delivery, exit 1. Does nothing the first
            // time around because the flag is still false.
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&flag))
                .context("registering conditional shutdown")?;
            // Arms the above by flipping the flag on the first delivery.
            // Order matters: the other way round, the first signal
            // would arm and terminate in one go.
            flag::register(*sig, Arc::clone(&flag)).context("registering shutdown flag")?;
        }
        Ok(Shutdown { flag })
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A flag flipped by SIGCHLD, used by the pod poll loop to know when
/// to try reaping its child.
pub struct ChildFlag {
    flag: Arc<AtomicBool>,
}

impl ChildFlag {
    pub fn register() -> anyhow::Result<ChildFlag> {
        let flag = Arc::new(AtomicBool::new(false));
        flag::register(consts::SIGCHLD, Arc::clone(&flag))
            .context("registering SIGCHLD flag")?;
        Ok(ChildFlag { flag })
    }

    /// Reads and clears the flag.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::Relaxed)
    }
}
