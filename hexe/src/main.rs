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
/// Hexe is a terminal multiplexer split across cooperating processes:
/// a mux front end, a per-instance registry daemon (ses), and per-pane
/// pty daemons (pods) that keep shells alive across detaches and mux
/// crashes. This binary exposes all of them behind one set of verbs.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libhexe::Args::parse();

    if args.version() {
        println!("hexe {}", VERSION);
        return Ok(());
    }

    let code = libhexe::run(args)?;
    std::process::exit(code);
}
