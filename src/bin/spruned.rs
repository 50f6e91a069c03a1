//
// Copyright 2018-2019 Tamas Blummer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Thin CLI entry point. Argument parsing, config loading and logging are the only things
//! this binary does; everything else lives in the library (spec §6 keeps process wiring out of
//! core scope).

use clap::{App, Arg};
use log::{info, Level};

use spruned::config::Config;
use spruned::runtime::Runtime;

fn main() {
    let matches = App::new("spruned")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-source, SPV-class Bitcoin node with a Bitcoin Core compatible JSON-RPC surface")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("path to a TOML configuration file; defaults ship if omitted")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("enable debug-level logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::Debug } else { Level::Info };
    simple_logger::init_with_level(level).expect("logger already initialized");

    let config = match matches.value_of("config") {
        Some(path) => Config::load(path).unwrap_or_else(|e| panic!("could not load config from {}: {}", path, e)),
        None => Config::default(),
    };

    let mut tokio_runtime = tokio::runtime::Builder::new()
        .threaded_scheduler()
        .enable_all()
        .build()
        .expect("could not start the tokio runtime");

    tokio_runtime.block_on(async move {
        let runtime = Runtime::build(config)
            .await
            .unwrap_or_else(|e| panic!("could not start runtime: {}", e));
        info!("spruned is running");
        // CLI process control (signal handling, daemonization, a real RPC listener) is out of
        // scope; this binary exists to prove the library boots, not to be a production daemon.
        futures::future::pending::<()>().await;
        runtime.shutdown();
    });
}
