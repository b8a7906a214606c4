/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "metronome",
    version,
    about = "Durable database-backed message scheduler",
    long_about = "Accepts schedule requests over HTTP or a broker subscription and \
                  republishes each payload to its target topic at the requested time, \
                  at-least-once, across a fleet of workers sharing one database."
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler service until interrupted
    Start,

    /// Insert a single schedule request and exit
    Schedule {
        /// Path to a JSON request file; reads stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Validate a JSON schedule request without persisting it
    Parse {
        /// Path to a JSON request file; reads stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Emit the HTTP API schema as OpenAPI JSON
    Openapi,
}
