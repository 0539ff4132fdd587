// Copyright 2025 MeshRPC Authors
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

//! # MeshRPC CLI
//!
//! Command-line access to MeshRPC services.
//!
//! - `meshrpc call`: invoke a service through the cluster invoker and print
//!   the raw JSON result
//! - `meshrpc routes`: list the routes a config file declares
//! - `meshrpc check`: validate a config file and show effective commands

pub mod call;
pub mod routes;

use std::path::Path;

use anyhow::{Context, Result};
use meshrpc_client::ClientConfig;

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG: &str = "meshrpc.toml";

/// Loads the client config.
///
/// An explicitly named file must exist. Without one, `meshrpc.toml` in the
/// working directory is used if present, otherwise built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            ClientConfig::load(DEFAULT_CONFIG).context("Failed to load meshrpc.toml")
        }
        None => Ok(ClientConfig::default()),
    }
}
