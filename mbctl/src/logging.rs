// Copyright (c) Facebook, Inc. and its affiliates.
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

use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;

use common::logutil::CompoundDecorator;
use slog::Drain;
use slog::error;
use slog::o;

fn setup_log<T: 'static + std::io::Write + std::marker::Send>(
    file: T,
    debug: bool,
    error: Option<std::io::Error>,
) -> slog::Logger {
    let level = if debug {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };
    let decorator = CompoundDecorator::new(file, std::io::stderr());
    let drain = Mutex::new(slog_term::FullFormat::new(decorator).build()).fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    let logger = slog::Logger::root(drain, o!());

    if let Some(e) = error {
        error!(
            logger,
            "Fail to open log path: {}\n.Redirecting all log to stderr.", e
        );
    }

    logger
}

/// Log to `path` and stderr, or to stderr alone when `path` cannot be
/// opened.
pub fn setup(path: &Path, debug: bool) -> slog::Logger {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            if let Ok(metadata) = file.metadata() {
                let mut perms = metadata.permissions();
                if perms.mode() & 0o777 != 0o644 {
                    perms.set_mode(0o644);
                    let _ = file.set_permissions(perms);
                }
            }
            setup_log(file, debug, None)
        }
        Err(e) => setup_log(std::io::stderr(), debug, Some(e)),
    }
}
