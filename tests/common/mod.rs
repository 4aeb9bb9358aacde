//! Shared fixtures for synchronizer integration tests

#![allow(dead_code)]

use gatesync::command::{ConfigValidator, SqueezeBlankLines};
use gatesync::template::Templates;
use gatesync::{ConfigSynchronizer, SyncError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Templates small enough to assert on exactly. Names "broken..." hit an
/// undefined field and fail to render.
const MAIN_TMPL: &str = "worker_processes {{ worker_processes }};\n\n\n\nevents {\n    worker_connections {{ worker_connections }};\n}\n";
const SERVER_TMPL: &str = "server {{ server.listen }} {{ server.server_name }}{% if server.server_name == \"broken.example.com\" %}{{ server.missing }}{% endif %};";
const UPSTREAM_TMPL: &str = "upstream {{ upstream.name }}{% for ep in upstream.endpoints %} {{ ep.address }}{% endfor %}{% if upstream.name == \"broken\" %}{{ upstream.missing }}{% endif %};";

/// Write the test templates into `dir`
pub fn write_templates(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("nginx.tmpl"), MAIN_TMPL).unwrap();
    std::fs::write(dir.join("servers.tmpl"), SERVER_TMPL).unwrap();
    std::fs::write(dir.join("upstreams-tcp.tmpl"), UPSTREAM_TMPL).unwrap();
}

/// A temp directory with `tmpl/` templates and a `conf/` output tree
pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_templates(&dir.path().join("tmpl"));
        Self { dir }
    }

    pub fn conf(&self) -> PathBuf {
        self.dir.path().join("conf")
    }

    pub fn synchronizer<V: ConfigValidator>(
        &self,
        validator: V,
    ) -> ConfigSynchronizer<V, SqueezeBlankLines> {
        let templates =
            Templates::load(&self.dir.path().join("tmpl"), 4096, SqueezeBlankLines).unwrap();
        ConfigSynchronizer::new(&self.conf(), templates, validator)
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.conf().join(relative)).unwrap()
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.conf().join(relative).exists()
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.conf().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Every `.bak` file left anywhere in the output tree
    pub fn backups(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        walk(&self.conf(), &mut |path| {
            if path.extension().is_some_and(|e| e == "bak") {
                found.push(path.to_path_buf());
            }
        });
        found
    }
}

fn walk(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

fn rejection(message: &str) -> SyncError {
    SyncError::Validation {
        output: message.to_string(),
    }
}

/// Accepts everything, fails on the listed (1-based) calls
#[derive(Default)]
pub struct CountingValidator {
    calls: AtomicUsize,
    fail_on: HashSet<usize>,
}

impl CountingValidator {
    pub fn failing_on(calls: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on: calls.iter().copied().collect(),
        })
    }

    pub fn always_valid() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn always_invalid() -> Arc<Self> {
        Self::failing_on(&(1..=1000).collect::<Vec<_>>())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConfigValidator for CountingValidator {
    async fn check(&self) -> Result<(), SyncError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&call) {
            Err(rejection(&format!("call {} rejected", call)))
        } else {
            Ok(())
        }
    }
}

/// Reads the live `.conf` files like nginx would and rejects the tree if
/// any of them mentions "invalid"
pub struct TreeValidator {
    root: PathBuf,
}

impl TreeValidator {
    pub fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(Self { root })
    }
}

impl ConfigValidator for TreeValidator {
    async fn check(&self) -> Result<(), SyncError> {
        let mut bad = None;
        walk(&self.root, &mut |path| {
            if path.extension().is_some_and(|e| e == "conf") {
                let content = std::fs::read_to_string(path).unwrap_or_default();
                if content.contains("invalid") {
                    bad = Some(path.display().to_string());
                }
            }
        });
        match bad {
            Some(path) => Err(rejection(&format!("{}: invalid directive", path))),
            None => Ok(()),
        }
    }
}

/// Accepts everything after a delay, recording how many checks overlap
pub struct SlowValidator {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SlowValidator {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ConfigValidator for SlowValidator {
    async fn check(&self) -> Result<(), SyncError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
