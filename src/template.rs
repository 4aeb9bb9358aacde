//! Template rendering with output normalization
//!
//! A [`Template`] renders a serializable context into bytes, then passes the
//! bytes through a [`TextNormalizer`]. Normalization failures are logged and
//! the raw rendering is returned instead; they never block delivery.

use crate::buffer::BufferPool;
use crate::command::TextNormalizer;
use crate::error::SyncError;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Template file for the global `nginx.conf`
pub const MAIN_TEMPLATE: &str = "nginx.tmpl";
/// Template file for one virtual server
pub const SERVER_TEMPLATE: &str = "servers.tmpl";
/// Template file for one stream upstream pool
pub const UPSTREAM_TEMPLATE: &str = "upstreams-tcp.tmpl";

/// A parsed template bound to a buffer pool and a normalizer
pub struct Template<N> {
    name: String,
    env: Environment<'static>,
    pool: Arc<BufferPool>,
    normalizer: Arc<N>,
}

impl<N: TextNormalizer> Template<N> {
    /// Parse a template from source text.
    ///
    /// Undefined variables are errors, so a context missing a field the
    /// template needs fails to render instead of producing a hole.
    pub fn from_source(
        name: &str,
        source: String,
        pool: Arc<BufferPool>,
        normalizer: Arc<N>,
    ) -> Result<Self, SyncError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_filter("port", listen_port);
        env.add_template_owned(name.to_string(), source)
            .map_err(|e| SyncError::Template {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            name: name.to_string(),
            env,
            pool,
            normalizer,
        })
    }

    /// Read and parse a template file
    pub fn load(path: &Path, pool: Arc<BufferPool>, normalizer: Arc<N>) -> Result<Self, SyncError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let source = std::fs::read_to_string(path).map_err(|e| SyncError::Template {
            name: name.clone(),
            message: format!("unexpected error reading template {}: {}", path.display(), e),
        })?;
        debug!(template = %name, path = %path.display(), "Template loaded");
        Self::from_source(&name, source, pool, normalizer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render `ctx` and normalize the result
    pub async fn render<S: Serialize + Sync>(&self, ctx: &S) -> Result<Vec<u8>, SyncError> {
        let mut raw = self.pool.get();
        self.render_raw(ctx, &mut raw)?;

        let mut cleaned = self.pool.get();
        match self.normalizer.normalize(&raw, &mut cleaned).await {
            Ok(()) => Ok(cleaned.to_vec()),
            Err(e) => {
                warn!(template = %self.name, error = %e, "Unexpected error cleaning template, using raw output");
                Ok(raw.to_vec())
            }
        }
    }

    fn render_raw<S: Serialize>(&self, ctx: &S, out: &mut Vec<u8>) -> Result<(), SyncError> {
        let tmpl = self.env.get_template(&self.name).map_err(|e| SyncError::Template {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        let rendered = tmpl.render(ctx).map_err(|e| SyncError::Render {
            template: self.name.clone(),
            message: e.to_string(),
        })?;
        out.extend_from_slice(rendered.as_bytes());
        Ok(())
    }
}

/// `port` filter: the port of a listen address (`":80"`, `"0.0.0.0:80"`,
/// `"[::1]:80"` and `"80"` all give `"80"`)
fn listen_port(listen: String) -> String {
    match listen.rsplit_once(':') {
        Some((_, port)) => port.to_string(),
        None => listen,
    }
}

/// The three templates loaded once at startup
pub struct Templates<N> {
    pub main: Template<N>,
    pub server: Template<N>,
    pub upstream: Template<N>,
}

impl<N: TextNormalizer> Templates<N> {
    /// Load `nginx.tmpl`, `servers.tmpl` and `upstreams-tcp.tmpl` from `dir`.
    /// Any missing or unparseable template is an error.
    pub fn load(dir: &Path, buffer_size: usize, normalizer: N) -> Result<Self, SyncError> {
        let pool = BufferPool::new(buffer_size);
        let normalizer = Arc::new(normalizer);
        let load = |file: &str| Template::load(&dir.join(file), Arc::clone(&pool), Arc::clone(&normalizer));

        Ok(Self {
            server: load(SERVER_TEMPLATE)?,
            upstream: load(UPSTREAM_TEMPLATE)?,
            main: load(MAIN_TEMPLATE)?,
        })
    }
}
