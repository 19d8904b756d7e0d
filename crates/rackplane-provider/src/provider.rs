//! The provider context shared by every operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rack_core::Config;
use rackplane_substrate::{Substrate, SubstrateResult};
use serde::Serialize;

use crate::cache::Cache;
use crate::context::CallContext;
use crate::render::TemplateRenderer;

/// Configuration, substrate clients, cache, and the current call context.
///
/// Cheap to clone; clones share the cache. Handlers and workers each hold
/// their own clone, usually bound to their own [`CallContext`].
#[derive(Clone)]
pub struct Provider {
    config: Arc<Config>,
    substrate: Substrate,
    cache: Arc<Cache>,
    renderer: Arc<dyn TemplateRenderer>,
    ctx: CallContext,
    skip_cache: bool,
}

impl Provider {
    pub fn new(config: Arc<Config>, substrate: Substrate, renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            config,
            substrate,
            cache: Arc::new(Cache::new()),
            renderer,
            ctx: CallContext::new(),
            skip_cache: false,
        }
    }

    /// A clone whose substrate calls run under `ctx`.
    pub fn with_context(&self, ctx: CallContext) -> Self {
        Self { ctx, ..self.clone() }
    }

    /// A clone that bypasses the call cache for reads.
    pub fn without_cache(&self) -> Self {
        Self {
            skip_cache: true,
            ..self.clone()
        }
    }

    /// False for clones made by [`Provider::without_cache`].
    pub fn reads_cache(&self) -> bool {
        !self.skip_cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_arc(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn substrate(&self) -> &Substrate {
        &self.substrate
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub(crate) fn renderer(&self) -> &dyn TemplateRenderer {
        self.renderer.as_ref()
    }

    /// Stack name for an app.
    pub fn rack_stack(&self, app: &str) -> String {
        self.config.app_stack(app)
    }

    /// Run one substrate call under the current context.
    pub async fn call<T, F>(&self, call: F) -> SubstrateResult<T>
    where
        F: Future<Output = SubstrateResult<T>>,
    {
        self.ctx.run(call).await
    }

    /// Serve a read from the cache, or run it and remember the result.
    pub(crate) async fn cached<T, K, F>(&self, collection: &str, key: &K, ttl: Duration, call: F) -> SubstrateResult<T>
    where
        T: Clone + Send + Sync + 'static,
        K: Serialize + ?Sized,
        F: Future<Output = SubstrateResult<T>>,
    {
        if !self.skip_cache {
            if let Some(hit) = self.cache.get::<T, K>(collection, key) {
                return Ok(hit);
            }
        }
        let value = self.call(call).await?;
        if !self.skip_cache {
            self.cache.set(collection, key, value.clone(), ttl);
        }
        Ok(value)
    }
}
