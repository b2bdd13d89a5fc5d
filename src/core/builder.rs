use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{config::SupervisorConfig, forwarder::Outlet, forwarder::Senders, supervisor::Supervisor};
use crate::{
    template::{Render, TemplateRenderer},
    workers::BuiltinRegistry,
};

/// Builder for constructing a [`Supervisor`] with optional collaborators.
pub struct SupervisorBuilder {
    cfg: SupervisorConfig,
    renderer: Option<Arc<dyn Render>>,
    builtins: BuiltinRegistry,
    token: Option<CancellationToken>,
}

impl SupervisorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            cfg,
            renderer: None,
            builtins: BuiltinRegistry::default(),
            token: None,
        }
    }

    /// Replaces the default [`TemplateRenderer`].
    pub fn with_renderer(mut self, renderer: Arc<dyn Render>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Sets the built-in worker constructors (default: only `noop`).
    pub fn with_builtins(mut self, builtins: BuiltinRegistry) -> Self {
        self.builtins = builtins;
        self
    }

    /// Uses `token` as the root token; cancelling it shuts the supervisor down.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Builds the supervisor and returns it with the receiving ends of its outlet.
    ///
    /// Spawns the shutdown watcher, so it must be called inside a Tokio runtime.
    pub fn build(self) -> (Arc<Supervisor>, Outlet) {
        let (senders, outlet) = Senders::channel(self.cfg.channel_capacity_clamped());
        let renderer = self.renderer.unwrap_or_else(|| {
            Arc::new(TemplateRenderer::new(
                self.cfg.temp_dir.clone(),
                self.cfg.paths_base.clone(),
            ))
        });
        let token = self.token.unwrap_or_default();

        let sup = Arc::new(Supervisor::new_internal(
            self.cfg,
            token,
            renderer,
            self.builtins,
            senders,
        ));
        tokio::spawn(Arc::clone(&sup).run_until_cancelled());
        (sup, outlet)
    }
}
