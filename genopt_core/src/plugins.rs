// genopt_core/src/plugins.rs

//! Ordered plugin pipeline driving strategy hooks.
//!
//! Each plugin declares the hooks it handles; the pipeline builds a per-hook
//! dispatch table at registration time and invokes handlers in registration
//! order. Three dispatch flavours exist:
//! - `dispatch_sync`: the one-off synchronous init hook.
//! - `dispatch_async`: awaits every handler in turn.
//! - `dispatch_skippable`: like `dispatch_async` but stops at the first handler
//!   returning `HookFlow::Skip` and reports it.

use std::any::Any;
use std::sync::Arc;

use crate::event;
use crate::strategy;
use crate::data_handler;

/// Strategy lifecycle hooks, in firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Init,
    Start,
    Tick,
    BeforeOpen,
    Open,
    BeforeClose,
    Close,
    Candle,
    AfterCandle,
    Dispose,
}

impl Hook {
    pub const ALL: [Hook; 10] = [
        Hook::Init,
        Hook::Start,
        Hook::Tick,
        Hook::BeforeOpen,
        Hook::Open,
        Hook::BeforeClose,
        Hook::Close,
        Hook::Candle,
        Hook::AfterCandle,
        Hook::Dispose,
    ];

    /// Hooks whose handlers may veto the rest of the processing.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Hook::Tick | Hook::BeforeOpen | Hook::BeforeClose)
    }

}

/// A hook invocation together with its argument.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    Start,
    Tick(&'a data_handler::Candle),
    BeforeOpen(&'a event::Order),
    Open(&'a event::Order),
    BeforeClose(&'a event::Order),
    Close(&'a event::Order),
    Candle(&'a data_handler::Candle),
    AfterCandle(&'a data_handler::Candle),
    Dispose,
}

impl HookEvent<'_> {
    pub fn hook(&self) -> Hook {
        match self {
            HookEvent::Start => Hook::Start,
            HookEvent::Tick(_) => Hook::Tick,
            HookEvent::BeforeOpen(_) => Hook::BeforeOpen,
            HookEvent::Open(_) => Hook::Open,
            HookEvent::BeforeClose(_) => Hook::BeforeClose,
            HookEvent::Close(_) => Hook::Close,
            HookEvent::Candle(_) => Hook::Candle,
            HookEvent::AfterCandle(_) => Hook::AfterCandle,
            HookEvent::Dispose => Hook::Dispose,
        }
    }

}

/// Result of a skippable hook handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    Skip,
}

/// Downcasting support so plugins can reach each other's concrete API.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Strategy extension point. Plugins keep their own state behind interior
/// mutability since hooks may re-enter the strategy.
#[async_trait::async_trait]
pub trait Plugin: AsAny + Send + Sync {
    /// Unique name inside one pipeline.
    fn name(&self) -> &str;

    /// Hooks this plugin handles. Other hooks are never dispatched to it.
    fn hooks(&self) -> &[Hook];

    fn on_init(&self, _ctx: &PluginContext<'_>) {}

    async fn on_event(
        &self,
        _ctx: &PluginContext<'_>,
        _event: &HookEvent<'_>,
    ) -> anyhow::Result<HookFlow> {
        anyhow::Ok(HookFlow::Continue)
    }

}

/// Read-only view handed to plugins: the owning strategy and its sibling plugins.
#[derive(Clone, Copy)]
pub struct PluginContext<'a> {
    strategy: &'a strategy::StrategyCore,
}

impl<'a> PluginContext<'a> {
    pub fn new(strategy: &'a strategy::StrategyCore) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &'a strategy::StrategyCore {
        self.strategy
    }

    pub fn plugin(&self, name: &str) -> Option<&'a Arc<dyn Plugin>> {
        self.strategy.get_pipeline().get(name)
    }

    /// Sibling plugin `name` downcast to its concrete type.
    pub fn plugin_as<T: Plugin + 'static>(&self, name: &str) -> Option<&'a T> {
        let plugin: &'a dyn Plugin = self.plugin(name)?.as_ref();
        <dyn Plugin as AsAny>::as_any(plugin).downcast_ref::<T>()
    }

}

#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
    table: std::collections::HashMap<Hook, Vec<Arc<dyn Plugin>>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends plugins whose name is not registered yet. Returns how many were added.
    pub fn register(&mut self, plugins: Vec<Arc<dyn Plugin>>) -> usize {
        let mut added = 0;

        for plugin in plugins {
            if self.get(plugin.name()).is_some() {
                tracing::debug!(plugin = plugin.name(), "plugin already registered");
                continue;
            }

            for hook in plugin.hooks() {
                let handlers = self.table.entry(*hook).or_default();
                if !handlers.iter().any(|p| Arc::ptr_eq(p, &plugin)) {
                    handlers.push(plugin.clone());
                }
            }

            self.plugins.push(plugin);
            added += 1;
        }

        added
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn handlers(&self, hook: Hook) -> &[Arc<dyn Plugin>] {
        self.table.get(&hook).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Runs the synchronous init hook of every plugin, in order.
    pub fn dispatch_sync(&self, ctx: &PluginContext<'_>) {
        for plugin in self.handlers(Hook::Init) {
            plugin.on_init(ctx);
        }
    }

    /// Awaits every handler of the event's hook in order. Skip signals are ignored.
    pub async fn dispatch_async(
        &self,
        ctx: &PluginContext<'_>,
        event: &HookEvent<'_>,
    ) -> anyhow::Result<()> {
        for plugin in self.handlers(event.hook()) {
            plugin.on_event(ctx, event).await?;
        }

        anyhow::Ok(())
    }

    /// Awaits handlers in order until one asks to skip. Returns `true` if one did.
    pub async fn dispatch_skippable(
        &self,
        ctx: &PluginContext<'_>,
        event: &HookEvent<'_>,
    ) -> anyhow::Result<bool> {
        for plugin in self.handlers(event.hook()) {
            if plugin.on_event(ctx, event).await? == HookFlow::Skip {
                tracing::trace!(plugin = plugin.name(), hook = ?event.hook(), "skipped by plugin");
                return anyhow::Ok(true);
            }
        }

        anyhow::Ok(false)
    }

}
