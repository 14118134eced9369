//! Process-wide logging: tracing to stderr with a reloadable level filter,
//! plus an optional forwarder that mirrors every record to the API as
//! `watcher.log` once the connection is live.

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::field::{Field, Visit};
use tracing::{info, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Sink for records mirrored to the API. Implemented by the connection
/// client; must never block.
pub trait LogForwarder: Send + Sync {
    fn forward_log(
        &self,
        level: &str,
        message: &str,
        context: serde_json::Map<String, serde_json::Value>,
    );
}

static FORWARDER: RwLock<Option<Arc<dyn LogForwarder>>> = RwLock::new(None);
static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn normalize_level(level: &str) -> &'static str {
    match level {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the provisional
/// level. Safe to call more than once; later calls are no-ops.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(level)));
    let (filter, handle) = reload::Layer::new(filter);

    let initialized = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(ForwardLayer)
        .try_init()
        .is_ok();
    if initialized {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Change the level without reinstalling the subscriber.
pub fn set_level(level: &str) {
    if let Some(handle) = RELOAD_HANDLE.get() {
        if handle
            .reload(EnvFilter::new(normalize_level(level)))
            .is_ok()
        {
            info!(level, "log level changed");
        }
    }
}

/// Register (or with `None`, detach) the API log forwarder.
pub fn set_forwarder(forwarder: Option<Arc<dyn LogForwarder>>) {
    if let Ok(mut guard) = FORWARDER.write() {
        *guard = forwarder;
    }
}

struct ForwardLayer;

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let forwarder = match FORWARDER.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        let Some(forwarder) = forwarder else {
            return;
        };

        let mut visitor = ContextVisitor::default();
        event.record(&mut visitor);

        let level = *event.metadata().level();
        let level_str = if level == Level::ERROR {
            "error"
        } else if level == Level::WARN {
            "warn"
        } else if level == Level::DEBUG || level == Level::TRACE {
            "debug"
        } else {
            "info"
        };

        forwarder.forward_log(level_str, &visitor.message, visitor.context);
    }
}

#[derive(Default)]
struct ContextVisitor {
    message: String,
    context: serde_json::Map<String, serde_json::Value>,
}

impl Visit for ContextVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.context
                .insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.context.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.context.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.context.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.context.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.context
                .insert(field.name().to_string(), format!("{value:?}").into());
        }
    }
}
