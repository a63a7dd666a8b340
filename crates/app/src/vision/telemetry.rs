//! Tracing and Prometheus setup shared by every pipeline thread.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::vision::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Guard returned when a telemetry subscriber has been installed for the current thread.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the global metrics recorder once and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| anyhow!("metrics recorder already installed: {err}"))?;

    let upkeep_handle = handle.clone();
    spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(UPKEEP_INTERVAL);
            upkeep_handle.run_upkeep();
        }
    })
    .map_err(|err| anyhow!("failed to spawn prometheus upkeep thread: {err}"))?;

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the fmt subscriber (plus the Chrome trace writer when requested)
/// as the default for the current thread.
///
/// `verbose` lowers the default filter to `debug`; `RUST_LOG` still wins.
pub(crate) fn enter_runtime(opts: &TelemetryOptions, verbose: bool) -> TelemetryGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime())
        .with_filter(env_filter);

    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(fmt_layer)
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_are_named() {
        let _guard = enter_runtime(&TelemetryOptions::default(), false);
        let name = spawn_thread("vision-name-check", || {
            thread::current().name().map(str::to_owned)
        })
        .unwrap()
        .join()
        .unwrap();
        assert_eq!(name.as_deref(), Some("vision-name-check"));
    }

    #[test]
    fn chrome_trace_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        {
            let _guard = enter_runtime(
                &TelemetryOptions {
                    chrome_trace_path: Some(path.clone()),
                },
                true,
            );
            let span = tracing::info_span!("trace-check");
            let _entered = span.enter();
        }
        assert!(path.exists());
    }
}
