//! Telemetry setup for tracing and logging.

use std::io::IsTerminal;

/// Environment variable for service name (not exported by opentelemetry_sdk).
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

/// Default service and tracer name.
const SERVICE_NAME: &str = "bpfman-purger";

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Guard that flushes OpenTelemetry spans on drop. Hold it for the whole run.
pub struct TelemetryGuard {
	_inner: Option<OtelGuard>,
}

/// Shuts the tracer provider down, exporting whatever is still batched.
struct OtelGuard {
	tracer_provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
	fn drop(&mut self) {
		if let Err(e) = self.tracer_provider.shutdown() {
			eprintln!("Failed to shutdown tracer provider: {e}");
		}
	}
}

/// Whether an OTLP endpoint is configured in the environment.
fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

/// Log filter for a run.
///
/// `--verbose` turns on debug output for the purger itself while keeping
/// client libraries at info. Without it `RUST_LOG` applies, defaulting to
/// info.
fn filter(verbose: bool) -> EnvFilter {
	if verbose {
		EnvFilter::new(format!("{},bpfman_purger=debug", Level::INFO))
	} else {
		EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy()
	}
}

/// Initialize tracing.
///
/// Logs go to stderr, pretty printed on a terminal and as JSON otherwise.
/// Spans are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` or
/// `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is set; the service name defaults to
/// `bpfman-purger` unless `OTEL_SERVICE_NAME` says otherwise.
pub fn init(verbose: bool) -> Result<TelemetryGuard> {
	let filter_layer = filter(verbose);

	// Humans get pretty output, log collectors get one JSON object per line
	let fmt_layer = if std::io::stderr().is_terminal() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	// Span export is opt-in through the standard OTEL variables
	if otel_export_enabled() {
		let (otel_layer, guard) = init_otel()?;

		tracing_subscriber::registry()
			.with(filter_layer)
			.with(fmt_layer)
			.with(otel_layer)
			.init();

		return Ok(TelemetryGuard {
			_inner: Some(guard),
		});
	}

	tracing_subscriber::registry()
		.with(filter_layer)
		.with(fmt_layer)
		.init();

	Ok(TelemetryGuard { _inner: None })
}

fn init_otel<S>() -> Result<(impl Layer<S>, OtelGuard)>
where
	S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
	use opentelemetry_sdk::Resource;

	// The builder already picks up `OTEL_SERVICE_NAME` and
	// `OTEL_RESOURCE_ATTRIBUTES`; only fall back to our own name.
	let mut resource_builder = Resource::builder();
	if std::env::var(OTEL_SERVICE_NAME).is_err() {
		resource_builder = resource_builder.with_service_name(SERVICE_NAME);
	}
	let resource = resource_builder.build();

	// Transport follows `OTEL_EXPORTER_OTLP_PROTOCOL`, http unless it says grpc
	let exporter = match std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL)
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build()?,
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build()?,
	};

	let tracer_provider = SdkTracerProvider::builder()
		.with_resource(resource)
		.with_batch_exporter(exporter)
		.build();

	let layer = tracing_opentelemetry::layer()
		.with_error_records_to_exceptions(true)
		.with_tracer(tracer_provider.tracer(SERVICE_NAME));

	// Global provider for anything using the opentelemetry API directly
	opentelemetry::global::set_tracer_provider(tracer_provider.clone());

	Ok((layer, OtelGuard { tracer_provider }))
}
