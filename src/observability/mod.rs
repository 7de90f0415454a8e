//! Observability Hub: the structured logger, trace propagator, and metric
//! recorder addressed directly by every other component. Constructed once in
//! `main`, torn down on exit — the only process-wide state besides the
//! current DB Pool pointer.

use std::sync::Arc;

use opentelemetry::propagation::Extractor;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace as sdktrace, Resource};
use tracing::error;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::metrics::OrderWorkerMetrics;

pub struct ObservabilityHub {
    pub metrics: Arc<OrderWorkerMetrics>,
    otel_enabled: bool,
}

impl ObservabilityHub {
    /// Installs the global `tracing` subscriber: a human or JSON `fmt` layer
    /// per `log_format`, plus (when `collector_endpoint` is set) an OTLP
    /// exporter layer carrying every task-level span, not just HTTP spans.
    /// Degrades to local logging only if the OTLP pipeline fails to install.
    pub fn init(config: &ObservabilityConfig) -> Self {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let filter_directive = format!("order_worker={},tower_http=info", config.log_level);
        let json = config.log_format == "json";

        let otel_enabled = match &config.collector_endpoint {
            Some(endpoint) => {
                let resource = Resource::new(vec![KeyValue::new(
                    "service.name",
                    config.service_name.clone(),
                )]);
                match opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint.clone()),
                    )
                    .with_trace_config(sdktrace::config().with_resource(resource))
                    .install_batch(opentelemetry_sdk::runtime::Tokio)
                {
                    Ok(tracer) => {
                        let base = tracing_subscriber::registry()
                            .with(tracing_opentelemetry::layer().with_tracer(tracer))
                            .with(EnvFilter::new(filter_directive.clone()));
                        if json {
                            let _ = base.with(fmt::layer().json()).try_init();
                        } else {
                            let _ = base.with(fmt::layer()).try_init();
                        }
                        true
                    }
                    Err(err) => {
                        error!("failed to install OTLP pipeline, falling back to local logging: {err}");
                        Self::init_local_only(&filter_directive, json);
                        false
                    }
                }
            }
            None => {
                Self::init_local_only(&filter_directive, json);
                false
            }
        };

        Self {
            metrics: Arc::new(OrderWorkerMetrics::new()),
            otel_enabled,
        }
    }

    fn init_local_only(filter_directive: &str, json: bool) {
        if json {
            let _ = fmt().with_env_filter(filter_directive.to_string()).json().try_init();
        } else {
            let _ = fmt().with_env_filter(filter_directive.to_string()).try_init();
        }
    }

    /// Best-effort in-process-only hub, used by tests that don't want to
    /// install a global subscriber.
    pub fn for_tests() -> Self {
        Self {
            metrics: Arc::new(OrderWorkerMetrics::new()),
            otel_enabled: false,
        }
    }

    pub fn shutdown(&self) {
        if self.otel_enabled {
            global::shutdown_tracer_provider();
        }
    }
}

/// Adapts a single W3C `traceparent` header value to the `Extractor`
/// interface the global propagator expects.
struct TraceparentCarrier<'a>(&'a str);

impl<'a> Extractor for TraceparentCarrier<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        (key == "traceparent").then_some(self.0)
    }

    fn keys(&self) -> Vec<&str> {
        vec!["traceparent"]
    }
}

/// Sets `span`'s parent from a queue message's `traceparent` attribute, so
/// the task span continues the trace the producer started rather than
/// beginning a disconnected one. A no-op when the message carried none.
pub fn continue_trace_from_message(span: &tracing::Span, traceparent: Option<&str>) {
    let Some(traceparent) = traceparent else {
        return;
    };
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&TraceparentCarrier(traceparent))
    });
    span.set_parent(parent_cx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_trace_from_message_is_a_no_op_without_a_traceparent() {
        let span = tracing::Span::none();
        continue_trace_from_message(&span, None);
    }
}
