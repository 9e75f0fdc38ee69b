//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter split by a `reason` label
fn write_labeled_counter(output: &mut String, name: &str, help: &str, site: &str, values: &[(&str, u64)]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (reason, val) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",reason=\"{reason}\"}} {val}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, &summary);
    write_recognition_metrics(&mut output, site_id, &summary);
    write_allocation_metrics(&mut output, site_id, &summary);
    write_gate_metrics(&mut output, site_id, &summary);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkgate_frames_total",
        "Total frames processed across cameras",
        MetricType::Counter,
        site,
        summary.frames_total,
    );
    let _ = writeln!(output, "# HELP parkgate_frames_per_sec Frames processed per second");
    let _ = writeln!(output, "# TYPE parkgate_frames_per_sec gauge");
    let _ = writeln!(output, "parkgate_frames_per_sec{{site=\"{site}\"}} {:.2}", summary.frames_per_sec);

    write_histogram(
        output,
        "parkgate_frame_latency_us",
        "Per-frame recognition latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_frame_latency_us,
    );
    write_metric(
        output,
        "parkgate_frames_dropped_total",
        "Frames overwritten in a sink before the display took them",
        MetricType::Counter,
        site,
        summary.frames_dropped_total,
    );
}

fn write_recognition_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkgate_detections_total",
        "Plate regions detected",
        MetricType::Counter,
        site,
        summary.detections_total,
    );
    write_metric(
        output,
        "parkgate_plates_read_total",
        "Regions whose text sanitized to a plate",
        MetricType::Counter,
        site,
        summary.plates_read_total,
    );
    write_metric(
        output,
        "parkgate_registry_hits_total",
        "Plates found in the registry",
        MetricType::Counter,
        site,
        summary.registry_hits_total,
    );
    write_labeled_counter(
        output,
        "parkgate_lookup_failures_total",
        "Failed registry lookups and vision calls",
        site,
        &[("registry", summary.registry_failures_total), ("vision", summary.vision_failures_total)],
    );
    write_metric(
        output,
        "parkgate_matches_enqueued_total",
        "Match events sent to the allocator",
        MetricType::Counter,
        site,
        summary.matches_enqueued_total,
    );
}

fn write_allocation_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkgate_slots_assigned_total",
        "Empty slots assigned to a plate",
        MetricType::Counter,
        site,
        summary.slots_assigned_total,
    );
    write_metric(
        output,
        "parkgate_repeat_sightings_total",
        "Matches for a plate already holding its target slot",
        MetricType::Counter,
        site,
        summary.repeats_total,
    );
    write_labeled_counter(
        output,
        "parkgate_matches_rejected_total",
        "Matches rejected by the allocator",
        site,
        &[
            ("duplicate_elsewhere", summary.rejected_duplicate_total),
            ("contention", summary.rejected_contention_total),
            ("slot_missing", summary.rejected_missing_total),
        ],
    );
    write_metric(
        output,
        "parkgate_releases_total",
        "Operator slot releases",
        MetricType::Counter,
        site,
        summary.releases_total,
    );
    write_metric(
        output,
        "parkgate_store_failures_total",
        "Slot store reads or writes that failed",
        MetricType::Counter,
        site,
        summary.store_failures_total,
    );
    write_metric(
        output,
        "parkgate_occupied_slots",
        "Slots currently occupied",
        MetricType::Gauge,
        site,
        summary.occupied_slots,
    );
}

fn write_gate_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkgate_gate_commands_total",
        "Gate commands written to the actuator",
        MetricType::Counter,
        site,
        summary.gate_commands_sent,
    );
    write_metric(
        output,
        "parkgate_gate_command_failures_total",
        "Gate commands dropped or not written",
        MetricType::Counter,
        site,
        summary.gate_command_failures,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server; returns once `shutdown` fires
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("prometheus_metrics_server_shutdown");
                return Ok(());
            }
        }
    }
}
