//! Metrics infrastructure for the relief tile pipeline.
//!
//! Every metric the pipeline emits is declared here as a const [`Metric`] so
//! names, units and label keys live in one place. The `metrics` crate is
//! re-exported; emit through it using the declared names:
//!
//! ```rust,ignore
//! use relief_metrics::{describe_metrics, metric_defs};
//!
//! describe_metrics();
//! metrics::counter!(metric_defs::TILES_SERVED.name, "provenance" => "measured").increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use relief_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const GRIDS: Metric = Metric::counter("relief.ingest.grids")
///     .with_description("Grids rasterized")
///     .with_unit(Unit::Count);
///
/// assert_eq!(GRIDS.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "relief.tiles.served").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for the pipeline.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Tile serving
    // ========================================================================

    /// Tiles returned to a caller.
    ///
    /// Labels: provenance (measured|approximated), format (raw|rgb-elevation)
    pub const TILES_SERVED: Metric = Metric::counter("relief.tiles.served")
        .with_description("Tiles returned to a caller")
        .with_unit(Unit::Count)
        .with_labels(&["provenance", "format"]);

    /// Tile requests that exhausted every source.
    pub const TILES_UNAVAILABLE: Metric = Metric::counter("relief.tiles.unavailable")
        .with_description("Tile requests for which no source produced data")
        .with_unit(Unit::Count);

    /// Times a resolution stage gave up and passed the request on.
    ///
    /// Labels: stage (cache|remote_coverage|remote_image), reason
    /// (disabled, zoom, no_valid_entry, projection, unusable_entry, error, ...)
    pub const STAGE_FALLTHROUGH: Metric = Metric::counter("relief.chain.fallthrough")
        .with_description("Resolution stages that fell through to the next stage")
        .with_unit(Unit::Count)
        .with_labels(&["stage", "reason"]);

    /// Time spent resampling one source grid onto a tile.
    pub const RESAMPLE_TIME: Metric = Metric::histogram("relief.tile.resample_us")
        .with_description("Time spent resampling a source grid onto a tile")
        .with_unit(Unit::Microseconds);

    // ========================================================================
    // Remote services
    // ========================================================================

    /// Requests issued to remote coverage and image services.
    ///
    /// Labels: service (coverage|image), outcome (ok|error)
    pub const REMOTE_REQUESTS: Metric = Metric::counter("relief.remote.requests")
        .with_description("Requests issued to remote elevation services")
        .with_unit(Unit::Count)
        .with_labels(&["service", "outcome"]);

    // ========================================================================
    // Ingestion and catalog
    // ========================================================================

    /// Grids produced by the rasterizer.
    pub const GRIDS_INGESTED: Metric = Metric::counter("relief.ingest.grids")
        .with_description("Elevation grids produced from point clouds")
        .with_unit(Unit::Count);

    /// Lidar samples consumed by the rasterizer.
    pub const SAMPLES_INGESTED: Metric = Metric::counter("relief.ingest.samples")
        .with_description("Point-cloud samples consumed by the rasterizer")
        .with_unit(Unit::Count);

    /// Share of grid cells that received at least one sample.
    pub const GRID_FILL_RATIO: Metric = Metric::histogram("relief.ingest.fill_ratio")
        .with_description("Share of rasterized cells holding a valid elevation")
        .with_unit(Unit::Percent);

    /// Entries currently registered in the coverage catalog.
    pub const CATALOG_ENTRIES: Metric = Metric::gauge("relief.catalog.entries")
        .with_description("Entries registered in the coverage catalog")
        .with_unit(Unit::Count);

    /// All metrics, for bulk description.
    pub const ALL: &[&Metric] = &[
        &TILES_SERVED,
        &TILES_UNAVAILABLE,
        &STAGE_FALLTHROUGH,
        &RESAMPLE_TIME,
        &REMOTE_REQUESTS,
        &GRIDS_INGESTED,
        &SAMPLES_INGESTED,
        &GRID_FILL_RATIO,
        &CATALOG_ENTRIES,
    ];
}

/// Describes all metrics with the installed recorder.
///
/// Call once at startup, after a recorder is installed.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

/// Installs a Prometheus recorder and describes every metric.
///
/// The returned handle renders the current values in the text exposition format.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, metrics_exporter_prometheus::BuildError>
{
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}
