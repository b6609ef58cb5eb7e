//! Pure broker scoring model
//!
//! Maps a broker's measured metrics and a category weight profile to a
//! scalar score in [0, 1]. Higher is better.

/// Normalization baselines. A broker at or beyond a baseline contributes
/// nothing (latency, connections) or saturates (bandwidth) for that metric.
const LATENCY_BASELINE_MS: f64 = 100.0;
const BANDWIDTH_BASELINE_BPS: f64 = 1_000_000.0;
const CONNECTION_BASELINE: f64 = 100.0;

/// Relative importance of each metric when scoring a broker.
///
/// Components are each in [0, 1] and sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub latency: f64,
    pub bandwidth: f64,
    pub connection: f64,
}

/// Look up the weight profile for a device category.
///
/// Unknown categories fall back to the `sensor` profile.
pub fn weights_for_category(category: &str) -> ScoreWeights {
    let (latency, bandwidth, connection) = match category {
        "sensor" | "meter" | "light" | "appliance" | "beacon" => (0.6, 0.2, 0.2),
        "camera" | "signage" => (0.2, 0.6, 0.2),
        "wearable" => (0.3, 0.4, 0.3),
        "traffic" => (0.4, 0.2, 0.4),
        "drone" => (0.3, 0.5, 0.2),
        "rfid" => (0.3, 0.2, 0.5),
        _ => (0.6, 0.2, 0.2),
    };
    ScoreWeights {
        latency,
        bandwidth,
        connection,
    }
}

/// Compute the weighted score for one broker's metrics.
///
/// A metric that has never been measured (zero) contributes nothing.
pub fn weighted_score(
    latency_ms: f64,
    bandwidth_bps: f64,
    connection_count: u32,
    weights: &ScoreWeights,
) -> f64 {
    let latency_component = if latency_ms > 0.0 {
        (1.0 - latency_ms / LATENCY_BASELINE_MS).max(0.0)
    } else {
        0.0
    };

    let bandwidth_component = if bandwidth_bps > 0.0 {
        (bandwidth_bps / BANDWIDTH_BASELINE_BPS).min(1.0)
    } else {
        0.0
    };

    let connection_component = if connection_count > 0 {
        (1.0 - f64::from(connection_count) / CONNECTION_BASELINE).max(0.0)
    } else {
        0.0
    };

    latency_component * weights.latency
        + bandwidth_component * weights.bandwidth
        + connection_component * weights.connection
}
