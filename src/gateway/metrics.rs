use std::collections::HashMap;
use std::time::Duration;

/// Latency buckets shared by both histograms, 10ms to 60s.
const LATENCY_BUCKETS: [f64; 12] = [
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub max_channel_series: usize,
    pub max_model_series: usize,
    pub max_user_series: usize,
    pub max_path_series: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_channel_series: 128,
            max_model_series: 1024,
            max_user_series: 1024,
            max_path_series: 64,
        }
    }
}

#[derive(Clone, Debug)]
struct DurationHistogram {
    bucket_counts: [u64; 12],
    sum_seconds: f64,
    count: u64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            bucket_counts: [0; 12],
            sum_seconds: 0.0,
            count: 0,
        }
    }
}

impl DurationHistogram {
    fn observe(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_seconds += seconds;
        self.count = self.count.saturating_add(1);
        for (idx, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[idx] = self.bucket_counts[idx].saturating_add(1);
            }
        }
    }
}

/// Prometheus-exposition counters for the dataplane. Kept as a plain
/// struct behind the composition root's mutex; `render` produces the
/// text format served at `/metrics`.
#[derive(Debug)]
pub struct GatewayMetrics {
    config: MetricsConfig,

    requests_total: u64,
    requests_by_path: HashMap<String, u64>,
    requests_in_flight: u64,
    active_connections: u64,

    channel_requests_total: HashMap<String, u64>,
    channel_errors_total: HashMap<String, u64>,
    channel_status: HashMap<String, u64>,

    tokens_used_total: HashMap<String, u64>,
    quota_used_total: HashMap<String, u64>,

    request_duration_seconds: HashMap<String, DurationHistogram>,
    channel_latency_seconds: HashMap<String, DurationHistogram>,
}

impl GatewayMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            requests_total: 0,
            requests_by_path: HashMap::new(),
            requests_in_flight: 0,
            active_connections: 0,
            channel_requests_total: HashMap::new(),
            channel_errors_total: HashMap::new(),
            channel_status: HashMap::new(),
            tokens_used_total: HashMap::new(),
            quota_used_total: HashMap::new(),
            request_duration_seconds: HashMap::new(),
            channel_latency_seconds: HashMap::new(),
        }
    }

    pub fn record_request(&mut self, path: &str) {
        self.requests_total = self.requests_total.saturating_add(1);
        bump_limited(
            &mut self.requests_by_path,
            path,
            self.config.max_path_series,
        );
    }

    pub fn record_in_flight_inc(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_add(1);
    }

    pub fn record_in_flight_dec(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
    }

    pub fn record_connection_open(&mut self) {
        self.active_connections = self.active_connections.saturating_add(1);
    }

    pub fn record_connection_close(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }

    pub fn record_channel_request(&mut self, channel_id: i64) {
        bump_limited(
            &mut self.channel_requests_total,
            &channel_id.to_string(),
            self.config.max_channel_series,
        );
    }

    pub fn record_channel_error(&mut self, channel_id: i64) {
        bump_limited(
            &mut self.channel_errors_total,
            &channel_id.to_string(),
            self.config.max_channel_series,
        );
    }

    pub fn record_channel_status(&mut self, channel_id: i64, enabled: bool) {
        if let Some(entry) = entry_limited(
            &mut self.channel_status,
            &channel_id.to_string(),
            self.config.max_channel_series,
        ) {
            *entry = u64::from(enabled);
        }
    }

    pub fn record_tokens_used(&mut self, model: &str, tokens: u64) {
        add_limited(
            &mut self.tokens_used_total,
            model,
            self.config.max_model_series,
            tokens,
        );
    }

    pub fn record_quota_used(&mut self, user_id: i64, quota: u64) {
        add_limited(
            &mut self.quota_used_total,
            &user_id.to_string(),
            self.config.max_user_series,
            quota,
        );
    }

    pub fn observe_request_duration(&mut self, path: &str, duration: Duration) {
        if let Some(histogram) = entry_limited(
            &mut self.request_duration_seconds,
            path,
            self.config.max_path_series,
        ) {
            histogram.observe(duration);
        }
    }

    pub fn observe_channel_latency(&mut self, channel_id: i64, duration: Duration) {
        if let Some(histogram) = entry_limited(
            &mut self.channel_latency_seconds,
            &channel_id.to_string(),
            self.config.max_channel_series,
        ) {
            histogram.observe(duration);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP requests_total Total requests handled by the gateway.\n");
        out.push_str("# TYPE requests_total counter\n");
        out.push_str(&format!("requests_total {}\n", self.requests_total));

        write_counter_map(
            &mut out,
            "requests_by_path_total",
            "Requests grouped by inbound path.",
            "path",
            &self.requests_by_path,
        );

        write_counter_map(
            &mut out,
            "channel_requests_total",
            "Requests dispatched per channel.",
            "channel",
            &self.channel_requests_total,
        );

        write_counter_map(
            &mut out,
            "channel_errors_total",
            "Upstream errors per channel.",
            "channel",
            &self.channel_errors_total,
        );

        write_counter_map(
            &mut out,
            "tokens_used_total",
            "Tokens consumed per model.",
            "model",
            &self.tokens_used_total,
        );

        write_counter_map(
            &mut out,
            "quota_used_total",
            "Quota consumed per user.",
            "user",
            &self.quota_used_total,
        );

        write_histogram_map(
            &mut out,
            "request_duration_seconds",
            "End-to-end request duration.",
            "path",
            &self.request_duration_seconds,
        );

        write_histogram_map(
            &mut out,
            "channel_latency_seconds",
            "Upstream latency per channel.",
            "channel",
            &self.channel_latency_seconds,
        );

        out.push_str("# HELP requests_in_flight Requests currently being served.\n");
        out.push_str("# TYPE requests_in_flight gauge\n");
        out.push_str(&format!("requests_in_flight {}\n", self.requests_in_flight));

        write_gauge_map(
            &mut out,
            "channel_status",
            "Channel status (1 enabled, 0 disabled).",
            "channel",
            &self.channel_status,
        );

        out.push_str("# HELP active_connections Open streaming connections.\n");
        out.push_str("# TYPE active_connections gauge\n");
        out.push_str(&format!("active_connections {}\n", self.active_connections));

        out
    }
}

const OVERFLOW_SERIES_LABEL: &str = "__overflow__";

fn entry_limited<'a, T: Default>(
    map: &'a mut HashMap<String, T>,
    key: &str,
    max_series: usize,
) -> Option<&'a mut T> {
    if max_series == 0 {
        return None;
    }
    if map.contains_key(key) {
        return map.get_mut(key);
    }
    if map.len() < max_series {
        return Some(map.entry(key.to_string()).or_default());
    }
    if map.contains_key(OVERFLOW_SERIES_LABEL) {
        return map.get_mut(OVERFLOW_SERIES_LABEL);
    }
    Some(map.entry(OVERFLOW_SERIES_LABEL.to_string()).or_default())
}

fn bump_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize) {
    if let Some(entry) = entry_limited(map, key, max_series) {
        *entry = entry.saturating_add(1);
    }
}

fn add_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize, delta: u64) {
    if let Some(entry) = entry_limited(map, key, max_series) {
        *entry = entry.saturating_add(delta);
    }
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));

    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn write_gauge_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} gauge\n"));

    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn write_histogram_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, DurationHistogram>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} histogram\n"));

    let mut entries: Vec<(&String, &DurationHistogram)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, hist) in entries {
        let value = escape_label_value(value);
        for (idx, bound) in LATENCY_BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "{metric}_bucket{{{label}=\"{value}\",le=\"{bound}\"}} {}\n",
                hist.bucket_counts[idx]
            ));
        }
        out.push_str(&format!(
            "{metric}_bucket{{{label}=\"{value}\",le=\"+Inf\"}} {}\n",
            hist.count
        ));
        out.push_str(&format!(
            "{metric}_sum{{{label}=\"{value}\"}} {}\n",
            hist.sum_seconds
        ));
        out.push_str(&format!(
            "{metric}_count{{{label}=\"{value}\"}} {}\n",
            hist.count
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_core_series() {
        let mut metrics = GatewayMetrics::new(MetricsConfig::default());
        metrics.record_request("/v1/chat/completions");
        metrics.record_channel_request(11);
        metrics.record_channel_error(7);
        metrics.record_tokens_used("gpt-4o-mini", 120);
        metrics.record_quota_used(1, 12);
        metrics.observe_request_duration("/v1/chat/completions", Duration::from_millis(80));
        metrics.observe_channel_latency(11, Duration::from_millis(40));
        metrics.record_in_flight_inc();
        metrics.record_channel_status(11, true);
        metrics.record_connection_open();

        let rendered = metrics.render();
        assert!(rendered.contains("requests_total 1"));
        assert!(rendered.contains("channel_requests_total{channel=\"11\"} 1"));
        assert!(rendered.contains("channel_errors_total{channel=\"7\"} 1"));
        assert!(rendered.contains("tokens_used_total{model=\"gpt-4o-mini\"} 120"));
        assert!(rendered.contains("quota_used_total{user=\"1\"} 12"));
        assert!(rendered.contains(
            "request_duration_seconds_bucket{path=\"/v1/chat/completions\",le=\"0.1\"} 1"
        ));
        assert!(rendered.contains("channel_latency_seconds_count{channel=\"11\"} 1"));
        assert!(rendered.contains("requests_in_flight 1"));
        assert!(rendered.contains("channel_status{channel=\"11\"} 1"));
        assert!(rendered.contains("active_connections 1"));
    }

    #[test]
    fn series_overflow_collapses_into_one_label() {
        let mut metrics = GatewayMetrics::new(MetricsConfig {
            max_channel_series: 1,
            max_model_series: 1,
            max_user_series: 1,
            max_path_series: 1,
        });
        metrics.record_channel_request(1);
        metrics.record_channel_request(2);
        metrics.record_channel_request(3);

        let rendered = metrics.render();
        assert!(rendered.contains("channel_requests_total{channel=\"1\"} 1"));
        assert!(rendered.contains("channel_requests_total{channel=\"__overflow__\"} 2"));
    }

    #[test]
    fn histogram_buckets_are_cumulative_in_range() {
        let mut hist = DurationHistogram::default();
        hist.observe(Duration::from_millis(30));
        hist.observe(Duration::from_secs(20));

        // 30ms lands in every bucket from 0.05 up; 20s only in 30/60.
        assert_eq!(hist.count, 2);
        assert_eq!(hist.bucket_counts[2], 1); // 0.05
        assert_eq!(hist.bucket_counts[10], 2); // 30.0
        assert_eq!(hist.bucket_counts[11], 2); // 60.0
    }

    #[test]
    fn escapes_label_values() {
        assert_eq!(escape_label_value("a\"b"), "a\\\"b");
        assert_eq!(escape_label_value("a\\b"), "a\\\\b");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }
}
