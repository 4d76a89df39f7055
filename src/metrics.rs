//! Prometheus-compatible metrics endpoint
//!
//! Each node keeps a [`NodeStats`] block of atomic counters. A [`Metrics`] registry
//! collects the blocks of every node in the process and renders them with a `node`
//! and `role` label. Default endpoint: http://localhost:9090/metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Counters of one node
#[derive(Debug)]
pub struct NodeStats {
    pub node: String,
    pub role: &'static str,

    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_refused: AtomicU64,

    // Traffic
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub retransmits: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub decode_failures: AtomicU64,

    // Anticheat
    pub strikes: AtomicU64,
    pub penalties: AtomicU64,
    pub bans: AtomicU64,

    // Cluster
    pub redirects: AtomicU64,
    pub rooms_active: AtomicU64,

    start_time: Instant,
}

impl NodeStats {
    pub fn new(node: impl Into<String>, role: &'static str) -> Self {
        Self {
            node: node.into(),
            role,
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            strikes: AtomicU64::new(0),
            penalties: AtomicU64::new(0),
            bans: AtomicU64::new(0),
            redirects: AtomicU64::new(0),
            rooms_active: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement for gauges
    pub fn dec(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn record_received(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn samples(&self) -> [(&'static str, &'static str, &'static str, u64); 16] {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        [
            ("fleet_connections_active", "Open connections", "gauge", load(&self.connections_active)),
            ("fleet_connections_total", "Connections created", "counter", load(&self.connections_total)),
            ("fleet_connections_refused_total", "Handshakes refused at admission", "counter", load(&self.connections_refused)),
            ("fleet_datagrams_received_total", "Datagrams received", "counter", load(&self.datagrams_received)),
            ("fleet_bytes_received_total", "Bytes received", "counter", load(&self.bytes_received)),
            ("fleet_datagrams_sent_total", "Datagrams sent", "counter", load(&self.datagrams_sent)),
            ("fleet_bytes_sent_total", "Bytes sent", "counter", load(&self.bytes_sent)),
            ("fleet_retransmits_total", "Reliable packets resent", "counter", load(&self.retransmits)),
            ("fleet_duplicates_dropped_total", "Inbound packets dropped by the nonce watermark", "counter", load(&self.duplicates_dropped)),
            ("fleet_decode_failures_total", "Datagrams that failed to decode", "counter", load(&self.decode_failures)),
            ("fleet_strikes_total", "Anticheat strikes below threshold", "counter", load(&self.strikes)),
            ("fleet_penalties_total", "Terminal anticheat actions", "counter", load(&self.penalties)),
            ("fleet_bans_total", "IP bans written to the ledger", "counter", load(&self.bans)),
            ("fleet_redirects_total", "Redirects issued", "counter", load(&self.redirects)),
            ("fleet_rooms_active", "Live rooms", "gauge", load(&self.rooms_active)),
            ("fleet_uptime_seconds", "Node uptime in seconds", "counter", self.uptime_seconds()),
        ]
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("node".to_string(), self.node.clone().into());
        map.insert("role".to_string(), self.role.into());
        for (name, _, _, value) in self.samples() {
            let key = name.trim_start_matches("fleet_").to_string();
            map.insert(key, value.into());
        }
        serde_json::Value::Object(map)
    }
}

/// Registry of every node's stats in this process
#[derive(Debug, Default)]
pub struct Metrics {
    nodes: RwLock<Vec<Arc<NodeStats>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stats: Arc<NodeStats>) {
        self.nodes.write().push(stats);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let nodes = self.nodes.read();
        let mut output = String::with_capacity(4096);

        let Some(first) = nodes.first() else {
            return output;
        };

        for (index, (name, help, kind, _)) in first.samples().iter().enumerate() {
            output.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind));
            for stats in nodes.iter() {
                let value = stats.samples()[index].3;
                output.push_str(&format!(
                    "{}{{node=\"{}\",role=\"{}\"}} {}\n",
                    name, stats.node, stats.role, value
                ));
            }
        }

        output
    }

    /// JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let nodes: Vec<serde_json::Value> =
            self.nodes.read().iter().map(|stats| stats.to_json()).collect();
        serde_json::json!({ "nodes": nodes }).to_string()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json") {
                        let body = metrics.to_json();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") {
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK".to_string()
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
