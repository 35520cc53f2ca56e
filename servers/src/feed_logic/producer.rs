use crate::feed_logic::config::FeedConfig;
use lib_realtime::models::message::{TOPIC_ALARM, TOPIC_PRODUCTION_DATA, TOPIC_SYSTEM_STATUS};
use lib_realtime::Envelope;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;

const TEMPERATURE_LIMIT: f64 = 85.0;

struct LineState {
    id: String,
    temperature: f64,
    pressure: f64,
    speed: f64,
    output: u64,
    last_reading: Option<Value>,
}

/// Generates readings for a fixed set of simulated production lines.
pub struct Producer {
    lines: Vec<LineState>,
    duplicate_every: u64,
    alarm_probability: f64,
    ticks: u64,
}

impl Producer {
    pub fn new(config: &FeedConfig) -> Self {
        let lines = (1..=config.lines)
            .map(|n| LineState {
                id: format!("line-{}", n),
                temperature: 65.0 + n as f64,
                pressure: 2.0,
                speed: 120.0,
                output: 0,
                last_reading: None,
            })
            .collect();
        Self {
            lines,
            duplicate_every: config.duplicate_every,
            alarm_probability: config.alarm_probability,
            ticks: 0,
        }
    }

    /// One reading per line, plus any alarms and the scheduled duplicate.
    pub fn tick<R: Rng>(&mut self, now_ms: i64, rng: &mut R) -> Vec<Envelope> {
        self.ticks += 1;
        let mut frames = Vec::with_capacity(self.lines.len() + 1);

        for line in &mut self.lines {
            line.temperature = (line.temperature + rng.random_range(-1.5..1.5)).clamp(40.0, 100.0);
            line.pressure = (line.pressure + rng.random_range(-0.1..0.1)).clamp(1.0, 4.0);
            line.speed = (line.speed + rng.random_range(-3.0..3.0)).clamp(60.0, 180.0);
            line.output += rng.random_range(0..5);

            let reading = json!({
                "sourceId": line.id,
                "timestamp": now_ms,
                "temperature": (line.temperature * 10.0).round() / 10.0,
                "pressure": (line.pressure * 100.0).round() / 100.0,
                "speed": line.speed.round(),
                "output": line.output,
            });
            line.last_reading = Some(reading.clone());
            frames.push(Envelope::new(TOPIC_PRODUCTION_DATA, reading));

            let overheated = line.temperature > TEMPERATURE_LIMIT;
            if overheated || rng.random::<f64>() < self.alarm_probability {
                let (level, content) = if overheated {
                    ("critical", format!("Temperature {:.1} above limit", line.temperature))
                } else {
                    ("warning", "Throughput deviation detected".to_string())
                };
                frames.push(Envelope::new(
                    TOPIC_ALARM,
                    json!({ "sourceId": line.id, "level": level, "content": content }),
                ));
            }
        }

        // Replays a reading the clients already have, to exercise their dedup.
        if self.duplicate_every > 0 && self.ticks % self.duplicate_every == 0 {
            if let Some(reading) = self.lines.first().and_then(|l| l.last_reading.clone()) {
                frames.push(Envelope::new(TOPIC_PRODUCTION_DATA, reading));
            }
        }

        frames
    }

    pub fn status(&self, clients: usize, uptime: Duration) -> Envelope {
        Envelope::new(
            TOPIC_SYSTEM_STATUS,
            json!({
                "status": "ok",
                "lines": self.lines.len(),
                "connectedClients": clients,
                "uptimeSeconds": uptime.as_secs(),
            }),
        )
    }
}

fn publish(frames: &broadcast::Sender<String>, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(text) => {
            if frames.send(text).is_err() {
                log::trace!("No clients connected, '{}' frame dropped", envelope.topic);
            }
        }
        Err(e) => log::error!("Failed to serialize '{}' frame: {}", envelope.topic, e),
    }
}

pub async fn run(
    config: FeedConfig,
    frames: broadcast::Sender<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut producer = Producer::new(&config);
    let mut rng = StdRng::from_os_rng();
    let started = Instant::now();
    let mut reading_interval = interval(Duration::from_millis(config.interval_ms));
    let mut status_interval = interval(Duration::from_secs(config.status_interval_seconds));

    log::info!(
        "Producing {} lines every {}ms (duplicate every {} ticks)",
        config.lines,
        config.interval_ms,
        config.duplicate_every
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Producer received shutdown signal.");
                break;
            }
            _ = reading_interval.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                for envelope in producer.tick(now_ms, &mut rng) {
                    publish(&frames, &envelope);
                }
            }
            _ = status_interval.tick() => {
                publish(&frames, &producer.status(frames.receiver_count(), started.elapsed()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(lines: usize, duplicate_every: u64) -> FeedConfig {
        FeedConfig {
            port: 0,
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
            lines,
            interval_ms: 100,
            duplicate_every,
            status_interval_seconds: 10,
            alarm_probability: 0.0,
        }
    }

    fn readings(frames: &[Envelope]) -> Vec<&Envelope> {
        frames.iter().filter(|e| e.topic == TOPIC_PRODUCTION_DATA).collect()
    }

    #[test]
    fn test_one_reading_per_line() {
        let mut producer = Producer::new(&config(3, 0));
        let mut rng = StdRng::seed_from_u64(7);
        let frames = producer.tick(1_000, &mut rng);
        let readings = readings(&frames);
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[2].data["sourceId"], "line-3");
        assert_eq!(readings[0].data["timestamp"], 1_000);
    }

    #[test]
    fn test_duplicate_is_replayed_on_schedule() {
        let mut producer = Producer::new(&config(2, 2));
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(readings(&producer.tick(1_000, &mut rng)).len(), 2);

        let frames = producer.tick(2_000, &mut rng);
        let readings = readings(&frames);
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[2].data, readings[0].data);
    }

    #[test]
    fn test_status_frame() {
        let producer = Producer::new(&config(4, 0));
        let status = producer.status(2, Duration::from_secs(90));
        assert_eq!(status.topic, TOPIC_SYSTEM_STATUS);
        assert_eq!(status.data["lines"], 4);
        assert_eq!(status.data["connectedClients"], 2);
    }
}
