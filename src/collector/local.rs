//! Local demo collectors reading `/proc`.
//!
//! These exist to exercise the [`Source`] contract end-to-end from the
//! binary without remote transports. Real deployments register their own
//! sources (SSH, SQL, API clients) the same way.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::collector::{Collector, CollectorError, Source};
use crate::event::{Event, FieldRule, FieldType};
use crate::eventops::{blacklist, Blacklist, DeltaOps, EventOps};
use crate::registry::{Registry, RegistryError};
use crate::session::Session;
use std::time::Duration;

/// Register the local demo collectors.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(loadavg())?;
    registry.add(cpustat())?;
    Ok(())
}

/// `/local/system/loadavg`: load averages and process counts.
pub fn loadavg() -> Collector {
    Collector::new("/local/system/loadavg", Arc::new(LoadAvgSource)).with_event_ops(EventOps {
        round: 2,
        fields: vec![
            FieldRule::new("load1", FieldType::Float),
            FieldRule::new("load5", FieldType::Float),
            FieldRule::new("load15", FieldType::Float),
            FieldRule::new("procs_running", FieldType::Integer),
            FieldRule::new("procs_total", FieldType::Integer),
        ],
        delta: None,
    })
}

/// `/local/system/cpustat`: per-second rates over the aggregate cpu counters.
pub fn cpustat() -> Collector {
    Collector::new("/local/system/cpustat", Arc::new(CpuStatSource)).with_event_ops(EventOps {
        round: 2,
        fields: Vec::new(),
        delta: Some(DeltaOps {
            key_field: "cpu".to_string(),
            rate: true,
            ttl: Duration::from_secs(900),
            blacklist: blacklist(["cpu"]),
            rate_blacklist: Blacklist::new(),
        }),
    })
}

struct LoadAvgSource;

#[async_trait::async_trait]
impl Source for LoadAvgSource {
    async fn get_data(
        &self,
        _session: &Session,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CollectorError> {
        let raw = tokio::fs::read_to_string("/proc/loadavg").await?;
        let event = parse_loadavg(&raw)?;
        let _ = out.send(event).await;
        Ok(())
    }
}

fn parse_loadavg(raw: &str) -> Result<Event, CollectorError> {
    let mut parts = raw.split_whitespace();
    let mut event = Event::new();
    for field in ["load1", "load5", "load15"] {
        let value = parts
            .next()
            .ok_or_else(|| CollectorError::Parse(format!("loadavg: missing {field}")))?;
        event.insert(field.to_string(), value.into());
    }

    let procs = parts
        .next()
        .ok_or_else(|| CollectorError::Parse("loadavg: missing process counts".into()))?;
    let (running, total) = procs
        .split_once('/')
        .ok_or_else(|| CollectorError::Parse(format!("loadavg: bad process counts: {procs}")))?;
    event.insert("procs_running".to_string(), running.into());
    event.insert("procs_total".to_string(), total.into());
    Ok(event)
}

struct CpuStatSource;

#[async_trait::async_trait]
impl Source for CpuStatSource {
    async fn get_data(
        &self,
        _session: &Session,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CollectorError> {
        let raw = tokio::fs::read_to_string("/proc/stat").await?;
        let event = parse_cpustat(&raw)?;
        let _ = out.send(event).await;
        Ok(())
    }
}

fn parse_cpustat(raw: &str) -> Result<Event, CollectorError> {
    let line = raw
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| CollectorError::Parse("stat: no aggregate cpu line".into()))?;

    let mut parts = line.split_whitespace();
    let mut event = Event::new();
    event.insert("cpu".to_string(), parts.next().unwrap_or("cpu").into());
    for field in ["user", "nice", "system", "idle", "iowait", "irq", "softirq"] {
        let value = parts
            .next()
            .ok_or_else(|| CollectorError::Parse(format!("stat: missing {field}")))?;
        event.insert(field.to_string(), value.into());
    }
    Ok(event)
}
