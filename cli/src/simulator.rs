// Simulated BLE peripheral
//
// Stands in for the platform Bluetooth stack: scans become FutureStreams fed
// from a timer task, characteristic reads become timer-backed Futures.

use anyhow::anyhow;
use bluecap_core::{
    Future, FutureError, FutureResult, FutureStream, PoolContext, Promise, StreamPromise,
};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// GATT status reported by the simulated stack when a read is told to fail
pub const GATT_READ_NOT_PERMITTED: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peripheral: String,
    pub sequence: u32,
    pub rssi: i16,
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} ({} dBm)", self.peripheral, self.sequence, self.rssi)
    }
}

/// A running scan: its advertisement stream plus a Future that completes
/// with the number of advertisements pushed once the scan stops.
pub struct ScanSession {
    pub advertisements: FutureStream<Advertisement>,
    pub finished: Future<u32>,
}

pub struct SimulatedPeripheral {
    name: String,
    pool: PoolContext,
}

impl SimulatedPeripheral {
    pub fn new(name: impl Into<String>, pool: PoolContext) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push `count` advertisements, one every `interval`
    pub fn scan(&self, count: u32, interval: Duration, capacity: Option<usize>) -> ScanSession {
        let promise = StreamPromise::new(capacity);
        let advertisements = promise.stream();
        let finished = Promise::new();
        let finished_future = finished.future();
        let name = self.name.clone();

        self.pool.handle().spawn(async move {
            debug!("Scan started for {}", name);
            for sequence in 0..count {
                tokio::time::sleep(interval).await;
                promise.push(Advertisement {
                    peripheral: name.clone(),
                    sequence,
                    rssi: simulated_rssi(sequence),
                });
            }
            debug!("Scan stopped for {} after {} advertisements", name, count);
            finished.succeed(count);
        });

        ScanSession {
            advertisements,
            finished: finished_future,
        }
    }

    /// Read the battery level characteristic after `latency`
    pub fn read_battery(&self, latency: Duration, fail: bool) -> Future<Vec<u8>> {
        let result = if fail {
            Err(FutureError::from(anyhow!(
                "GATT read failed on {}: status 0x{:02x}",
                self.name,
                GATT_READ_NOT_PERMITTED
            )))
        } else {
            Ok(vec![87])
        };
        Future::after(&self.pool, latency, result)
    }
}

/// Battery Level characteristic: one byte, 0..=100
pub fn decode_battery_level(bytes: Vec<u8>) -> FutureResult<u8> {
    match bytes.first() {
        Some(level) if *level <= 100 => Ok(*level),
        Some(_) => Err(FutureError::InvalidValue),
        None => Err(FutureError::NoSuchElement),
    }
}

fn simulated_rssi(sequence: u32) -> i16 {
    -40 - (sequence % 30) as i16
}
