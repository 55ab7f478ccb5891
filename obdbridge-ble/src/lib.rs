//! BLE connection backend.
//!
//! `btleplug` is async; the rest of the engine is synchronous. A dedicated
//! worker thread owns a single-threaded `tokio` runtime and the `btleplug`
//! peripheral handle. Foreground calls ([`Connection::write`],
//! [`Connection::read_until`], ...) send a request over a channel and block
//! on a one-shot reply with the caller's timeout enforced on the receiving
//! end — the same shape `tachtalk`'s dongle task uses to let synchronous
//! callers drive a background-owned connection.

use log::{debug, error, info, warn};
use obdbridge_connection::{ConnError, Connection};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures_util::StreamExt;

/// A single-use reply channel. The worker thread sends into it from inside
/// an async task; the foreground thread blocks on `recv_timeout`, which
/// parks the OS thread without needing a runtime of its own.
type Reply<T> = std_mpsc::Sender<T>;
type ReplyRx<T> = std_mpsc::Receiver<T>;

/// Nordic UART Service UUID, the de-facto standard most ELM327 BLE clones
/// expose (write to RX, subscribe to TX).
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
/// RX characteristic (host writes commands here).
pub const DEFAULT_WRITE_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
/// TX characteristic (host subscribes for notifications here).
pub const DEFAULT_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// How often the rx buffer is polled while waiting for more notification
/// data to arrive (spec: no busier than every 10ms).
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Discover nearby peripherals whose advertised name looks like an OBD-II
/// BLE adapter ("OBD", "ELM327", "Vgate", "OBDLink", ...). Blocks for up to
/// `scan_time`.
pub fn discover_obd_devices(scan_time: Duration) -> Result<Vec<String>, ConnError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;

    runtime.block_on(async {
        let manager = Manager::new()
            .await
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
        let Some(adapter) = adapters.into_iter().next() else {
            return Err(ConnError::Io(std::io::Error::other("no BLE adapter present")));
        };

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
        tokio::time::sleep(scan_time).await;

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;

        let mut names = Vec::new();
        for p in peripherals {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if is_likely_obd_adapter(&name) {
                        names.push(name);
                    }
                }
            }
        }
        Ok(names)
    })
}

fn is_likely_obd_adapter(name: &str) -> bool {
    const PATTERNS: &[&str] = &["OBD", "ELM327", "VGATE", "OBDLINK", "VEEPEAK", "VLINKER"];
    let upper = name.to_uppercase();
    PATTERNS.iter().any(|p| upper.contains(p))
}

enum BleRequest {
    Connect {
        name_filter: String,
        service: Uuid,
        write_char: Uuid,
        notify_char: Uuid,
        timeout: Duration,
        reply: Reply<Result<(), ConnError>>,
    },
    Write {
        bytes: Vec<u8>,
        reply: Reply<Result<(), ConnError>>,
    },
    Close {
        reply: Reply<Result<(), ConnError>>,
    },
}

/// BLE backend for ELM327-class adapters.
///
/// Implements [`Connection`] in terms of a write characteristic and a
/// notify characteristic. `read`/`read_until` drain a buffer fed by a
/// background task subscribed to notifications, never blocking the tokio
/// runtime on the calling thread.
pub struct BleConnection {
    name_filter: String,
    service: Uuid,
    write_char: Uuid,
    notify_char: Uuid,
    connect_timeout: Duration,
    tx: Option<std_mpsc::Sender<BleRequest>>,
    worker: Option<std::thread::JoinHandle<()>>,
    rx_buffer: Arc<Mutex<VecDeque<u8>>>,
    open: Arc<AtomicBool>,
}

impl BleConnection {
    /// Build a connection that will match the first peripheral whose
    /// advertised name contains `name_filter`, using the Nordic UART
    /// Service UUIDs.
    #[must_use]
    pub fn new(name_filter: impl Into<String>, connect_timeout: Duration) -> Self {
        Self::with_uuids(
            name_filter,
            DEFAULT_SERVICE_UUID,
            DEFAULT_WRITE_UUID,
            DEFAULT_NOTIFY_UUID,
            connect_timeout,
        )
    }

    /// Build a connection against a non-standard GATT layout.
    #[must_use]
    pub fn with_uuids(
        name_filter: impl Into<String>,
        service: Uuid,
        write_char: Uuid,
        notify_char: Uuid,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name_filter: name_filter.into(),
            service,
            write_char,
            notify_char,
            connect_timeout,
            tx: None,
            worker: None,
            rx_buffer: Arc::new(Mutex::new(VecDeque::new())),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    fn send_request(&self, request: BleRequest) -> Result<(), ConnError> {
        self.tx
            .as_ref()
            .ok_or(ConnError::NotOpen)?
            .send(request)
            .map_err(|_| ConnError::Io(std::io::Error::other("BLE worker thread is gone")))
    }
}

impl Connection for BleConnection {
    fn open(&mut self) -> Result<(), ConnError> {
        if self.tx.is_some() {
            return Ok(());
        }

        let (req_tx, req_rx) = std_mpsc::channel::<BleRequest>();
        let rx_buffer = Arc::clone(&self.rx_buffer);
        let open_flag = Arc::clone(&self.open);

        let worker = std::thread::spawn(move || run_worker(req_rx, rx_buffer, open_flag));
        self.tx = Some(req_tx);
        self.worker = Some(worker);

        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.send_request(BleRequest::Connect {
            name_filter: self.name_filter.clone(),
            service: self.service,
            write_char: self.write_char,
            notify_char: self.notify_char,
            timeout: self.connect_timeout,
            reply: reply_tx,
        })?;

        recv_reply(&reply_rx, self.connect_timeout + Duration::from_secs(1))
    }

    fn close(&mut self) -> Result<(), ConnError> {
        if let Some(tx) = self.tx.take() {
            let (reply_tx, reply_rx) = std_mpsc::channel();
            let _ = tx.send(BleRequest::Close { reply: reply_tx });
            let _ = recv_reply(&reply_rx, Duration::from_secs(2));
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.rx_buffer.lock().expect("rx_buffer mutex poisoned").clear();
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.send_request(BleRequest::Write {
            bytes: bytes.to_vec(),
            reply: reply_tx,
        })?;
        recv_reply(&reply_rx, Duration::from_secs(5))
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnError::NotOpen);
        }
        let mut buf = self.rx_buffer.lock().expect("rx_buffer mutex poisoned");
        let take = n.min(buf.len());
        Ok(buf.drain(..take).collect())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ConnError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnError::NotOpen);
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut buf = self.rx_buffer.lock().expect("rx_buffer mutex poisoned");
                if let Some(pos) = buf.iter().position(|&b| b == terminator) {
                    return Ok(buf.drain(..=pos).collect());
                }
            }
            if Instant::now() >= deadline {
                return Err(ConnError::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn flush_input(&mut self) -> Result<(), ConnError> {
        self.rx_buffer.lock().expect("rx_buffer mutex poisoned").clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn recv_reply<T>(reply_rx: &ReplyRx<Result<T, ConnError>>, timeout: Duration) -> Result<T, ConnError> {
    match reply_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(ConnError::Timeout),
    }
}

fn run_worker(
    req_rx: std_mpsc::Receiver<BleRequest>,
    rx_buffer: Arc<Mutex<VecDeque<u8>>>,
    open_flag: Arc<AtomicBool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(r) => r,
        Err(e) => {
            error!("failed to start BLE worker runtime: {e}");
            return;
        }
    };

    runtime.block_on(async move {
        let mut peripheral: Option<Peripheral> = None;
        let mut write_characteristic: Option<Characteristic> = None;

        while let Ok(request) = req_rx.recv() {
            match request {
                BleRequest::Connect {
                    name_filter,
                    service,
                    write_char,
                    notify_char,
                    timeout,
                    reply,
                } => {
                    let result = connect_and_subscribe(
                        &name_filter,
                        service,
                        write_char,
                        notify_char,
                        timeout,
                        Arc::clone(&rx_buffer),
                    )
                    .await;
                    match result {
                        Ok((p, wc)) => {
                            info!("BLE connected to OBD adapter matching {name_filter:?}");
                            peripheral = Some(p);
                            write_characteristic = Some(wc);
                            open_flag.store(true, Ordering::SeqCst);
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                BleRequest::Write { bytes, reply } => {
                    let result = match (&peripheral, &write_characteristic) {
                        (Some(p), Some(wc)) => p
                            .write(wc, &bytes, WriteType::WithoutResponse)
                            .await
                            .map_err(|e| ConnError::Io(std::io::Error::other(e))),
                        _ => Err(ConnError::NotOpen),
                    };
                    let _ = reply.send(result);
                }
                BleRequest::Close { reply } => {
                    if let Some(p) = peripheral.take() {
                        if let Err(e) = p.disconnect().await {
                            warn!("error disconnecting BLE peripheral: {e}");
                        }
                    }
                    write_characteristic = None;
                    open_flag.store(false, Ordering::SeqCst);
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }
        debug!("BLE worker thread exiting");
    });
}

async fn connect_and_subscribe(
    name_filter: &str,
    service: Uuid,
    write_char: Uuid,
    notify_char: Uuid,
    timeout: Duration,
    rx_buffer: Arc<Mutex<VecDeque<u8>>>,
) -> Result<(Peripheral, Characteristic), ConnError> {
    let manager = Manager::new()
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or_else(|| ConnError::Io(std::io::Error::other("no BLE adapter present")))?;

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let peripheral = loop {
        if let Some(found) = scan_once(&adapter, name_filter).await? {
            break found;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ConnError::Io(std::io::Error::other(format!(
                "no BLE peripheral matching {name_filter:?} found before timeout"
            ))));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    peripheral
        .connect()
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
    peripheral
        .discover_services()
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;

    let characteristics = peripheral.characteristics();
    let write_characteristic = characteristics
        .iter()
        .find(|c| c.uuid == write_char && c.service_uuid == service)
        .or_else(|| characteristics.iter().find(|c| c.uuid == write_char))
        .cloned()
        .ok_or_else(|| ConnError::Io(std::io::Error::other("write characteristic not found")))?;
    let notify_characteristic = characteristics
        .iter()
        .find(|c| c.uuid == notify_char)
        .cloned()
        .ok_or_else(|| ConnError::Io(std::io::Error::other("notify characteristic not found")))?;

    peripheral
        .subscribe(&notify_characteristic)
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;

    let mut notifications = peripheral
        .notifications()
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;

    tokio::spawn(async move {
        while let Some(data) = notifications.next().await {
            let mut buf = rx_buffer.lock().expect("rx_buffer mutex poisoned");
            buf.extend(data.value.iter().copied());
        }
    });

    Ok((peripheral, write_characteristic))
}

async fn scan_once(
    adapter: &btleplug::platform::Adapter,
    name_filter: &str,
) -> Result<Option<Peripheral>, ConnError> {
    for p in adapter
        .peripherals()
        .await
        .map_err(|e| ConnError::Io(std::io::Error::other(e)))?
    {
        if let Ok(Some(props)) = p.properties().await {
            if let Some(name) = props.local_name {
                if name.contains(name_filter) {
                    return Ok(Some(p));
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obd_adapter_name_patterns_match_case_insensitively() {
        assert!(is_likely_obd_adapter("OBDII"));
        assert!(is_likely_obd_adapter("vlinker"));
        assert!(is_likely_obd_adapter("Vgate iCar Pro"));
        assert!(!is_likely_obd_adapter("Bose QC35"));
    }
}
