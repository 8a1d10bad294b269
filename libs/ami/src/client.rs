use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fax_core::ProviderError;

/// One AMI protocol block, keyed by header name.
pub type AmiMessage = BTreeMap<String, String>;

/// Invoked for every `UserEvent: FaxResult` block the manager emits.
pub type FaxResultHandler = Arc<dyn Fn(AmiMessage) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// CallerID presented on originated fax calls.
    pub station_id: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl AmiConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            station_id: String::new(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Persistent manager connection with lazy connect and automatic reconnect.
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: AmiConfig,
    connected: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    // Serializes concurrent connect attempts.
    conn_lock: Mutex<()>,
    fax_result: std::sync::Mutex<Option<FaxResultHandler>>,
}

impl AmiClient {
    pub fn new(config: AmiConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connected: AtomicBool::new(false),
                writer: Mutex::new(None),
                conn_lock: Mutex::new(()),
                fax_result: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Registers the handler for `FaxResult` events, replacing any previous
    /// one.
    pub fn on_fax_result(&self, handler: FaxResultHandler) {
        if let Ok(mut slot) = self.inner.fax_result.lock() {
            *slot = Some(handler);
        }
    }

    /// Connects and logs in, retrying with capped exponential backoff until
    /// the manager accepts. Returns immediately when already connected.
    // Returns a boxed future to break the async recursion cycle between
    // connect and the reconnect spawned by read_loop.
    pub fn connect(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.inner.conn_lock.lock().await;
            if self.is_connected() {
                return;
            }
            let mut delay = self.inner.config.initial_backoff;
            loop {
                match self.try_connect().await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(error = %err, delay_ms = delay.as_millis() as u64, "ami connect failed");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.inner.config.max_backoff);
                    }
                }
            }
        })
    }

    async fn try_connect(&self) -> std::io::Result<()> {
        let cfg = &self.inner.config;
        let stream = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        let (read_half, mut write_half) = stream.into_split();

        let login = encode_action(&[
            ("Action", "Login"),
            ("Username", &cfg.username),
            ("Secret", &cfg.password),
        ]);
        write_half.write_all(login.as_bytes()).await?;
        write_half.flush().await?;

        *self.inner.writer.lock().await = Some(write_half);
        self.inner.connected.store(true, Ordering::SeqCst);
        debug!(host = %cfg.host, port = cfg.port, "ami connected");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            read_loop(inner, read_half).await;
        });
        Ok(())
    }

    async fn send_action(&self, fields: &[(&str, &str)]) -> Result<(), ProviderError> {
        if !self.is_connected() {
            self.connect().await;
        }
        let raw = encode_action(fields);
        let mut writer = self.inner.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            return Err(ProviderError::transport("ami connection lost"));
        };
        write_half
            .write_all(raw.as_bytes())
            .await
            .map_err(|err| ProviderError::transport(format!("ami write failed: {err}")))?;
        write_half
            .flush()
            .await
            .map_err(|err| ProviderError::transport(format!("ami write failed: {err}")))
    }

    /// Originates a call into the `faxout` dialplan context. Delivery result
    /// arrives later as a `FaxResult` user event carrying the same job id.
    pub async fn originate_sendfax(
        &self,
        job_id: &str,
        dest: &str,
        tiff_path: &str,
    ) -> Result<(), ProviderError> {
        let variables = format!("JOBID={job_id},DEST={dest},FAXFILE={tiff_path}");
        self.send_action(&[
            ("Action", "Originate"),
            ("Channel", "Local/s@faxout"),
            ("Context", "faxout"),
            ("Exten", "s"),
            ("Priority", "1"),
            ("Async", "true"),
            ("Variable", &variables),
            ("CallerID", &self.inner.config.station_id),
        ])
        .await
    }
}

async fn read_loop(inner: Arc<Inner>, read_half: tokio::net::tcp::OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();
    let mut block = AmiMessage::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    if !block.is_empty() {
                        dispatch(&inner, std::mem::take(&mut block));
                    }
                } else if let Some((key, value)) = line.split_once(':') {
                    block.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    inner.connected.store(false, Ordering::SeqCst);
    *inner.writer.lock().await = None;
    warn!("ami connection closed, reconnecting");
    let client = AmiClient { inner };
    tokio::spawn(async move {
        client.connect().await;
    });
}

fn dispatch(inner: &Inner, message: AmiMessage) {
    let is_fax_result = message.get("Event").map(String::as_str) == Some("UserEvent")
        && message.get("UserEvent").map(String::as_str) == Some("FaxResult");
    if !is_fax_result {
        return;
    }
    let handler = inner
        .fax_result
        .lock()
        .ok()
        .and_then(|slot| slot.clone());
    if let Some(handler) = handler {
        handler(message);
    }
}

fn encode_action(fields: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// One-shot connect + login probe used by readiness checks. Never touches the
/// shared client.
pub async fn probe(host: &str, port: u16, username: &str, password: &str) -> bool {
    let Ok(stream) = TcpStream::connect((host, port)).await else {
        return false;
    };
    let (read_half, mut write_half) = stream.into_split();
    let login = encode_action(&[
        ("Action", "Login"),
        ("Username", username),
        ("Secret", password),
    ]);
    if write_half.write_all(login.as_bytes()).await.is_err() {
        return false;
    }
    if write_half.flush().await.is_err() {
        return false;
    }
    // Best-effort read of the greeting; a silent manager still counts.
    let mut lines = BufReader::new(read_half).lines();
    let _ = tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await;
    true
}
