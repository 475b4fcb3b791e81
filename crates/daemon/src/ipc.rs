//! Local IPC server
//!
//! A filesystem-addressed stream socket speaking a one-line textual
//! protocol: one request per connection, one response, close. State
//! requests answer from the shared snapshots; LCD/LED/shutdown requests go
//! through the protocol engine and the runtime.

use crate::events::BayState;
use crate::pmc::{registers, PmcClient, Value};
use crate::thermal::{ShutdownRequest, ThermalStatus};
use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

/// Longest request line accepted from a client.
const MAX_REQUEST_LEN: u64 = 1024;
/// A client gets this long for its whole request/response exchange.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handles the request handler works against.
pub struct IpcContext {
    pub client: PmcClient,
    pub thermal: Arc<RwLock<ThermalStatus>>,
    pub bays: Arc<RwLock<BayState>>,
    pub shutdown_tx: mpsc::Sender<ShutdownRequest>,
    /// Grace delay for the `shutdown` request.
    pub shutdown_grace: Duration,
    pub version: Option<String>,
}

#[derive(Clone)]
pub struct IpcServer {
    listener: Arc<UnixListener>,
    limiter: Arc<Semaphore>,
    ctx: Arc<IpcContext>,
}

impl IpcServer {
    /// Unlink any stale socket, bind, and restrict the mode to 0660. The
    /// runtime chowns the path before dropping privileges.
    pub fn bind(path: &Path, max_clients: usize, ctx: Arc<IpcContext>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to unlink {}", path.display()))
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("failed to set mode on {}", path.display()))?;

        info!(
            "IPC socket listening on {} (max {} clients)",
            path.display(),
            max_clients
        );
        Ok(Self {
            listener: Arc::new(listener),
            limiter: Arc::new(Semaphore::new(max_clients)),
            ctx,
        })
    }

    /// Bounded accept loop; each connection is one request/response.
    pub async fn run(self) -> Result<()> {
        loop {
            let permit = Arc::clone(&self.limiter)
                .acquire_owned()
                .await
                .context("IPC limiter closed")?;
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .context("IPC accept failed")?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(handle_client(stream, ctx, permit));
        }
    }
}

async fn handle_client(stream: UnixStream, ctx: Arc<IpcContext>, permit: OwnedSemaphorePermit) {
    if let Err(e) = time::timeout(CLIENT_TIMEOUT, serve_one(stream, &ctx)).await {
        debug!("IPC client timed out: {}", e);
    }
    drop(permit);
}

async fn serve_one(mut stream: UnixStream, ctx: &IpcContext) {
    let (reader, mut writer) = stream.split();
    let mut line = String::new();
    // One byte past the limit detects oversized requests without reading
    // an unbounded line into memory.
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_LEN + 1));

    let response = match reader.read_line(&mut line).await {
        Ok(_) if line.len() as u64 > MAX_REQUEST_LEN => "ERR request too long".to_string(),
        Ok(0) => "ERR empty request".to_string(),
        Ok(_) => handle_request(ctx, line.trim_end_matches(['\r', '\n'])).await,
        Err(e) => {
            debug!("IPC read failed: {}", e);
            return;
        }
    };

    if let Err(e) = writer.write_all(response.as_bytes()).await {
        debug!("IPC write failed: {}", e);
        return;
    }
    let _ = writer.write_all(b"\n").await;
    let _ = writer.flush().await;
}

/// Dispatch one request line to its handler.
async fn handle_request(ctx: &IpcContext, line: &str) -> String {
    debug!("IPC request: {:?}", line);
    let line = line.trim();

    if line.is_empty() {
        return "ERR empty request".to_string();
    }

    if let Some(rest) = line.strip_prefix("lcd set ") {
        return lcd_set(ctx, rest).await;
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["version"] => version(ctx).await,
        ["temperature"] => temperature(ctx).await,
        ["fan"] => fan(ctx).await,
        ["drives"] => drives(ctx).await,
        ["power"] => power(ctx).await,
        ["shutdown"] => shutdown(ctx).await,
        ["led", mask] => led(ctx, mask).await,
        ["lcd", "backlight", pct] => lcd_backlight(ctx, pct).await,
        _ => "ERR unrecognized request".to_string(),
    }
}

async fn version(ctx: &IpcContext) -> String {
    if let Some(version) = &ctx.version {
        return version.clone();
    }
    // Version was unreadable at boot; try the firmware again.
    match ctx.client.get_text(&registers::VER).await {
        Ok(version) => version,
        Err(e) => format!("ERR {}", e),
    }
}

async fn temperature(ctx: &IpcContext) -> String {
    let status = ctx.thermal.read().await.clone();
    let mut out = match status.board_temp_c {
        Some(t) => format!("board={:.0}", t),
        None => "board=stale".to_string(),
    };
    for disk in &status.disks {
        match disk.temp_c {
            Some(t) => out.push_str(&format!(" disk:{}={:.0}", disk.device, t)),
            None => out.push_str(&format!(" disk:{}=stale", disk.device)),
        }
    }
    out
}

async fn fan(ctx: &IpcContext) -> String {
    let (duty, target) = {
        let status = ctx.thermal.read().await;
        (status.fan_duty, status.fan_target)
    };
    let rpm = match ctx.client.get_u16(&registers::RPM).await {
        Ok(rpm) => rpm.to_string(),
        Err(e) => {
            warn!("RPM read failed: {}", e);
            "unknown".to_string()
        }
    };
    format!("duty={} target={} rpm={}", duty, target, rpm)
}

async fn drives(ctx: &IpcContext) -> String {
    let bays = ctx.bays.read().await.clone();
    bays.bays
        .iter()
        .enumerate()
        .map(|(idx, bay)| {
            format!(
                "bay{}={},{},{}",
                idx,
                if bay.present { "present" } else { "absent" },
                if bay.powered { "powered" } else { "off" },
                bay.alert.name()
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}

async fn power(ctx: &IpcContext) -> String {
    let sockets = ctx.bays.read().await.sockets;
    format!(
        "socket1={} socket2={}",
        if sockets[0] { "on" } else { "off" },
        if sockets[1] { "on" } else { "off" }
    )
}

async fn shutdown(ctx: &IpcContext) -> String {
    info!("shutdown requested over IPC");
    let request = ShutdownRequest::Deferred {
        grace: ctx.shutdown_grace,
    };
    match ctx.shutdown_tx.send(request).await {
        Ok(()) => "ACK".to_string(),
        Err(_) => "ERR shutdown unavailable".to_string(),
    }
}

async fn led(ctx: &IpcContext, mask: &str) -> String {
    let mask = match u8::from_str_radix(mask, 16) {
        Ok(mask) => mask,
        Err(_) => return "ERR led mask must be hex".to_string(),
    };
    match ctx.client.set_reg(&registers::LED, Value::Byte(mask)).await {
        Ok(()) => "ACK".to_string(),
        Err(e) => format!("ERR {}", e),
    }
}

async fn lcd_set(ctx: &IpcContext, rest: &str) -> String {
    let (line1, line2) = match rest.split_once('\t') {
        Some((l1, l2)) => (l1, l2),
        None => (rest, ""),
    };
    if let Err(e) = ctx.client.set_text(&registers::LN1, line1).await {
        return format!("ERR {}", e);
    }
    if let Err(e) = ctx.client.set_text(&registers::LN2, line2).await {
        return format!("ERR {}", e);
    }
    "ACK".to_string()
}

async fn lcd_backlight(ctx: &IpcContext, pct: &str) -> String {
    let pct: u8 = match pct.parse() {
        Ok(pct) if pct <= 100 => pct,
        _ => return "ERR backlight must be 0-100".to_string(),
    };
    match ctx.client.set_u8(&registers::BKL, pct).await {
        Ok(()) => "ACK".to_string(),
        Err(e) => format!("ERR {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{FrameReader, FrameWriter};
    use crate::thermal::{DiskTemp, ThermalLevel};
    
    use tokio::io::{duplex, split};
    use tokio::sync::Mutex;

    /// Mock PMC: acks setters, answers RPM, and records frames.
    fn mock_client() -> (PmcClient, Arc<Mutex<Vec<String>>>) {
        let (host, pmc) = duplex(1024);
        let (hr, hw) = split(host);
        let client = PmcClient::spawn(hr, hw);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&frames);
        tokio::spawn(async move {
            let (pr, pw) = split(pmc);
            let mut reader = FrameReader::new(pr);
            let mut writer = FrameWriter::new(pw);
            while let Ok(Some(frame)) = reader.read_frame().await {
                log.lock().await.push(frame.clone());
                if frame == "RPM" {
                    writer.write_frame("RPM=04b0").await.unwrap();
                } else {
                    writer.write_frame("ACK").await.unwrap();
                }
            }
        });
        (client, frames)
    }

    fn context() -> (Arc<IpcContext>, Arc<Mutex<Vec<String>>>, mpsc::Receiver<ShutdownRequest>) {
        let (client, frames) = mock_client();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let mut thermal = ThermalStatus::default();
        thermal.board_temp_c = Some(44.0);
        thermal.hottest_c = Some(51.0);
        thermal.level = ThermalLevel::Warm;
        thermal.fan_duty = 40;
        thermal.fan_target = 50;
        thermal.disks = vec![
            DiskTemp {
                device: "/dev/sda".to_string(),
                temp_c: Some(51.0),
                stale_count: 0,
            },
            DiskTemp {
                device: "/dev/sdb".to_string(),
                temp_c: None,
                stale_count: 3,
            },
        ];
        let ctx = Arc::new(IpcContext {
            client,
            thermal: Arc::new(RwLock::new(thermal)),
            bays: Arc::new(RwLock::new(BayState::from_registers(0x02, 0x01, 0x00, 0x06))),
            shutdown_tx,
            shutdown_grace: Duration::from_secs(60),
            version: Some("WD PMC v17".to_string()),
        });
        (ctx, frames, shutdown_rx)
    }

    #[tokio::test]
    async fn test_version_request() {
        let (ctx, _frames, _rx) = context();
        assert_eq!(handle_request(&ctx, "version").await, "WD PMC v17");
    }

    #[tokio::test]
    async fn test_temperature_reports_all_sources() {
        let (ctx, _frames, _rx) = context();
        assert_eq!(
            handle_request(&ctx, "temperature").await,
            "board=44 disk:/dev/sda=51 disk:/dev/sdb=stale"
        );
    }

    #[tokio::test]
    async fn test_fan_reads_live_rpm() {
        let (ctx, _frames, _rx) = context();
        assert_eq!(
            handle_request(&ctx, "fan").await,
            "duty=40 target=50 rpm=1200"
        );
    }

    #[tokio::test]
    async fn test_drives_snapshot() {
        let (ctx, _frames, _rx) = context();
        // DP0=0x02: bay 0 present, bay 1 absent; DE0=0x01: bay 0 powered.
        assert_eq!(
            handle_request(&ctx, "drives").await,
            "bay0=present,powered,off bay1=absent,off,off"
        );
    }

    #[tokio::test]
    async fn test_power_snapshot() {
        let (ctx, _frames, _rx) = context();
        assert_eq!(handle_request(&ctx, "power").await, "socket1=on socket2=on");
    }

    #[tokio::test]
    async fn test_lcd_set_writes_both_lines_truncated() {
        let (ctx, frames, _rx) = context();
        let response = handle_request(&ctx, "lcd set IP:\taddr 10.0.0.1").await;
        assert_eq!(response, "ACK");
        assert_eq!(
            *frames.lock().await,
            vec!["LN1=IP:".to_string(), "LN2=addr 10.0.0.1".to_string()]
        );

        // Overlong lines are cut to the LCD width.
        handle_request(&ctx, "lcd set 123456789012345678\tx").await;
        assert_eq!(frames.lock().await[2], "LN1=1234567890123456");
    }

    #[tokio::test]
    async fn test_lcd_backlight() {
        let (ctx, frames, _rx) = context();
        assert_eq!(handle_request(&ctx, "lcd backlight 75").await, "ACK");
        assert_eq!(frames.lock().await.last().unwrap(), "BKL=4B");
        assert!(handle_request(&ctx, "lcd backlight 101")
            .await
            .starts_with("ERR"));
    }

    #[tokio::test]
    async fn test_led_bitmask() {
        let (ctx, frames, _rx) = context();
        assert_eq!(handle_request(&ctx, "led 3f").await, "ACK");
        assert_eq!(frames.lock().await.last().unwrap(), "LED=3F");
        assert!(handle_request(&ctx, "led zz").await.starts_with("ERR"));
    }

    #[tokio::test]
    async fn test_shutdown_schedules() {
        let (ctx, _frames, mut rx) = context();
        assert_eq!(handle_request(&ctx, "shutdown").await, "ACK");
        // A controlled shutdown is scheduled with the configured grace, not
        // forced immediately.
        assert_eq!(
            rx.recv().await.unwrap(),
            ShutdownRequest::Deferred {
                grace: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (ctx, _frames, _rx) = context();
        assert!(handle_request(&ctx, "").await.starts_with("ERR"));
        assert!(handle_request(&ctx, "reboot").await.starts_with("ERR"));
        assert!(handle_request(&ctx, "version now").await.starts_with("ERR"));
        assert!(handle_request(&ctx, "led").await.starts_with("ERR"));
    }

    #[tokio::test]
    async fn test_server_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hws.sock");
        let (ctx, _frames, _rx) = context();
        let server = IpcServer::bind(&path, 4, ctx).unwrap();
        tokio::spawn(server.run());

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"power\n").await.unwrap();
        let mut response = String::new();
        BufReader::new(&mut stream)
            .read_line(&mut response)
            .await
            .unwrap();
        assert_eq!(response.trim(), "socket1=on socket2=on");

        // Socket mode is 0660.
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }
}
