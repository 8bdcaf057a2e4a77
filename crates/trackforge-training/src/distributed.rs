//! Per-process distributed setup.
//!
//! Every rank calls [`DistributedRuntime::init`] once before touching
//! partitioned data. Rank 0 hosts a TCP rendezvous at `master_addr`; the
//! other ranks join it and all of them agree on world size and sampling
//! seed before training starts. A failed rendezvous is fatal.

use crate::config::DdpConfig;
use crate::device::{Device, DeviceList};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Line-delimited JSON over TCP.
    Tcp,
    /// Recognized so configs written for GPU clusters parse, but not linked in.
    Nccl,
}

impl Backend {
    pub fn parse(name: &str) -> TrainingResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tcp" | "gloo" => Ok(Self::Tcp),
            "nccl" => Ok(Self::Nccl),
            other => Err(TrainingError::InvalidConfig(format!("unknown distributed backend: {other}"))),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Nccl => "nccl",
        }
    }
}

/// Rank and world size of this process. `backend` is `None` outside distributed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedContext {
    pub rank: u32,
    pub world_size: u32,
    pub backend: Option<Backend>,
}

impl DistributedContext {
    #[must_use]
    pub fn local() -> Self {
        Self { rank: 0, world_size: 1, backend: None }
    }

    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.backend.is_some()
    }

    /// Rank responsible for shared side effects such as checkpoint writes.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Hello { rank: u32, world_size: u32, seed: u64 },
    Welcome { world_size: u32, seed: u64 },
    Reject { reason: String },
}

#[derive(Debug)]
pub struct DistributedRuntime {
    ddp: DdpConfig,
    seed: u64,
    devices: DeviceList,
    context: OnceCell<DistributedContext>,
}

impl DistributedRuntime {
    #[must_use]
    pub fn new(ddp: DdpConfig, seed: u64, devices: DeviceList) -> Self {
        Self { ddp, seed, devices, context: OnceCell::new() }
    }

    #[must_use]
    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    /// Context established by a previous successful [`init`](Self::init).
    #[must_use]
    pub fn context(&self) -> Option<DistributedContext> {
        self.context.get().copied()
    }

    /// Device driving this process once the context is known.
    #[must_use]
    pub fn primary_device(&self, ctx: &DistributedContext) -> Device {
        self.devices.primary_for(ctx)
    }

    /// Establish the process context. Later calls return the first result.
    pub async fn init(&self) -> TrainingResult<DistributedContext> {
        self.context.get_or_try_init(|| self.establish()).await.copied()
    }

    async fn establish(&self) -> TrainingResult<DistributedContext> {
        if !self.ddp.enabled {
            debug!("distributed mode disabled; running as a single process");
            return Ok(DistributedContext::local());
        }

        let backend = Backend::parse(&self.ddp.backend)?;
        if backend == Backend::Nccl {
            return Err(TrainingError::BackendUnavailable(
                "nccl is not available in this build; use backend = \"tcp\"".to_string(),
            ));
        }

        let ctx = DistributedContext { rank: self.ddp.rank, world_size: self.ddp.world_size, backend: Some(backend) };
        if ctx.rank >= ctx.world_size {
            return Err(TrainingError::InvalidConfig(format!(
                "rank {} is outside world of size {}",
                ctx.rank, ctx.world_size
            )));
        }

        let timeout = Duration::from_secs(self.ddp.timeout_secs);
        if ctx.is_primary() {
            self.host(timeout).await?;
        } else {
            self.join(timeout).await?;
        }

        info!(
            rank = ctx.rank,
            world_size = ctx.world_size,
            backend = backend.name(),
            "distributed rendezvous complete"
        );
        Ok(ctx)
    }

    async fn host(&self, timeout: Duration) -> TrainingResult<()> {
        let addr = self.ddp.master_addr.as_str();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TrainingError::BackendUnavailable(format!("cannot listen on {addr}: {e}")))?;
        let expected = self.ddp.world_size.saturating_sub(1) as usize;
        debug!(addr, expected, "waiting for peers");

        let gather = async {
            let mut peers: Vec<(u32, BufReader<TcpStream>)> = Vec::with_capacity(expected);
            while peers.len() < expected {
                let (stream, remote) = listener.accept().await?;
                let mut reader = BufReader::new(stream);
                let hello = read_message(&mut reader).await?;
                match self.check_hello(&hello, &peers) {
                    Ok(rank) => {
                        debug!(rank, %remote, "peer joined");
                        peers.push((rank, reader));
                    }
                    Err(reason) => {
                        let reject = Handshake::Reject { reason: reason.clone() };
                        write_message(reader.get_mut(), &reject).await?;
                        return Err(TrainingError::Rendezvous(reason));
                    }
                }
            }
            Ok::<_, TrainingError>(peers)
        };

        let mut peers = tokio::time::timeout(timeout, gather).await.map_err(|_| {
            TrainingError::Rendezvous(format!("timed out after {timeout:?} waiting for {expected} peers on {addr}"))
        })??;

        let welcome = Handshake::Welcome { world_size: self.ddp.world_size, seed: self.seed };
        for (_, reader) in &mut peers {
            write_message(reader.get_mut(), &welcome).await?;
        }
        Ok(())
    }

    fn check_hello(&self, hello: &Handshake, peers: &[(u32, BufReader<TcpStream>)]) -> Result<u32, String> {
        let Handshake::Hello { rank, world_size, seed } = hello else {
            return Err(format!("expected hello, got {hello:?}"));
        };
        if *world_size != self.ddp.world_size {
            return Err(format!("rank {rank} reports world size {world_size}, expected {}", self.ddp.world_size));
        }
        if *seed != self.seed {
            return Err(format!("rank {rank} uses sampling seed {seed}, expected {}", self.seed));
        }
        if *rank == 0 || *rank >= self.ddp.world_size {
            return Err(format!("invalid peer rank {rank}"));
        }
        if peers.iter().any(|(r, _)| r == rank) {
            return Err(format!("rank {rank} joined twice"));
        }
        Ok(*rank)
    }

    async fn join(&self, timeout: Duration) -> TrainingResult<()> {
        let addr = self.ddp.master_addr.as_str();
        let handshake = async {
            let stream = connect_when_ready(addr).await;
            let mut reader = BufReader::new(stream);
            let hello = Handshake::Hello { rank: self.ddp.rank, world_size: self.ddp.world_size, seed: self.seed };
            write_message(reader.get_mut(), &hello).await?;
            read_message(&mut reader).await
        };

        let reply = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TrainingError::Rendezvous(format!("no master answered at {addr} within {timeout:?}")))??;

        match reply {
            Handshake::Welcome { world_size, seed } if world_size == self.ddp.world_size && seed == self.seed => Ok(()),
            Handshake::Welcome { world_size, seed } => Err(TrainingError::Rendezvous(format!(
                "master announced world size {world_size} and seed {seed}, expected {} and {}",
                self.ddp.world_size, self.seed
            ))),
            Handshake::Reject { reason } => Err(TrainingError::Rendezvous(reason)),
            Handshake::Hello { .. } => Err(TrainingError::Rendezvous("unexpected hello from master".to_string())),
        }
    }
}

/// Poll until the master listener exists. Bounded by the caller's rendezvous timeout.
async fn connect_when_ready(addr: &str) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(e) => {
                debug!(addr, error = %e, "master not reachable yet");
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        }
    }
}

async fn read_message(reader: &mut BufReader<TcpStream>) -> TrainingResult<Handshake> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        warn!("rendezvous peer closed the connection");
        return Err(TrainingError::Rendezvous("connection closed during handshake".to_string()));
    }
    serde_json::from_str(line.trim_end())
        .map_err(|e| TrainingError::Rendezvous(format!("malformed handshake message: {e}")))
}

async fn write_message(stream: &mut TcpStream, message: &Handshake) -> TrainingResult<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    fn ddp(rank: u32, world_size: u32, addr: &str) -> DdpConfig {
        DdpConfig {
            enabled: true,
            rank,
            world_size,
            backend: "tcp".to_string(),
            master_addr: addr.to_string(),
            timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn test_disabled_runtime_is_local_and_idempotent() {
        let runtime = DistributedRuntime::new(DdpConfig::default(), 42, DeviceList::cpu_only());
        assert!(runtime.context().is_none());
        let first = runtime.init().await.unwrap();
        let second = runtime.init().await.unwrap();
        assert_eq!(first, DistributedContext::local());
        assert_eq!(first, second);
        assert!(!first.is_distributed());
        assert_eq!(runtime.context(), Some(first));
    }

    #[tokio::test]
    async fn test_nccl_is_reported_unavailable() {
        let mut config = ddp(0, 2, "127.0.0.1:1");
        config.backend = "nccl".to_string();
        let runtime = DistributedRuntime::new(config, 42, DeviceList::cpu_only());
        let err = runtime.init().await.unwrap_err();
        assert!(matches!(err, TrainingError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_two_ranks_rendezvous() {
        let addr = free_addr();
        let master = DistributedRuntime::new(ddp(0, 2, &addr), 42, DeviceList::cpu_only());
        let worker = DistributedRuntime::new(ddp(1, 2, &addr), 42, DeviceList::cpu_only());

        let (a, b) = tokio::join!(master.init(), worker.init());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.rank, 0);
        assert_eq!(b.rank, 1);
        assert_eq!(a.world_size, 2);
        assert_eq!(b.backend, Some(Backend::Tcp));
        assert!(a.is_primary() && !b.is_primary());
    }

    #[tokio::test]
    async fn test_seed_mismatch_fails_both_ranks() {
        let addr = free_addr();
        let master = DistributedRuntime::new(ddp(0, 2, &addr), 42, DeviceList::cpu_only());
        let worker = DistributedRuntime::new(ddp(1, 2, &addr), 7, DeviceList::cpu_only());

        let (a, b) = tokio::join!(master.init(), worker.init());
        assert!(matches!(a, Err(TrainingError::Rendezvous(_))));
        assert!(matches!(b, Err(TrainingError::Rendezvous(_))));
    }

    #[tokio::test]
    async fn test_missing_master_times_out() {
        let addr = free_addr();
        let mut config = ddp(1, 2, &addr);
        config.timeout_secs = 1;
        let worker = DistributedRuntime::new(config, 42, DeviceList::cpu_only());
        let err = worker.init().await.unwrap_err();
        assert!(matches!(err, TrainingError::Rendezvous(_)));
    }
}
