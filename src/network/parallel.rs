//! Parallel SFTP sends
//!
//! Several SFTP sessions to the same base, each wrapped in its own
//! [`SftpTransport`], fed from a rayon pool. Items are assigned to sessions
//! round-robin; the sessions share one ledger lock so their remote ledger
//! updates never overwrite each other.

use crate::config::defaults::MAX_PARALLEL_SESSIONS;
use crate::error::{IoResultExt, Result, TransportError};
use crate::fs::{ProgressFn, TransferContext};
use crate::sync::TransferMetadata;
use crate::transport::{SftpTransport, Transport};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Uploads a batch of local files over several SFTP sessions
pub struct ParallelSftpSender {
    transports: Vec<SftpTransport>,
    pool: rayon::ThreadPool,
}

/// Session count for a requested value; zero means one per CPU
pub fn effective_sessions(requested: usize) -> usize {
    let wanted = if requested == 0 { num_cpus::get() } else { requested };
    wanted.clamp(1, MAX_PARALLEL_SESSIONS)
}

impl ParallelSftpSender {
    /// Build `sessions` transports with `factory(index)`
    pub fn new<F>(sessions: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<SftpTransport>,
    {
        let sessions = effective_sessions(sessions);
        let ledger_lock = Arc::new(Mutex::new(()));
        let transports = (0..sessions)
            .map(|i| factory(i).map(|t| t.with_ledger_lock(Arc::clone(&ledger_lock))))
            .collect::<Result<Vec<_>>>()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(sessions)
            .thread_name(|i| format!("zim-sftp-{}", i))
            .build()
            .map_err(|e| TransportError::config(format!("failed to build SFTP worker pool: {}", e)))?;

        info!("Parallel SFTP sender with {} session(s)", sessions);
        Ok(Self { transports, pool })
    }

    /// Sessions over libssh2 from runtime configuration
    #[cfg(feature = "ssh")]
    pub fn from_config(config: &crate::config::TransportConfig) -> Result<Self> {
        use crate::network::Ssh2SftpClient;
        use crate::transport::PipelinePolicy;

        let remote = config
            .remote
            .clone()
            .ok_or_else(|| TransportError::config("SFTP needs a remote user@host"))?;
        let base = config.root.to_string_lossy().replace('\\', "/");
        let policy = PipelinePolicy::new(config.compress, config.passphrase.clone());

        Self::new(remote.sessions, |_| {
            let client = Ssh2SftpClient::new(remote.clone(), config.connect_timeout());
            Ok(SftpTransport::new(Box::new(client), base.clone(), policy.clone(), config.chunk_size))
        })
    }

    pub fn sessions(&self) -> usize {
        self.transports.len()
    }

    /// First session, for manifest and ledger calls
    pub fn primary(&self) -> &SftpTransport {
        &self.transports[0]
    }

    /// Send every `(local path, metadata)` pair.
    ///
    /// Results come back in input order. `progress` receives cumulative
    /// plaintext bytes across the whole batch.
    pub fn send_batch(
        &self,
        ctx: &TransferContext,
        items: &[(PathBuf, TransferMetadata)],
        progress: Option<ProgressFn<'_>>,
    ) -> Vec<Result<TransferMetadata>> {
        let total = AtomicU64::new(0);
        let sessions = self.transports.len();

        self.pool.install(|| {
            items
                .par_iter()
                .enumerate()
                .map(|(i, (path, meta))| -> Result<TransferMetadata> {
                    ctx.check()?;
                    let transport = &self.transports[i % sessions];

                    let mut meta = meta.clone();
                    let mut source = BufReader::new(File::open(path).with_path(path)?);

                    let last = AtomicU64::new(0);
                    let report = |n: u64| {
                        let delta = n.saturating_sub(last.swap(n, Ordering::Relaxed));
                        let sum = total.fetch_add(delta, Ordering::Relaxed) + delta;
                        if let Some(progress) = progress {
                            progress(sum);
                        }
                    };

                    transport
                        .send(ctx, &mut source, &mut meta, Some(&report))
                        .map_err(|e| {
                            warn!("'{}' failed on session {}: {}", meta.relative_path, i % sessions, e);
                            e
                        })?;
                    Ok(meta)
                })
                .collect()
        })
    }

    /// Close every session
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        for transport in &self.transports {
            if let Err(e) = transport.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
