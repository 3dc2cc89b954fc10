use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::types::Job;

/// How long a single reservation waits for a job.
pub const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_TUBE: &str = "default";

/// Reserve/delete access to a work queue of text job bodies.
#[async_trait]
pub trait JobQueue: Send {
    /// Wait up to `timeout` for a job. A timeout is `Ok(None)`.
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>>;

    /// Remove a reserved job permanently.
    async fn delete(&mut self, id: u64) -> Result<()>;
}

/// Minimal beanstalkd client speaking the text protocol over TCP.
#[derive(Debug)]
pub struct BeanstalkQueue {
    stream: BufReader<TcpStream>,
    addr: String,
}

impl BeanstalkQueue {
    pub async fn connect(addr: &str) -> Result<Self> {
        log::debug!("[queue] connect: addr={}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .wrap_err_with(|| format!("Failed to connect to beanstalkd at {}", addr))?;
        log::info!("[queue] connected: addr={}", addr);
        Ok(Self {
            stream: BufReader::new(stream),
            addr: addr.to_string(),
        })
    }

    /// Watch `tube` and stop watching the default tube if it differs.
    pub async fn watch(&mut self, tube: &str) -> Result<()> {
        if tube == DEFAULT_TUBE {
            return Ok(());
        }

        let reply = self.command(&format!("watch {}", tube)).await?;
        if !reply.starts_with("WATCHING") {
            eyre::bail!("Unexpected reply to watch {}: {}", tube, reply);
        }
        let reply = self.command(&format!("ignore {}", DEFAULT_TUBE)).await?;
        if !reply.starts_with("WATCHING") {
            eyre::bail!("Unexpected reply to ignore {}: {}", DEFAULT_TUBE, reply);
        }

        log::info!("[queue] watching: addr={} tube={}", self.addr, tube);
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<String> {
        log::trace!("[queue] send: {}", line);
        self.stream
            .get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .wrap_err("Failed to write to beanstalkd")?;
        self.read_line().await
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut reply = String::new();
        let read = self
            .stream
            .read_line(&mut reply)
            .await
            .wrap_err("Failed to read from beanstalkd")?;
        if read == 0 {
            eyre::bail!("beanstalkd at {} closed the connection", self.addr);
        }
        Ok(reply.trim_end().to_string())
    }
}

#[async_trait]
impl JobQueue for BeanstalkQueue {
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>> {
        let reply = self
            .command(&format!("reserve-with-timeout {}", timeout.as_secs()))
            .await?;

        let mut parts = reply.split_whitespace();
        match parts.next() {
            Some("RESERVED") => {
                let id: u64 = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| eyre::eyre!("Malformed RESERVED reply: {}", reply))?;
                let len: usize = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| eyre::eyre!("Malformed RESERVED reply: {}", reply))?;

                // Body is followed by a trailing \r\n
                let mut body = vec![0u8; len + 2];
                self.stream
                    .read_exact(&mut body)
                    .await
                    .wrap_err("Failed to read job body")?;
                body.truncate(len);

                let body = String::from_utf8_lossy(&body).into_owned();
                log::debug!("[queue] reserved: id={} body={}", id, body);
                Ok(Some(Job { id, body }))
            }
            Some("TIMED_OUT") | Some("DEADLINE_SOON") => {
                log::trace!("[queue] reserve_empty: reply={}", reply);
                Ok(None)
            }
            _ => eyre::bail!("Unexpected reply to reserve: {}", reply),
        }
    }

    async fn delete(&mut self, id: u64) -> Result<()> {
        let reply = self.command(&format!("delete {}", id)).await?;
        match reply.as_str() {
            "DELETED" => {
                log::trace!("[queue] deleted: id={}", id);
                Ok(())
            }
            "NOT_FOUND" => {
                log::warn!("[queue] delete_not_found: id={}", id);
                Ok(())
            }
            other => eyre::bail!("Unexpected reply to delete {}: {}", id, other),
        }
    }
}

/// Reserve and delete jobs until a reservation times out.
pub async fn drain<Q: JobQueue + ?Sized>(queue: &mut Q) -> Result<usize> {
    let mut deleted = 0;
    while let Some(job) = queue.reserve(RESERVE_TIMEOUT).await? {
        queue.delete(job.id).await?;
        deleted += 1;
    }
    log::info!("[queue] drained: deleted={}", deleted);
    Ok(deleted)
}
