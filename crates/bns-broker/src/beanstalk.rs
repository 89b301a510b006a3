//! beanstalkd connection over TCP

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, instrument, trace};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::job::{Job, JobId};
use crate::protocol::{parse_reply, validate_tube_name, Command, Reply};
use crate::stats::{parse_stats, parse_tube_list, Stats};

/// Largest body accepted from the server, well above beanstalkd's default
/// `max-job-size` of 64 KiB
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A single connection to a beanstalkd server
///
/// The connection is established once and reused for every request. It is
/// not meant to be shared between tasks.
pub struct BeanstalkConnection {
    stream: BufStream<TcpStream>,
    peer: String,
}

impl BeanstalkConnection {
    /// Dial a beanstalkd server
    #[instrument(skip(addr), fields(addr = %addr))]
    pub async fn connect<A>(addr: A) -> Result<Self, BrokerError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| BrokerError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        debug!(%peer, "Connected to beanstalkd");

        Ok(Self {
            stream: BufStream::new(stream),
            peer,
        })
    }

    /// Address of the server this connection talks to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send `quit` and close the connection
    pub async fn close(mut self) -> Result<(), BrokerError> {
        debug!(peer = %self.peer, "Closing beanstalkd connection");
        self.send(&Command::Quit).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, command: &Command<'_>) -> Result<(), BrokerError> {
        self.stream.write_all(&command.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a command and read the reply status line
    async fn request(&mut self, command: &Command<'_>) -> Result<Reply, BrokerError> {
        self.send(command).await?;

        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(BrokerError::ConnectionClosed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        trace!(command = command.name(), reply = line, "beanstalkd reply");

        parse_reply(command.name(), line)
    }

    /// Read a `<bytes>` body and its trailing CRLF
    async fn read_body(&mut self, command: &'static str, bytes: usize) -> Result<Vec<u8>, BrokerError> {
        let framed = match bytes.checked_add(2) {
            Some(framed) if bytes <= MAX_BODY_BYTES => framed,
            _ => {
                return Err(BrokerError::UnexpectedResponse {
                    command,
                    line: format!("body of {bytes} bytes exceeds {MAX_BODY_BYTES}"),
                })
            }
        };
        let mut body = vec![0u8; framed];
        self.stream.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BrokerError::ConnectionClosed
            } else {
                BrokerError::Io(e)
            }
        })?;

        if !body.ends_with(b"\r\n") {
            return Err(BrokerError::UnexpectedResponse {
                command,
                line: "body not terminated by CRLF".to_string(),
            });
        }
        body.truncate(bytes);
        Ok(body)
    }

    async fn request_body(&mut self, command: &Command<'_>) -> Result<Vec<u8>, BrokerError> {
        match self.request(command).await? {
            Reply::Ok { bytes } => self.read_body(command.name(), bytes).await,
            Reply::NotFound => Err(BrokerError::NotFound {
                command: command.name(),
            }),
            other => Err(unexpected(command, other)),
        }
    }
}

fn unexpected(command: &Command<'_>, reply: Reply) -> BrokerError {
    BrokerError::UnexpectedResponse {
        command: command.name(),
        line: format!("{reply:?}"),
    }
}

#[async_trait]
impl Broker for BeanstalkConnection {
    async fn use_tube(&mut self, tube: &str) -> Result<(), BrokerError> {
        validate_tube_name(tube)?;
        let command = Command::Use(tube);
        match self.request(&command).await? {
            Reply::Using(_) => Ok(()),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn watch(&mut self, tube: &str) -> Result<u32, BrokerError> {
        validate_tube_name(tube)?;
        let command = Command::Watch(tube);
        match self.request(&command).await? {
            Reply::Watching(count) => Ok(count),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn ignore(&mut self, tube: &str) -> Result<u32, BrokerError> {
        validate_tube_name(tube)?;
        let command = Command::Ignore(tube);
        match self.request(&command).await? {
            Reply::Watching(count) => Ok(count),
            Reply::NotIgnored => Err(BrokerError::NotIgnored),
            other => Err(unexpected(&command, other)),
        }
    }

    #[instrument(skip(self, payload), fields(peer = %self.peer, bytes = payload.len()))]
    async fn put(
        &mut self,
        payload: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, BrokerError> {
        let command = Command::Put {
            priority,
            delay,
            ttr,
            body: payload,
        };
        match self.request(&command).await? {
            Reply::Inserted(id) => Ok(id),
            Reply::Buried(Some(id)) => Err(BrokerError::PutBuried(id)),
            Reply::ExpectedCrlf => Err(BrokerError::ExpectedCrlf),
            Reply::JobTooBig => Err(BrokerError::JobTooBig),
            Reply::Draining => Err(BrokerError::Draining),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn reserve(&mut self, timeout: Duration) -> Result<Job, BrokerError> {
        let command = Command::ReserveWithTimeout(timeout);
        match self.request(&command).await? {
            Reply::Reserved { id, bytes } => {
                let payload = self.read_body(command.name(), bytes).await?;
                Ok(Job { id, payload })
            }
            Reply::TimedOut => Err(BrokerError::TimedOut),
            Reply::DeadlineSoon => Err(BrokerError::DeadlineSoon),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn delete(&mut self, id: JobId) -> Result<(), BrokerError> {
        let command = Command::Delete(id);
        match self.request(&command).await? {
            Reply::Deleted => Ok(()),
            Reply::NotFound => Err(BrokerError::NotFound { command: "delete" }),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn bury(&mut self, id: JobId, priority: u32) -> Result<(), BrokerError> {
        let command = Command::Bury(id, priority);
        match self.request(&command).await? {
            Reply::Buried(None) => Ok(()),
            Reply::NotFound => Err(BrokerError::NotFound { command: "bury" }),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn release(
        &mut self,
        id: JobId,
        priority: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let command = Command::Release(id, priority, delay);
        match self.request(&command).await? {
            Reply::Released => Ok(()),
            // Released, but the server could not grow the ready queue
            Reply::Buried(None) => Ok(()),
            Reply::NotFound => Err(BrokerError::NotFound { command: "release" }),
            other => Err(unexpected(&command, other)),
        }
    }

    async fn stats_tube(&mut self, tube: &str) -> Result<Stats, BrokerError> {
        validate_tube_name(tube)?;
        let body = self.request_body(&Command::StatsTube(tube)).await?;
        parse_stats(&body)
    }

    async fn stats(&mut self) -> Result<Stats, BrokerError> {
        let body = self.request_body(&Command::Stats).await?;
        parse_stats(&body)
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>, BrokerError> {
        let body = self.request_body(&Command::ListTubes).await?;
        parse_tube_list(&body)
    }
}
