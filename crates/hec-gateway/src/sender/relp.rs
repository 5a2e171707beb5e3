// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RELP client over TCP.
//!
//! Frames are `TXNR SP COMMAND SP DATALEN [SP DATA] LF`. A session starts with an `open` offer
//! that the collector must answer with `200`, carries one `syslog` command per message, and ends
//! with `close`. Every command is answered by a `rsp` frame echoing its transaction number.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::sender::{Batch, Connection};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_TXNR: u32 = 999_999_999;
const MAX_HEADER_FIELD: usize = 32;
/// Largest DATALEN accepted from a collector.
pub const MAX_DATA_LEN: usize = 128 * 1024 * 1024;
const OFFERS: &str = concat!(
    "relp_version=0\nrelp_software=hec-gateway,",
    env!("CARGO_PKG_VERSION"),
    "\ncommands=syslog"
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelpFrame {
    pub txnr: u32,
    pub command: String,
    pub data: Bytes,
}

impl RelpFrame {
    pub fn new(txnr: u32, command: &str, data: impl Into<Bytes>) -> Self {
        Self {
            txnr,
            command: command.to_string(),
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let header = format!("{} {} {}", self.txnr, self.command, self.data.len());
        let mut buf = BytesMut::with_capacity(header.len() + self.data.len() + 2);
        buf.put_slice(header.as_bytes());
        if !self.data.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(&self.data);
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }

    /// Status code of a `rsp` frame, the leading three digits of its data.
    pub fn response_code(&self) -> Option<u16> {
        self.data
            .get(..3)
            .and_then(|code| std::str::from_utf8(code).ok())
            .and_then(|code| code.parse().ok())
    }

    /// Reads one frame. A clean end of stream before the first byte is reported as
    /// [`TransportError::ServerClose`].
    pub async fn read<R>(reader: &mut R) -> Result<Self, TransportError>
    where
        R: AsyncBufRead + Unpin,
    {
        let (txnr, _) = read_field(reader, true).await?;
        let txnr = parse_number::<u32>(&txnr, "transaction number")?;
        let (command, _) = read_field(reader, false).await?;
        let command = String::from_utf8(command)
            .map_err(|_| TransportError::Protocol("command is not UTF-8".to_string()))?;
        let (length, terminator) = read_field(reader, false).await?;
        let length = parse_number::<usize>(&length, "data length")?;
        if length > MAX_DATA_LEN {
            return Err(TransportError::Protocol(format!(
                "data length {length} exceeds {MAX_DATA_LEN} bytes"
            )));
        }

        let mut data = vec![0; length];
        if terminator == b' ' {
            reader.read_exact(&mut data).await?;
            let mut trailer = [0u8; 1];
            reader.read_exact(&mut trailer).await?;
            if trailer[0] != b'\n' {
                return Err(TransportError::Protocol("missing frame trailer".to_string()));
            }
        } else if length > 0 {
            return Err(TransportError::Protocol(format!(
                "frame ended before {length} bytes of data"
            )));
        }

        Ok(Self {
            txnr,
            command,
            data: Bytes::from(data),
        })
    }
}

/// Reads up to the next space or newline, returning the field and its terminator.
async fn read_field<R>(reader: &mut R, first: bool) -> Result<(Vec<u8>, u8), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let read = reader.read(&mut byte).await?;
        if read == 0 {
            return Err(if first && field.is_empty() {
                TransportError::ServerClose
            } else {
                TransportError::Protocol("stream ended inside a frame header".to_string())
            });
        }
        match byte[0] {
            b' ' | b'\n' if !field.is_empty() => return Ok((field, byte[0])),
            // Tolerate newlines left between frames.
            b'\n' if first => continue,
            b' ' | b'\n' => {
                return Err(TransportError::Protocol("empty frame header field".to_string()))
            }
            other => {
                if field.len() >= MAX_HEADER_FIELD {
                    return Err(TransportError::Protocol("frame header too long".to_string()));
                }
                field.push(other);
            }
        }
    }
}

fn parse_number<T: std::str::FromStr>(field: &[u8], what: &str) -> Result<T, TransportError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("invalid {what}")))
}

async fn bounded<T, F>(
    limit: Duration,
    what: &'static str,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    timeout(limit, future)
        .await
        .map_err(|_| TransportError::Timeout(what))?
}

pub struct RelpConnection {
    host: String,
    port: u16,
    stream: Option<BufReader<TcpStream>>,
    next_txnr: u32,
}

impl RelpConnection {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
            next_txnr: 1,
        }
    }

    fn take_txnr(&mut self) -> u32 {
        let txnr = self.next_txnr;
        self.next_txnr = if txnr >= MAX_TXNR { 1 } else { txnr + 1 };
        txnr
    }

    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    async fn write_frames(&mut self, frames: &[RelpFrame]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        bounded(WRITE_TIMEOUT, "write", async {
            for frame in frames {
                stream.get_mut().write_all(&frame.encode()).await?;
            }
            stream.get_mut().flush().await?;
            Ok(())
        })
        .await
    }

    async fn read_frame(&mut self) -> Result<RelpFrame, TransportError> {
        let stream = self.stream()?;
        bounded(READ_TIMEOUT, "read", RelpFrame::read(stream)).await
    }

    /// Sends one command and waits for its `rsp`, requiring a `200` status.
    async fn exchange(&mut self, command: &str, data: Bytes) -> Result<RelpFrame, TransportError> {
        let txnr = self.take_txnr();
        self.write_frames(&[RelpFrame::new(txnr, command, data)])
            .await?;
        loop {
            let frame = self.read_frame().await?;
            match frame.command.as_str() {
                "serverclose" => return Err(TransportError::ServerClose),
                "rsp" if frame.txnr == txnr => {
                    return match frame.response_code() {
                        Some(200) => Ok(frame),
                        _ => Err(TransportError::Protocol(format!(
                            "{command} rejected: {}",
                            String::from_utf8_lossy(&frame.data)
                        ))),
                    }
                }
                _ => debug!(
                    "Ignoring unexpected {} frame {} while waiting for {txnr}",
                    frame.command, frame.txnr
                ),
            }
        }
    }
}

#[async_trait]
impl Connection for RelpConnection {
    fn target(&self) -> String {
        format!("relp://{}:{}", self.host, self.port)
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.tear_down();
        let address = format!("{}:{}", self.host, self.port);
        let stream = bounded(CONNECT_TIMEOUT, "connect", async {
            Ok(TcpStream::connect(&address).await?)
        })
        .await?;
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));
        self.next_txnr = 1;

        if let Err(e) = self.exchange("open", Bytes::from_static(OFFERS.as_bytes())).await {
            self.tear_down();
            return Err(e);
        }
        Ok(())
    }

    async fn commit(&mut self, batch: &mut Batch) -> Result<(), TransportError> {
        let mut in_flight: HashMap<u32, usize> = HashMap::new();
        let mut frames = Vec::with_capacity(batch.pending_count());
        let pending: Vec<(usize, Bytes)> = batch
            .pending()
            .map(|(index, payload)| (index, payload.clone()))
            .collect();
        for (index, payload) in pending {
            let txnr = self.take_txnr();
            in_flight.insert(txnr, index);
            frames.push(RelpFrame::new(txnr, "syslog", payload));
        }
        self.write_frames(&frames).await?;

        while !in_flight.is_empty() {
            let frame = self.read_frame().await?;
            match frame.command.as_str() {
                "serverclose" => return Err(TransportError::ServerClose),
                "rsp" => match in_flight.remove(&frame.txnr) {
                    Some(index) if frame.response_code() == Some(200) => {
                        batch.mark_committed(index);
                    }
                    Some(_) => warn!(
                        "Collector rejected transaction {}: {}",
                        frame.txnr,
                        String::from_utf8_lossy(&frame.data)
                    ),
                    None => debug!("Ignoring response to unknown transaction {}", frame.txnr),
                },
                other => debug!("Ignoring unexpected {other} frame"),
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let result = match self.exchange("close", Bytes::new()).await {
            // The collector may hang up as soon as it has answered.
            Ok(_) | Err(TransportError::ServerClose) => Ok(()),
            Err(e) => Err(e),
        };
        self.tear_down();
        result
    }

    fn tear_down(&mut self) {
        self.stream = None;
    }
}
