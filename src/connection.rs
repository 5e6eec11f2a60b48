//! Session control.
//!
//! A [`Connector`] owns the byte stream and performs one JSON round trip per
//! operation:
//! - connect and load-balancer reconnect
//! - statement open, prepare, metadata, execute and close
//! - fetch and put of binary row chunks

use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tracing::{debug, info, trace, warn};

use crate::config::ConnectConfig;
use crate::error::{DriverError, DriverResult};
use crate::protocol::*;
use crate::statement::StatementKind;
use crate::transport::{self, BoxedTransport, LibraryGuard};
use crate::types::Column;

const DEFAULT_VARCHAR_ENCODING: &str = "ascii";

/// A fetched chunk: row count, per-block sizes and the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChunk {
    pub rows: usize,
    pub block_sizes: Vec<u64>,
    pub data: Vec<u8>,
}

/// Result of the metadata round trips.
#[derive(Debug, Clone)]
pub struct StatementMetadata {
    pub kind: StatementKind,
    pub input: Vec<Column>,
    pub output: Vec<Column>,
}

// ============================================================================
// Connector
// ============================================================================

pub struct Connector {
    reader: Reader,
    writer: Writer,
    config: ConnectConfig,
    library: LibraryGuard,
    connection_id: u32,
    statement_id: Option<u32>,
    varchar_encoding: String,
    closed: bool,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connection_id", &self.connection_id)
            .field("statement_id", &self.statement_id)
            .field("closed", &self.closed)
            .finish()
    }
}

type Reader = BufReader<ReadHalf<BoxedTransport>>;
type Writer = BufWriter<WriteHalf<BoxedTransport>>;

fn split(stream: BoxedTransport) -> (Reader, Writer) {
    let (read_half, write_half) = tokio::io::split(stream);
    (BufReader::new(read_half), BufWriter::new(write_half))
}

impl Connector {
    /// Open the transport and log in.
    pub async fn connect(config: ConnectConfig, library: LibraryGuard) -> DriverResult<Self> {
        let stream = transport::connect(
            &library,
            &config.host,
            config.port,
            config.ssl,
            config.tls_verify,
        )
        .await?;
        let (reader, writer) = split(stream);

        let mut conn = Self {
            reader,
            writer,
            config,
            library,
            connection_id: 0,
            statement_id: None,
            varchar_encoding: DEFAULT_VARCHAR_ENCODING.to_string(),
            closed: false,
        };
        conn.login().await?;
        Ok(conn)
    }

    async fn login(&mut self) -> DriverResult<()> {
        let config = self.config.clone();
        let msg = ConnectDatabase {
            service: &config.service,
            username: &config.username,
            password: &config.password,
            database: &config.database,
        };
        let reply = self.request(&msg).await?;

        self.connection_id = reply.get("connectionId")?;
        if let Some(encoding) = reply.get_opt::<String>("varcharEncoding")? {
            self.varchar_encoding = encoding;
        }
        info!(
            connection_id = self.connection_id,
            database = %self.config.database,
            "session established"
        );
        Ok(())
    }

    /// Move the session to the instance named by a redirect.
    pub async fn reconnect(&mut self, redirect: &Redirect) -> DriverResult<()> {
        let port = redirect.port_for(self.config.ssl)?;
        info!(
            ip = %redirect.ip,
            port,
            listener_id = redirect.listener_id,
            "redirected by load balancer"
        );

        let stream = transport::connect(
            &self.library,
            &redirect.ip,
            port,
            self.config.ssl,
            self.config.tls_verify,
        )
        .await?;
        let (reader, writer) = split(stream);
        let mut old_writer = std::mem::replace(&mut self.writer, writer);
        self.reader = reader;
        // The old instance keeps nothing for this session.
        if let Err(e) = old_writer.shutdown().await {
            warn!(error = %e, "could not shut down redirected transport");
        }

        let config = self.config.clone();
        let msg = ReconnectDatabase {
            database: &config.database,
            service: &config.service,
            connection_id: self.connection_id,
            username: &config.username,
            password: &config.password,
            listener_id: redirect.listener_id,
        };
        let reply = self.request(&msg).await?;
        reply.field("databaseConnected")?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Statement round trips
    // ------------------------------------------------------------------------

    pub async fn open_statement(&mut self) -> DriverResult<u32> {
        let reply = self.request(&Command::GetStatementId).await?;
        let id = reply.get("statementId")?;
        self.statement_id = Some(id);
        Ok(id)
    }

    /// Prepare `sql`, following a single load-balancer redirect if one comes back.
    pub async fn prepare_statement(&mut self, sql: &str, chunk_size: u32) -> DriverResult<()> {
        let reply = self.request(&PrepareStatement { sql, chunk_size }).await?;

        match reply.prepared()? {
            Prepared::Done(true) => Ok(()),
            Prepared::Done(false) => Err(DriverError::protocol("statement was not prepared")),
            Prepared::Redirect(redirect) => {
                let statement_id = self
                    .statement_id
                    .ok_or_else(|| DriverError::protocol("redirect before statement was opened"))?;
                self.reconnect(&redirect).await?;

                let reply = self.request(&ReconstructStatement { statement_id }).await?;
                reply.acknowledge("statementReconstructed")
            }
        }
    }

    /// Ask for output columns, then input columns; whichever is non-empty decides the kind.
    pub async fn metadata_query(&mut self) -> DriverResult<StatementMetadata> {
        let reply = self.request(&Command::QueryTypeOut).await?;
        let output = reply.columns("queryTypeNamed", true)?;
        if !output.is_empty() {
            return Ok(StatementMetadata {
                kind: StatementKind::Select,
                input: Vec::new(),
                output,
            });
        }

        let reply = self.request(&Command::QueryTypeIn).await?;
        let input = reply.columns("queryType", false)?;
        let kind = if input.is_empty() {
            StatementKind::Direct
        } else {
            StatementKind::Insert
        };
        Ok(StatementMetadata {
            kind,
            input,
            output,
        })
    }

    pub async fn execute(&mut self) -> DriverResult<()> {
        let reply = self.request(&Command::Execute).await?;
        reply.acknowledge("executed")
    }

    /// Fetch the next chunk; `None` once the result is exhausted.
    pub async fn fetch(&mut self) -> DriverResult<Option<FetchedChunk>> {
        let reply = self.request(&Command::Fetch).await?;
        let header = match reply.chunk()? {
            Some(header) if header.payload_len() > 0 => header,
            _ => return Ok(None),
        };

        let (kind, data) = self.receive_frame().await?;
        if kind != MessageKind::Binary {
            return Err(DriverError::protocol("expected a binary chunk after fetch"));
        }
        if data.len() as u64 != header.payload_len() {
            return Err(DriverError::protocol(format!(
                "chunk of {} bytes announced, {} received",
                header.payload_len(),
                data.len()
            )));
        }
        trace!(rows = header.rows, bytes = data.len(), "fetched chunk");

        Ok(Some(FetchedChunk {
            rows: header.rows,
            block_sizes: header.block_sizes,
            data,
        }))
    }

    /// Send `rows` flattened rows.
    pub async fn put(&mut self, rows: usize, data: &[u8]) -> DriverResult<()> {
        check_payload_size(data.len())?;

        self.send_message(&Put { put: rows }).await?;
        self.send_binary(data).await?;
        let reply = self.receive_reply().await?;
        reply.acknowledge("putted")?;
        trace!(rows, bytes = data.len(), "put chunk");
        Ok(())
    }

    pub async fn close_statement(&mut self) -> DriverResult<()> {
        let reply = self.request(&Command::CloseStatement).await?;
        self.statement_id = None;
        reply.acknowledge("statementClosed")
    }

    /// Say goodbye and shut the transport down.
    pub async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.send_message(&Command::CloseConnection).await?;
        self.writer.shutdown().await?;
        info!(connection_id = self.connection_id, "session closed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn statement_id(&self) -> Option<u32> {
        self.statement_id
    }

    pub fn varchar_encoding(&self) -> &str {
        &self.varchar_encoding
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------------

    async fn request<M: FrontendMessage>(&mut self, msg: &M) -> DriverResult<Reply> {
        let started = Instant::now();
        self.send_message(msg).await?;
        let reply = self.receive_reply().await?;
        debug!(
            message = msg.name(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "round trip"
        );
        Ok(reply)
    }

    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> DriverResult<()> {
        if self.closed && msg.name() != "closeConnection" {
            return Err(DriverError::protocol("connection is closed"));
        }
        let encoded = msg.encode()?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_binary(&mut self, payload: &[u8]) -> DriverResult<()> {
        let mut header = bytes::BytesMut::with_capacity(HEADER_SIZE);
        Header::new(MessageKind::Binary, payload.len())?.encode(&mut header);
        self.writer.write_all(&header).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive_frame(&mut self) -> DriverResult<(MessageKind, Vec<u8>)> {
        let mut raw = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut raw).await?;
        let header = Header::decode(&raw)?;

        let mut payload = vec![0u8; header.payload_len()];
        self.reader.read_exact(&mut payload).await?;
        Ok((header.kind, payload))
    }

    async fn receive_reply(&mut self) -> DriverResult<Reply> {
        let (kind, payload) = self.receive_frame().await?;
        if kind != MessageKind::Json {
            return Err(DriverError::protocol("expected a JSON reply, got binary data"));
        }
        Reply::parse(&payload)
    }
}
