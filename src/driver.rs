//! The row-oriented driver API.
//!
//! A [`Driver`] runs one statement at a time through
//! `new_query -> execute_query -> next_row* -> finish_query`. Inserts fill one
//! of two column buffers while the other is flushed to the server by a
//! background task; selects re-hydrate fetched chunks and walk them row by row.

use std::io;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::ColumnBuffer;
use crate::config::{ConnectConfig, DriverConfig};
use crate::connection::Connector;
use crate::datetime::{Date, DateTime};
use crate::error::{DriverError, DriverResult, StateError, ValueError};
use crate::statement::{Phase, RowTracker, Statement, StatementKind};
use crate::transport;
use crate::types::{Column, ColumnRef, ColumnType, FromValue, Value};

type Session = Arc<Mutex<Connector>>;

/// A flush running on the runtime; hands its buffer back when joined.
struct PendingFlush {
    slot: usize,
    handle: JoinHandle<DriverResult<ColumnBuffer>>,
}

pub struct Driver {
    config: DriverConfig,
    session: Option<Session>,
    connection_id: u32,
    varchar_encoding: String,
    statement: Statement,
    slots: [ColumnBuffer; 2],
    current: usize,
    pending: Option<PendingFlush>,
    tracker: RowTracker,
    /// Rows held by the insert buffer, or rows in the fetched chunk
    row_count: usize,
    current_row: usize,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new(DriverConfig::default())
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("connected", &self.session.is_some())
            .field("connection_id", &self.connection_id)
            .field("statement", &self.statement)
            .field("row_count", &self.row_count)
            .field("current_row", &self.current_row)
            .finish()
    }
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            session: None,
            connection_id: 0,
            varchar_encoding: String::new(),
            statement: Statement::default(),
            slots: [ColumnBuffer::default(), ColumnBuffer::default()],
            current: 0,
            pending: None,
            tracker: RowTracker::default(),
            row_count: 0,
            current_row: 0,
        }
    }

    /// Connect with a `sqream://` URL and default tuning.
    pub async fn open(url: &str) -> DriverResult<Self> {
        let mut driver = Self::default();
        driver.connect(ConnectConfig::from_url(url)?).await?;
        Ok(driver)
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub async fn connect(&mut self, config: ConnectConfig) -> DriverResult<()> {
        if self.session.is_some() {
            self.disconnect().await?;
        }

        let connector = Connector::connect(config, transport::init()).await?;
        self.connection_id = connector.connection_id();
        self.varchar_encoding = connector.varchar_encoding().to_string();
        self.session = Some(Arc::new(Mutex::new(connector)));
        self.statement = Statement::default();
        Ok(())
    }

    /// Join any in-flight flush, close an open statement, then close the session.
    pub async fn disconnect(&mut self) -> DriverResult<()> {
        let flushed = self.join_flush().await;

        let Some(session) = self.session.take() else {
            return flushed;
        };
        let mut conn = session.lock().await;
        if self.statement.is_open() {
            if let Err(e) = conn.close_statement().await {
                warn!(error = %e, "could not close statement on disconnect");
            }
            self.statement.advance(Phase::all());
        }
        conn.close().await?;
        flushed
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Text encoding the server announced for fixed-width text.
    pub fn varchar_encoding(&self) -> &str {
        &self.varchar_encoding
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn session(&self) -> Result<Session, StateError> {
        self.session.clone().ok_or(StateError::NotConnected)
    }

    // ========================================================================
    // Statement lifecycle
    // ========================================================================

    /// Open a server statement and prepare `sql`.
    pub async fn new_query(&mut self, sql: &str) -> DriverResult<()> {
        let session = self.session()?;
        self.reset_statement(&session).await;

        let mut conn = session.lock().await;
        let id = conn.open_statement().await?;
        self.statement = Statement::new(id);
        conn.prepare_statement(sql, self.config.chunk_size).await?;
        self.statement.advance(Phase::PREPARED);
        debug!(statement_id = id, sql, "statement prepared");
        Ok(())
    }

    /// Leftovers of an earlier statement are discarded before a new one opens.
    async fn reset_statement(&mut self, session: &Session) {
        if let Err(e) = self.join_flush().await {
            warn!(error = %e, "discarding failed flush of previous statement");
        }
        if self.statement.is_open() {
            if let Err(e) = session.lock().await.close_statement().await {
                warn!(error = %e, "could not close previous statement");
            }
        }
        self.statement = Statement::default();
        self.slots = [ColumnBuffer::default(), ColumnBuffer::default()];
        self.current = 0;
        self.tracker = RowTracker::default();
        self.row_count = 0;
        self.current_row = 0;
    }

    /// Execute the prepared statement and learn its columns.
    pub async fn execute_query(&mut self) -> DriverResult<()> {
        self.statement.require("execute_query", Phase::PREPARED)?;
        let session = self.session()?;

        let metadata = {
            let mut conn = session.lock().await;
            conn.execute().await?;
            conn.metadata_query().await?
        };

        self.statement.kind = metadata.kind;
        self.statement.input = Arc::new(metadata.input);
        self.statement.output = Arc::new(metadata.output);
        match metadata.kind {
            StatementKind::Insert => {
                let input = &self.statement.input;
                self.slots = [ColumnBuffer::new(input), ColumnBuffer::new(input)];
                self.tracker = RowTracker::new(input.len());
            }
            StatementKind::Select => {
                self.slots[0] = ColumnBuffer::new(&self.statement.output);
            }
            _ => {}
        }
        self.statement.advance(Phase::EXECUTED);
        debug!(
            statement_id = self.statement.id,
            kind = %self.statement.kind,
            "statement executed"
        );
        Ok(())
    }

    /// Prepare and execute; on failure the server statement is closed before returning.
    pub async fn new_query_execute(&mut self, sql: &str) -> DriverResult<()> {
        let result = match self.new_query(sql).await {
            Ok(()) => self.execute_query().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.statement.phase = Phase::all();
            if let Some(session) = &self.session {
                if let Err(close) = session.lock().await.close_statement().await {
                    warn!(error = %close, "could not close failed statement");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Prepare, execute and finish a statement that carries no rows.
    pub async fn run_direct_query(&mut self, sql: &str) -> DriverResult<()> {
        self.new_query_execute(sql).await?;
        self.finish_query().await
    }

    /// Advance to the next row, flushing at the configured threshold.
    pub async fn next_row(&mut self) -> DriverResult<bool> {
        self.next_row_with_threshold(self.config.min_put_size).await
    }

    /// Advance to the next row.
    ///
    /// Inserts commit the current row and flush once the buffer holds
    /// `min_put_size` bytes. Selects move to the next fetched row and return
    /// `false` once the result is exhausted.
    pub async fn next_row_with_threshold(&mut self, min_put_size: usize) -> DriverResult<bool> {
        self.statement
            .require("next_row", Phase::PREPARED | Phase::EXECUTED)?;

        match self.statement.kind {
            StatementKind::Insert => {
                self.tracker.complete_row()?;
                self.row_count += 1;
                if self.slots[self.current].flat_size() >= min_put_size {
                    self.start_flush().await?;
                }
                Ok(true)
            }
            StatementKind::Select => {
                if self.row_count > 0 {
                    self.slots[0].advance_row(self.current_row)?;
                    self.current_row += 1;
                    if self.current_row < self.row_count {
                        return Ok(true);
                    }
                    self.row_count = 0;
                }
                self.fetch_chunk().await
            }
            StatementKind::Direct | StatementKind::Unset => {
                self.statement.advance(Phase::ROWS_DONE);
                Ok(false)
            }
        }
    }

    async fn fetch_chunk(&mut self) -> DriverResult<bool> {
        let session = self.session()?;
        let chunk = session.lock().await.fetch().await?;

        match chunk {
            Some(chunk) if chunk.rows > 0 => {
                self.slots[0].unflatten(&chunk.data, &chunk.block_sizes, chunk.rows)?;
                self.row_count = chunk.rows;
                self.current_row = 0;
                Ok(true)
            }
            _ => {
                self.statement.advance(Phase::ROWS_DONE);
                Ok(false)
            }
        }
    }

    /// Flush what is left and close the server statement.
    pub async fn finish_query(&mut self) -> DriverResult<()> {
        let executed = Phase::PREPARED | Phase::EXECUTED;
        if self.statement.phase != executed {
            self.statement.require("finish_query", executed | Phase::ROWS_DONE)?;
        }
        let session = self.session()?;

        if self.statement.kind == StatementKind::Insert {
            let unfinished = self.tracker.missing();
            if unfinished.len() != self.statement.input.len() {
                return Err(StateError::ColumnsNotSet {
                    missing: unfinished,
                }
                .into());
            }
        }
        self.statement.advance(Phase::ROWS_DONE);

        if self.statement.kind == StatementKind::Insert {
            self.join_flush().await?;
            let buffer = &self.slots[self.current];
            if buffer.flat_size() > 0 {
                let data = buffer.flatten();
                session.lock().await.put(self.row_count, &data).await?;
                trace!(rows = self.row_count, bytes = data.len(), "flushed final rows");
            }
            self.row_count = 0;
            self.slots[self.current].clear();
        }

        session.lock().await.close_statement().await?;
        self.statement.advance(Phase::FINISHED);
        debug!(statement_id = self.statement.id, "statement finished");
        Ok(())
    }

    // ========================================================================
    // Background flush
    // ========================================================================

    /// Hand the current buffer to a flush task and continue in the other one.
    async fn start_flush(&mut self) -> DriverResult<()> {
        self.join_flush().await?;

        let session = self.session()?;
        let slot = self.current;
        let mut buffer = std::mem::take(&mut self.slots[slot]);
        let rows = std::mem::replace(&mut self.row_count, 0);

        let handle = tokio::spawn(async move {
            let data = buffer.flatten();
            session.lock().await.put(rows, &data).await?;
            trace!(rows, bytes = data.len(), "flushed buffer");
            buffer.clear();
            Ok::<_, DriverError>(buffer)
        });

        self.pending = Some(PendingFlush { slot, handle });
        self.current = 1 - slot;
        self.slots[self.current].clear();
        Ok(())
    }

    /// Wait for the in-flight flush, returning its buffer to its slot.
    async fn join_flush(&mut self) -> DriverResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        match pending.handle.await {
            Ok(Ok(buffer)) => {
                self.slots[pending.slot] = buffer;
                Ok(())
            }
            Ok(Err(e)) => {
                self.slots[pending.slot] = ColumnBuffer::new(&self.statement.input);
                Err(e)
            }
            Err(e) => {
                self.slots[pending.slot] = ColumnBuffer::new(&self.statement.input);
                Err(DriverError::Transport(io::Error::other(e)))
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn phase(&self) -> Phase {
        self.statement.phase
    }

    pub fn statement_id(&self) -> DriverResult<u32> {
        self.statement.require_reached("statement_id", Phase::PREPARED)?;
        Ok(self.statement.id)
    }

    pub fn statement_kind(&self) -> DriverResult<StatementKind> {
        self.statement
            .require_reached("statement_kind", Phase::PREPARED | Phase::EXECUTED)?;
        Ok(self.statement.kind)
    }

    /// Input columns for an insert, output columns for a select, none otherwise.
    pub fn metadata(&self) -> DriverResult<&[Column]> {
        self.statement.require_reached("metadata", Phase::PREPARED)?;
        Ok(self.statement.columns())
    }

    pub fn is_nullable<C: ColumnRef>(&self, col: C) -> DriverResult<bool> {
        self.statement
            .require_reached("is_nullable", Phase::PREPARED | Phase::EXECUTED)?;
        let columns = self.statement.columns();
        let index = col.resolve(columns)?;
        Ok(columns[index].nullable)
    }

    // ========================================================================
    // Reading rows
    // ========================================================================

    /// Output column index of `col` for the row under the cursor.
    fn read_position<C: ColumnRef>(&self, operation: &'static str, col: C) -> DriverResult<usize> {
        if self.statement.kind != StatementKind::Select {
            return Err(StateError::WrongStatementKind {
                operation,
                kind: self.statement.kind.as_str(),
            }
            .into());
        }
        self.statement
            .require(operation, Phase::PREPARED | Phase::EXECUTED)?;
        if self.current_row >= self.row_count {
            return Err(StateError::OrderViolation {
                operation,
                phase: "no current row".to_string(),
            }
            .into());
        }
        Ok(col.resolve(&self.statement.output)?)
    }

    pub fn is_null<C: ColumnRef>(&self, col: C) -> DriverResult<bool> {
        let index = self.read_position("is_null", col)?;
        self.slots[0].is_null(index, self.current_row)
    }

    /// Read a cell of the current row, `Value::Null` for nulls.
    pub fn get<C: ColumnRef>(&self, col: C) -> DriverResult<Value> {
        let index = self.read_position("get", col)?;
        self.decode_cell(index)
    }

    fn decode_cell(&self, index: usize) -> DriverResult<Value> {
        let buffer = &self.slots[0];
        let row = self.current_row;
        if buffer.is_null(index, row)? {
            return Ok(Value::Null);
        }

        let column = &self.statement.output[index];
        let raw = if column.is_variable() {
            buffer.blob(index, row)?
        } else {
            buffer.fixed(index, row)?
        };
        Ok(Value::decode(column, index, raw)?)
    }

    fn get_typed(
        &self,
        index: usize,
        expected: &'static str,
        accept: impl Fn(&ColumnType) -> bool,
    ) -> DriverResult<Value> {
        let column = &self.statement.output[index];
        if !accept(&column.column_type) {
            return Err(ValueError::TypeMismatch {
                column: index,
                expected,
                actual: column.column_type.name().to_string(),
            }
            .into());
        }
        self.decode_cell(index)
    }

    /// Typed read; `None` for nulls.
    pub fn get_as<T: FromValue, C: ColumnRef>(&self, col: C) -> DriverResult<Option<T>> {
        let index = self.read_position("get", col)?;
        let value = self.get_typed(index, T::COLUMN_TYPE, |ty| ty.name() == T::COLUMN_TYPE)?;
        Ok(T::from_value(value))
    }

    pub fn get_bool<C: ColumnRef>(&self, col: C) -> DriverResult<Option<bool>> {
        self.get_as(col)
    }

    pub fn get_ubyte<C: ColumnRef>(&self, col: C) -> DriverResult<Option<u8>> {
        self.get_as(col)
    }

    pub fn get_short<C: ColumnRef>(&self, col: C) -> DriverResult<Option<i16>> {
        self.get_as(col)
    }

    pub fn get_int<C: ColumnRef>(&self, col: C) -> DriverResult<Option<i32>> {
        self.get_as(col)
    }

    pub fn get_long<C: ColumnRef>(&self, col: C) -> DriverResult<Option<i64>> {
        self.get_as(col)
    }

    pub fn get_float<C: ColumnRef>(&self, col: C) -> DriverResult<Option<f32>> {
        self.get_as(col)
    }

    pub fn get_double<C: ColumnRef>(&self, col: C) -> DriverResult<Option<f64>> {
        self.get_as(col)
    }

    pub fn get_date<C: ColumnRef>(&self, col: C) -> DriverResult<Option<Date>> {
        self.get_as(col)
    }

    pub fn get_datetime<C: ColumnRef>(&self, col: C) -> DriverResult<Option<DateTime>> {
        self.get_as(col)
    }

    /// Fixed-width text, padded to the column width. Bytes outside UTF-8 read
    /// as Latin-1, matching the single-byte `varchar_encoding` the server announces.
    pub fn get_varchar<C: ColumnRef>(&self, col: C) -> DriverResult<Option<String>> {
        let index = self.read_position("get", col)?;
        match self.get_typed(index, "varchar", |ty| *ty == ColumnType::Varchar)? {
            Value::Varchar(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    pub fn get_nvarchar<C: ColumnRef>(&self, col: C) -> DriverResult<Option<String>> {
        let index = self.read_position("get", col)?;
        match self.get_typed(index, "nvarchar", |ty| *ty == ColumnType::Blob)? {
            Value::NVarchar(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    // ========================================================================
    // Writing rows
    // ========================================================================

    fn write_position(&self, operation: &'static str, col: usize) -> DriverResult<usize> {
        if self.statement.kind != StatementKind::Insert {
            return Err(StateError::WrongStatementKind {
                operation,
                kind: self.statement.kind.as_str(),
            }
            .into());
        }
        self.statement
            .require(operation, Phase::PREPARED | Phase::EXECUTED)?;
        let index = col.resolve(&self.statement.input)?;
        if self.tracker.is_set(index) {
            return Err(StateError::ColumnAlreadySet { column: index }.into());
        }
        Ok(index)
    }

    /// Write a cell of the current insert row.
    pub fn set(&mut self, col: usize, value: Value) -> DriverResult<()> {
        if value.is_null() {
            return self.set_null(col);
        }
        let index = self.write_position("set", col)?;
        let cell = value.encode(&self.statement.input[index], index)?;
        self.slots[self.current].push(index, &cell);
        self.tracker.mark(index)?;
        Ok(())
    }

    pub fn set_null(&mut self, col: usize) -> DriverResult<()> {
        let index = self.write_position("set_null", col)?;
        if !self.statement.input[index].nullable {
            return Err(ValueError::NotNullable { column: index }.into());
        }
        self.slots[self.current].push_null(index);
        self.tracker.mark(index)?;
        Ok(())
    }

    /// Insert columns carry no names, so they can only be set by index.
    pub fn set_by_name(&mut self, _name: &str, _value: Value) -> DriverResult<()> {
        Err(StateError::NamedSetUnsupported.into())
    }

    pub fn set_bool(&mut self, col: usize, value: bool) -> DriverResult<()> {
        self.set(col, Value::Bool(value))
    }

    pub fn set_ubyte(&mut self, col: usize, value: u8) -> DriverResult<()> {
        self.set(col, Value::UByte(value))
    }

    pub fn set_short(&mut self, col: usize, value: i16) -> DriverResult<()> {
        self.set(col, Value::Short(value))
    }

    pub fn set_int(&mut self, col: usize, value: i32) -> DriverResult<()> {
        self.set(col, Value::Int(value))
    }

    pub fn set_long(&mut self, col: usize, value: i64) -> DriverResult<()> {
        self.set(col, Value::Long(value))
    }

    pub fn set_float(&mut self, col: usize, value: f32) -> DriverResult<()> {
        self.set(col, Value::Float(value))
    }

    pub fn set_double(&mut self, col: usize, value: f64) -> DriverResult<()> {
        self.set(col, Value::Double(value))
    }

    pub fn set_date(&mut self, col: usize, value: Date) -> DriverResult<()> {
        self.set(col, Value::Date(value))
    }

    pub fn set_datetime(&mut self, col: usize, value: DateTime) -> DriverResult<()> {
        self.set(col, Value::DateTime(value))
    }

    pub fn set_varchar(&mut self, col: usize, value: &str) -> DriverResult<()> {
        self.set(col, Value::Varchar(value.to_string()))
    }

    pub fn set_nvarchar(&mut self, col: usize, value: &str) -> DriverResult<()> {
        self.set(col, Value::NVarchar(value.to_string()))
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let pending = self.pending.take();
        let close_statement = self.statement.is_open();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(pending) = pending {
                        if let Ok(Err(e)) = pending.handle.await {
                            warn!(error = %e, "flush failed while dropping driver");
                        }
                    }
                    let mut conn = session.lock().await;
                    if close_statement {
                        if let Err(e) = conn.close_statement().await {
                            warn!(error = %e, "could not close statement while dropping driver");
                        }
                    }
                    if let Err(e) = conn.close().await {
                        warn!(error = %e, "could not close session while dropping driver");
                    }
                });
            }
            Err(_) => warn!("driver dropped outside a runtime; session not closed"),
        }
    }
}
