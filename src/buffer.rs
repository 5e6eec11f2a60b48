//! Columnar row storage.
//!
//! Each column owns one to three blocks:
//!
//! ```text
//! [null flags, 1 byte/row]   only if nullable
//! [values, width bytes/row]  or 4-byte LE lengths for variable-width text
//! [payload bytes]            only if variable-width
//! ```
//!
//! Flattening concatenates every block of every column in column order; the
//! server sends fetched chunks in the same layout together with the size of
//! each block.

use smallvec::SmallVec;

use crate::error::{DriverError, DriverResult};
use crate::types::{Cell, Column, ColumnType};

#[derive(Debug, Clone)]
struct ColumnSlot {
    nullable: bool,
    variable: bool,
    width: usize,
    pad: u8,
    blocks: SmallVec<[Vec<u8>; 3]>,
    /// Payload offset of the current and next row, indexed by `row % 2`
    ring: [usize; 2],
}

impl ColumnSlot {
    fn new(column: &Column) -> Self {
        let variable = column.is_variable();
        let block_count = 1 + column.nullable as usize + variable as usize;
        Self {
            nullable: column.nullable,
            variable,
            width: column.width(),
            pad: if column.column_type == ColumnType::Varchar { b' ' } else { 0 },
            blocks: (0..block_count).map(|_| Vec::new()).collect(),
            ring: [0, 0],
        }
    }

    fn value_block(&self) -> usize {
        self.nullable as usize
    }

    fn payload_block(&self) -> usize {
        self.value_block() + 1
    }

    fn is_null(&self, row: usize) -> DriverResult<bool> {
        if !self.nullable {
            return Ok(false);
        }
        self.blocks[0]
            .get(row)
            .map(|flag| *flag != 0)
            .ok_or_else(|| out_of_chunk(row))
    }

    fn length(&self, row: usize) -> DriverResult<usize> {
        let values = &self.blocks[self.value_block()];
        let raw: [u8; 4] = values
            .get(4 * row..4 * row + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| out_of_chunk(row))?;
        let len = i32::from_le_bytes(raw);
        usize::try_from(len)
            .map_err(|_| DriverError::protocol(format!("negative text length {} in chunk", len)))
    }

    fn clear(&mut self) {
        for block in self.blocks.iter_mut() {
            block.clear();
        }
        self.ring = [0, 0];
    }
}

fn out_of_chunk(row: usize) -> DriverError {
    DriverError::protocol(format!("row {} lies outside the fetched chunk", row))
}

/// One buffer of the insert double-buffer, or the current fetched chunk.
#[derive(Debug, Clone, Default)]
pub struct ColumnBuffer {
    slots: Vec<ColumnSlot>,
}

impl ColumnBuffer {
    pub fn new(columns: &[Column]) -> Self {
        let mut buffer = Self::default();
        buffer.init(columns);
        buffer
    }

    /// Lay out blocks for `columns`, discarding any previous contents.
    pub fn init(&mut self, columns: &[Column]) {
        self.slots = columns.iter().map(ColumnSlot::new).collect();
    }

    pub fn column_count(&self) -> usize {
        self.slots.len()
    }

    pub fn block_count(&self) -> usize {
        self.slots.iter().map(|s| s.blocks.len()).sum()
    }

    /// Empty every block, keeping the layout and allocations.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.clear();
        }
    }

    pub fn flat_size(&self) -> usize {
        self.slots
            .iter()
            .flat_map(|s| s.blocks.iter())
            .map(Vec::len)
            .sum()
    }

    pub fn block_sizes(&self) -> Vec<u64> {
        self.slots
            .iter()
            .flat_map(|s| s.blocks.iter())
            .map(|b| b.len() as u64)
            .collect()
    }

    pub fn flatten_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.flat_size());
        for block in self.slots.iter().flat_map(|s| s.blocks.iter()) {
            out.extend_from_slice(block);
        }
    }

    pub fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.flat_size());
        self.flatten_into(&mut out);
        out
    }

    /// Redistribute a fetched payload holding `rows` rows into the blocks.
    pub fn unflatten(&mut self, data: &[u8], block_sizes: &[u64], rows: usize) -> DriverResult<()> {
        if block_sizes.len() != self.block_count() {
            return Err(DriverError::protocol(format!(
                "chunk has {} blocks, statement layout has {}",
                block_sizes.len(),
                self.block_count()
            )));
        }
        let total: u64 = block_sizes.iter().sum();
        if total != data.len() as u64 {
            return Err(DriverError::protocol(format!(
                "chunk of {} bytes does not match block sizes totalling {}",
                data.len(),
                total
            )));
        }

        let mut offset = 0usize;
        let mut sizes = block_sizes.iter();
        for slot in self.slots.iter_mut() {
            slot.ring = [0, 0];
            for block in slot.blocks.iter_mut() {
                let size = sizes.next().copied().unwrap_or(0) as usize;
                block.clear();
                block.extend_from_slice(&data[offset..offset + size]);
                offset += size;
            }

            let needed = rows * slot.width;
            if (slot.nullable && slot.blocks[0].len() < rows)
                || slot.blocks[slot.value_block()].len() < needed
            {
                return Err(DriverError::protocol(format!(
                    "chunk blocks are too short for {} rows",
                    rows
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Append a value to `col`, preceded by a `0` null flag for nullable columns.
    pub fn push(&mut self, col: usize, cell: &Cell<'_>) {
        let slot = &mut self.slots[col];
        if slot.nullable {
            slot.blocks[0].push(0);
        }
        let value_block = slot.value_block();
        match cell {
            Cell::Fixed(bytes) => slot.blocks[value_block].extend_from_slice(bytes),
            Cell::Blob(bytes) => {
                slot.blocks[value_block].extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                let payload_block = slot.payload_block();
                slot.blocks[payload_block].extend_from_slice(bytes);
            }
        }
    }

    /// Append a null: flag `1` plus a placeholder the width of the column.
    ///
    /// The caller checks that the column is nullable.
    pub fn push_null(&mut self, col: usize) {
        let slot = &mut self.slots[col];
        slot.blocks[0].push(1);
        let (width, pad) = (slot.width, slot.pad);
        let value_block = slot.value_block();
        let values = &mut slot.blocks[value_block];
        values.resize(values.len() + width, pad);
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn is_null(&self, col: usize, row: usize) -> DriverResult<bool> {
        self.slots[col].is_null(row)
    }

    /// The `width`-byte value of a fixed-width column.
    pub fn fixed(&self, col: usize, row: usize) -> DriverResult<&[u8]> {
        let slot = &self.slots[col];
        let start = slot.width * row;
        slot.blocks[slot.value_block()]
            .get(start..start + slot.width)
            .ok_or_else(|| out_of_chunk(row))
    }

    /// The payload of a variable-width column, located through the offset ring.
    pub fn blob(&self, col: usize, row: usize) -> DriverResult<&[u8]> {
        let slot = &self.slots[col];
        let len = slot.length(row)?;
        let start = slot.ring[row % 2];
        slot.blocks[slot.payload_block()]
            .get(start..start + len)
            .ok_or_else(|| {
                DriverError::protocol(format!("text of row {} runs past the payload block", row))
            })
    }

    /// Move every offset ring past `row`.
    ///
    /// Null rows consume no payload, whether or not the caller asked `is_null`.
    pub fn advance_row(&mut self, row: usize) -> DriverResult<()> {
        for slot in self.slots.iter_mut().filter(|s| s.variable) {
            let consumed = if slot.is_null(row)? { 0 } else { slot.length(row)? };
            slot.ring[(row + 1) % 2] = slot.ring[row % 2] + consumed;
        }
        Ok(())
    }
}
