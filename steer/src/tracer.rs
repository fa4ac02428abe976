//! The per-tick trace file.
//!
//! Tab-separated text: a header naming the fixed columns (`TIME`,
//! `REGION_ID#`, `ENERGY_PACKAGE`, `POWER_PACKAGE`, `FREQUENCY`) followed
//! by the agent's declared columns, then one row per controller tick.
//! Region ids print as hex; everything else as a double.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::helper::format_float;
use crate::platform::msr::signal_to_field;

/// Column names every trace carries, in order.
pub const FIXED_COLUMNS: [&str; 5] =
    ["TIME", "REGION_ID#", "ENERGY_PACKAGE", "POWER_PACKAGE", "FREQUENCY"];

/// Buffered writer for one node's trace.
pub struct Tracer {
    writer: Option<BufWriter<File>>,
    num_column: usize,
}

impl Tracer {
    /// Opens the trace at `path`, or a disabled tracer for `None`.
    pub fn new(path: Option<&Path>) -> Result<Tracer> {
        let writer = match path {
            Some(path) => {
                let file = File::create(path)
                    .map_err(|err| Error::io(path.display().to_string(), err))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Tracer { writer, num_column: 0 })
    }

    /// Writes the header row: the fixed columns then `agent_columns`.
    pub fn columns(&mut self, agent_columns: &[String]) -> Result<()> {
        self.num_column = FIXED_COLUMNS.len() + agent_columns.len();
        let Some(writer) = &mut self.writer else {
            return Ok(());
        };
        let mut names: Vec<&str> = FIXED_COLUMNS.to_vec();
        names.extend(agent_columns.iter().map(String::as_str));
        writeln!(writer, "{}", names.join("\t"))
            .map_err(|err| Error::io("trace", err))
    }

    /// Appends one tick's row; `values` follows the header layout.
    pub fn update(&mut self, values: &[f64]) -> Result<()> {
        let Some(writer) = &mut self.writer else {
            return Ok(());
        };
        if values.len() != self.num_column {
            return Err(Error::InvalidArgument(format!(
                "trace row of {} values does not match {} columns",
                values.len(), self.num_column)));
        }
        let mut row = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            if index == 1 {
                row.push(format!("0x{:016x}", signal_to_field(*value)));
            }
            else {
                row.push(format_float(*value));
            }
        }
        writeln!(writer, "{}", row.join("\t")).map_err(|err| Error::io("trace", err))
    }

    /// Flushes buffered rows to disk.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush().map_err(|err| Error::io("trace", err))?;
        }
        Ok(())
    }
}
